//! Boot configuration file
//!
//! ```text
//! set "timeout" 5
//! set "default" "Linux"
//! entry "Linux" {
//!     kernel "/boot/kernel"
//!     cmdline "root=/dev/sda1"
//!     module "/boot/initrd.img" "initrd"
//! }
//! ```
//!
//! A file is a list of commands, one per line (or separated by `;`). Each
//! command is a name followed by values: quoted strings, integers,
//! `true`/`false`, `[ ... ]` lists, or a `{ ... }` block holding a nested
//! command list. Parsing builds that tree first and the tree is then
//! interpreted into a [`BootConfig`].

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::mmu::PagingMode;
use crate::{Error, Result};

/// Searched in this order on every mounted filesystem.
pub const CONFIG_PATHS: [&str; 3] = ["/system/boot/laos.cfg", "/boot/laos.cfg", "/laos.cfg"];

pub const DEFAULT_KERNEL: &str = "/boot/kernel";
pub const DEFAULT_TIMEOUT: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(u64),
    Boolean(bool),
    String(String),
    List(Vec<Value>),
    Commands(Vec<Command>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Commands(_) => "command list",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Value>,
    pub line: usize,
    pub col: usize,
}

/// Where a syntax or semantic error was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub title: String,
    /// Registry id; `None` means the first device holding the kernel
    pub device: Option<String>,
    pub kernel: String,
    pub cmdline: String,
    pub modules: Vec<ModuleRef>,
    pub mode: Option<PagingMode>,
}

impl BootEntry {
    pub fn new(title: &str, kernel: &str) -> Self {
        Self {
            title: title.to_string(),
            device: None,
            kernel: kernel.to_string(),
            cmdline: String::new(),
            modules: Vec::new(),
            mode: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultEntry {
    Title(String),
    Index(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Menu countdown in seconds; zero boots immediately
    pub timeout: u64,
    pub default: Option<DefaultEntry>,
    pub debug: bool,
    pub entries: Vec<BootEntry>,
}

impl BootConfig {
    /// What the loader boots when no configuration file exists.
    pub fn fallback() -> Self {
        Self {
            timeout: 0,
            default: None,
            debug: false,
            entries: alloc::vec![BootEntry::new("LAOS", DEFAULT_KERNEL)],
        }
    }

    /// Index of the default entry, falling back to the first one.
    pub fn default_index(&self) -> usize {
        let found = match &self.default {
            None => Some(0),
            Some(DefaultEntry::Index(i)) => usize::try_from(*i).ok().filter(|&i| i < self.entries.len()),
            Some(DefaultEntry::Title(t)) => self.entries.iter().position(|e| &e.title == t),
        };
        found.unwrap_or_else(|| {
            log::warn!("config: default entry {:?} not found", self.default);
            0
        })
    }
}

/// Parse and interpret a configuration file. Errors are logged against
/// `path` and reported as `Invalid`.
pub fn parse(text: &str, path: &str) -> Result<BootConfig> {
    let result = Parser::new(text)
        .command_list(None)
        .and_then(|commands| interpret(&commands));
    result.map_err(|e| {
        log::error!("{}:{}:{}: {}", path, e.line, e.col, e.message);
        Error::Invalid
    })
}

/// Parse into the command tree without interpreting it.
pub fn parse_commands(text: &str) -> core::result::Result<Vec<Command>, ConfigError> {
    Parser::new(text).command_list(None)
}

// ═══════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════

/// Deepest nesting of lists and blocks accepted.
const MAX_NESTING: usize = 32;

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
    depth: usize,
}

type ParseResult<T> = core::result::Result<T, ConfigError>;

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn error<T>(&self, message: &str) -> ParseResult<T> {
        Err(ConfigError {
            line: self.line,
            col: self.col,
            message: message.to_string(),
        })
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == b'\n' {
                break;
            }
            self.bump();
        }
    }

    /// Commands until `end` (or end of input when `None`).
    fn command_list(&mut self, end: Option<u8>) -> ParseResult<Vec<Command>> {
        let mut commands = Vec::new();
        loop {
            match self.peek() {
                None if end.is_none() => return Ok(commands),
                None => return self.error("unexpected end of file, expected '}'"),
                Some(ch) if Some(ch) == end => {
                    self.bump();
                    return Ok(commands);
                }
                Some(b'#') => self.skip_comment(),
                Some(ch) if ch.is_ascii_whitespace() || ch == b';' => {
                    self.bump();
                }
                Some(ch) if ch.is_ascii_alphanumeric() || ch == b'_' => {
                    commands.push(self.command(end)?);
                }
                Some(_) => return self.error("expected command name"),
            }
        }
    }

    fn command(&mut self, end: Option<u8>) -> ParseResult<Command> {
        let (line, col) = (self.line, self.col);
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-') {
            self.bump();
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        let mut args = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b';') => break,
                Some(ch) if Some(ch) == end => break,
                Some(b'#') => {
                    self.skip_comment();
                    break;
                }
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(_) => {
                    args.push(self.value()?);
                    // Values must be separated by blanks.
                    if let Some(ch) = self.peek() {
                        if !matches!(ch, b' ' | b'\t' | b'\r' | b'\n' | b';' | b'#') && Some(ch) != end {
                            return self.error("expected space");
                        }
                    }
                }
            }
        }

        Ok(Command { name, args, line, col })
    }

    fn value(&mut self) -> ParseResult<Value> {
        match self.peek() {
            Some(b'"') => {
                self.bump();
                self.string().map(Value::String)
            }
            Some(b'[') => self.nested(|p| p.list().map(Value::List)),
            Some(b'{') => self.nested(|p| p.command_list(Some(b'}')).map(Value::Commands)),
            Some(ch) if ch.is_ascii_digit() => self.integer().map(Value::Integer),
            Some(b't') | Some(b'f') => self.boolean().map(Value::Boolean),
            _ => self.error("unexpected character"),
        }
    }

    /// Consume an opening bracket and parse what it encloses.
    fn nested(&mut self, inner: impl FnOnce(&mut Self) -> ParseResult<Value>) -> ParseResult<Value> {
        if self.depth == MAX_NESTING {
            return self.error("nested too deeply");
        }
        self.bump();
        self.depth += 1;
        let value = inner(self);
        self.depth -= 1;
        value
    }

    fn string(&mut self) -> ParseResult<String> {
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return self.error("unexpected end of file, expected end of string"),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(ch) => out.push(ch),
                    None => return self.error("unexpected end of file in escape"),
                },
                Some(ch) => out.push(ch),
            }
        }
        String::from_utf8(out).or_else(|_| self.error("string is not valid UTF-8"))
    }

    fn integer(&mut self) -> ParseResult<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric()) {
            self.bump();
        }
        let text = core::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => text.parse::<u64>(),
        };
        parsed.or_else(|_| self.error("invalid integer"))
    }

    fn boolean(&mut self) -> ParseResult<bool> {
        let rest = &self.src[self.pos..];
        let (value, len) = if rest.starts_with(b"true") {
            (true, 4)
        } else if rest.starts_with(b"false") {
            (false, 5)
        } else {
            return self.error("unexpected character");
        };
        for _ in 0..len {
            self.bump();
        }
        Ok(value)
    }

    fn list(&mut self) -> ParseResult<Vec<Value>> {
        let mut values = Vec::new();
        loop {
            match self.peek() {
                None => return self.error("unexpected end of file, expected ']'"),
                Some(b']') => {
                    self.bump();
                    return Ok(values);
                }
                Some(ch) if ch.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(_) => values.push(self.value()?),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INTERPRETER
// ═══════════════════════════════════════════════════════════════════════════

fn semantic<T>(cmd: &Command, message: String) -> ParseResult<T> {
    Err(ConfigError {
        line: cmd.line,
        col: cmd.col,
        message,
    })
}

fn string_arg<'c>(cmd: &'c Command, index: usize) -> ParseResult<&'c str> {
    match cmd.args.get(index) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => semantic(
            cmd,
            alloc::format!("{}: argument {} must be a string, not {}", cmd.name, index + 1, other.type_name()),
        ),
        None => semantic(cmd, alloc::format!("{}: missing argument {}", cmd.name, index + 1)),
    }
}

fn interpret(commands: &[Command]) -> ParseResult<BootConfig> {
    let mut config = BootConfig {
        timeout: DEFAULT_TIMEOUT,
        default: None,
        debug: false,
        entries: Vec::new(),
    };

    for cmd in commands {
        match cmd.name.as_str() {
            "set" => {
                if cmd.args.len() != 2 {
                    return semantic(cmd, "set: expected a name and a value".to_string());
                }
                let name = string_arg(cmd, 0)?;
                match (name, &cmd.args[1]) {
                    ("timeout", Value::Integer(t)) => config.timeout = *t,
                    ("default", Value::Integer(i)) => config.default = Some(DefaultEntry::Index(*i)),
                    ("default", Value::String(t)) => config.default = Some(DefaultEntry::Title(t.clone())),
                    ("debug", Value::Boolean(b)) => config.debug = *b,
                    ("timeout" | "default" | "debug", other) => {
                        return semantic(
                            cmd,
                            alloc::format!("set: {} cannot be a {}", name, other.type_name()),
                        );
                    }
                    _ => log::warn!("config: ignoring unknown variable '{}'", name),
                }
            }
            "entry" => config.entries.push(interpret_entry(cmd)?),
            other => log::warn!(
                "config: line {}: ignoring unknown command '{}'",
                cmd.line,
                other
            ),
        }
    }
    Ok(config)
}

fn interpret_entry(cmd: &Command) -> ParseResult<BootEntry> {
    let title = string_arg(cmd, 0)?;
    let body = match cmd.args.get(1) {
        Some(Value::Commands(body)) if cmd.args.len() == 2 => body,
        _ => return semantic(cmd, "entry: expected a title and a { } block".to_string()),
    };

    let mut entry = BootEntry::new(title, "");
    for sub in body {
        match sub.name.as_str() {
            "device" => entry.device = Some(string_arg(sub, 0)?.to_string()),
            "kernel" => entry.kernel = string_arg(sub, 0)?.to_string(),
            "cmdline" => entry.cmdline = string_arg(sub, 0)?.to_string(),
            "module" => {
                let path = string_arg(sub, 0)?;
                let name = match sub.args.get(1) {
                    Some(_) => string_arg(sub, 1)?,
                    None => path.rsplit('/').next().unwrap_or(path),
                };
                entry.modules.push(ModuleRef {
                    path: path.to_string(),
                    name: name.to_string(),
                });
            }
            "mode" => {
                let name = string_arg(sub, 0)?;
                entry.mode = match PagingMode::from_name(name) {
                    Some(mode) => Some(mode),
                    None => return semantic(sub, alloc::format!("mode: unknown mode '{}'", name)),
                };
            }
            other => return semantic(sub, alloc::format!("unknown command '{}' in entry", other)),
        }
    }

    if entry.kernel.is_empty() {
        return semantic(cmd, alloc::format!("entry '{}' has no kernel", title));
    }
    Ok(entry)
}
