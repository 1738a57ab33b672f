//! ELF32/ELF64 kernel loader
//!
//! Parsing reads headers through [`FileRead`] so compressed images never
//! have to be inflated into one buffer. Loading happens in three passes:
//! every check that can reject the image runs first, then all physical
//! memory is claimed, and only then are mappings committed and bytes
//! copied. A failure in the first two passes leaves the address space
//! untouched.

mod reloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::fs::FileRead;
use crate::memory::{AllocFlags, AllocRequest, MemoryManager, PhysicalMemory, RegionKind};
use crate::mmu::{MapFlags, MmuContext, PagingMode};
use crate::{align_down, align_up, checked_align_up, Error, Result, PAGE_SIZE};

pub const ELF_MAGIC: [u8; 4] = *b"\x7fELF";

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_386: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// Largest alignment honoured when placing a relocatable image.
const MAX_PLACEMENT_ALIGN: u64 = 0x20_0000;
const COPY_CHUNK: usize = 0x1000;
/// Upper bound on the program header table read into memory.
const MAX_PHDR_TABLE: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: ElfClass,
    pub kind: u16,
    pub machine: u16,
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::NONE;
        if self.flags & PF_W != 0 {
            flags = flags | MapFlags::WRITE;
        }
        if self.flags & PF_X != 0 {
            flags = flags | MapFlags::EXEC;
        }
        flags
    }

    fn contains_vaddr(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr - self.vaddr < self.mem_size
    }
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le64(b: &[u8], at: usize) -> u64 {
    (le32(b, at) as u64) | ((le32(b, at + 4) as u64) << 32)
}

/// A validated image: header plus its program headers.
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub header: ElfHeader,
    pub phdrs: Vec<ProgramHeader>,
}

impl ElfImage {
    /// Read and validate the ELF and program headers.
    pub fn parse<R: FileRead + ?Sized>(file: &mut R) -> Result<Self> {
        let mut raw = [0u8; 64];
        let size = file.size();
        if size < 52 {
            return Err(Error::Invalid);
        }
        let head = (size.min(64)) as usize;
        file.read_exact_at(0, &mut raw[..head])?;

        if raw[..4] != ELF_MAGIC {
            log::warn!("elf: bad magic");
            return Err(Error::Invalid);
        }
        if raw[5] != ELFDATA2LSB {
            log::warn!("elf: not little-endian");
            return Err(Error::Invalid);
        }

        let header = match raw[4] {
            ELFCLASS32 => ElfHeader {
                class: ElfClass::Elf32,
                kind: le16(&raw, 16),
                machine: le16(&raw, 18),
                entry: le32(&raw, 24) as u64,
                phoff: le32(&raw, 28) as u64,
                phentsize: le16(&raw, 42),
                phnum: le16(&raw, 44),
            },
            ELFCLASS64 if head == 64 => ElfHeader {
                class: ElfClass::Elf64,
                kind: le16(&raw, 16),
                machine: le16(&raw, 18),
                entry: le64(&raw, 24),
                phoff: le64(&raw, 32),
                phentsize: le16(&raw, 54),
                phnum: le16(&raw, 56),
            },
            class => {
                log::warn!("elf: unsupported class {}", class);
                return Err(Error::Invalid);
            }
        };

        let machine_ok = match header.class {
            ElfClass::Elf32 => header.machine == EM_386,
            ElfClass::Elf64 => header.machine == EM_X86_64,
        };
        if !machine_ok {
            log::warn!("elf: machine {} does not match class", header.machine);
            return Err(Error::Invalid);
        }
        if header.kind != ET_EXEC && header.kind != ET_DYN {
            log::warn!("elf: type {} is not executable", header.kind);
            return Err(Error::Invalid);
        }

        let entry_size: u16 = match header.class {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        };
        if header.phnum == 0 || header.phnum == 0xFFFF || header.phentsize < entry_size {
            log::warn!("elf: no usable program headers");
            return Err(Error::Invalid);
        }
        let table_len = header.phentsize as u64 * header.phnum as u64;
        if table_len > MAX_PHDR_TABLE
            || header.phoff.checked_add(table_len).map_or(true, |end| end > size)
        {
            return Err(Error::Invalid);
        }

        let mut table = vec![0u8; table_len as usize];
        file.read_exact_at(header.phoff, &mut table)?;
        let phdrs = table
            .chunks_exact(header.phentsize as usize)
            .map(|p| match header.class {
                ElfClass::Elf32 => ProgramHeader {
                    p_type: le32(p, 0),
                    offset: le32(p, 4) as u64,
                    vaddr: le32(p, 8) as u64,
                    paddr: le32(p, 12) as u64,
                    file_size: le32(p, 16) as u64,
                    mem_size: le32(p, 20) as u64,
                    flags: le32(p, 24),
                    align: le32(p, 28) as u64,
                },
                ElfClass::Elf64 => ProgramHeader {
                    p_type: le32(p, 0),
                    flags: le32(p, 4),
                    offset: le64(p, 8),
                    vaddr: le64(p, 16),
                    paddr: le64(p, 24),
                    file_size: le64(p, 32),
                    mem_size: le64(p, 40),
                    align: le64(p, 48),
                },
            })
            .collect();

        Ok(Self { header, phdrs })
    }

    pub fn is_relocatable(&self) -> bool {
        self.header.kind == ET_DYN
    }

    /// `PT_LOAD` entries that occupy memory.
    pub fn load_segments(&self) -> impl Iterator<Item = &ProgramHeader> + '_ {
        self.phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD && p.mem_size > 0)
    }

    /// Paging mode to enter the kernel in.
    ///
    /// ELF64 runs in long mode, ELF32 in plain ia32 unless PAE is asked
    /// for. An explicit request that contradicts the class is rejected.
    pub fn target_mode(&self, requested: Option<PagingMode>) -> Result<PagingMode> {
        match (self.header.class, requested) {
            (ElfClass::Elf64, None | Some(PagingMode::Long)) => Ok(PagingMode::Long),
            (ElfClass::Elf32, None | Some(PagingMode::Ia32)) => Ok(PagingMode::Ia32),
            (ElfClass::Elf32, Some(PagingMode::Pae)) => Ok(PagingMode::Pae),
            (class, Some(mode)) => {
                log::warn!("elf: {:?} image cannot run in {} mode", class, mode.name());
                Err(Error::Invalid)
            }
        }
    }
}

/// Where an image ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Virtual entry point, bias applied
    pub entry: u64,
    /// Added to every link-time address (zero for `ET_EXEC`)
    pub bias: u64,
    /// Physical regions tagged kernel, as `(base, size)`
    pub regions: Vec<(u64, u64)>,
    /// Committed `PT_LOAD` mappings
    pub segments: usize,
    pub relocations: usize,
}

/// Page-granular run covering one or more segments.
#[derive(Debug, Clone, Copy)]
struct Span {
    virt: u64,
    phys: u64,
    size: u64,
    flags: MapFlags,
}

/// Load `image` from `file` into `ctx`, allocating from `mem`.
pub fn load<R, M>(
    file: &mut R,
    image: &ElfImage,
    ctx: &mut MmuContext,
    mem: &mut MemoryManager,
    phys: &mut M,
) -> Result<LoadedImage>
where
    R: FileRead + ?Sized,
    M: PhysicalMemory + ?Sized,
{
    let segments: Vec<ProgramHeader> = image.load_segments().copied().collect();
    validate_segments(&segments, file.size())?;

    let entry_ok = segments
        .iter()
        .any(|s| s.flags & PF_X != 0 && s.contains_vaddr(image.header.entry));
    if !entry_ok {
        log::warn!("elf: entry {:#x} is not in an executable segment", image.header.entry);
        return Err(Error::Invalid);
    }

    let below_4g = !ctx.mode().is_64bit();
    let (bias, spans) = if image.is_relocatable() {
        place_relocatable(&segments, mem, below_4g)?
    } else {
        (0, place_fixed(&segments, mem)?)
    };

    for span in &spans {
        phys.fill(span.phys, 0, span.size)?;
        ctx.map(mem, phys, span.virt, span.phys, span.size, span.flags)?;
    }

    let mut buf = vec![0u8; COPY_CHUNK];
    for seg in &segments {
        let mut done = 0u64;
        while done < seg.file_size {
            let n = ((seg.file_size - done) as usize).min(COPY_CHUNK);
            file.read_exact_at(seg.offset + done, &mut buf[..n])?;
            ctx.memcpy_to(phys, seg.vaddr.wrapping_add(bias) + done, &buf[..n])?;
            done += n as u64;
        }
    }

    let relocations = if image.is_relocatable() {
        reloc::apply(image, ctx, phys, bias)?
    } else {
        0
    };

    let entry = image.header.entry.wrapping_add(bias);
    log::info!(
        "elf: {:?} {} loaded, {} segments, entry {:#x}",
        image.header.class,
        if image.is_relocatable() { "ET_DYN" } else { "ET_EXEC" },
        segments.len(),
        entry
    );

    Ok(LoadedImage {
        entry,
        bias,
        regions: spans.iter().map(|s| (s.phys, s.size)).collect(),
        segments: segments.len(),
        relocations,
    })
}

/// Reject malformed or overlapping segments before anything is touched.
fn validate_segments(segments: &[ProgramHeader], file_size: u64) -> Result<()> {
    for seg in segments {
        let file_end = seg.offset.checked_add(seg.file_size);
        if seg.file_size > seg.mem_size
            || file_end.map_or(true, |end| end > file_size)
            || seg
                .vaddr
                .checked_add(seg.mem_size)
                .and_then(|end| checked_align_up(end, PAGE_SIZE))
                .is_none()
        {
            log::warn!("elf: malformed segment at {:#x}", seg.vaddr);
            return Err(Error::Invalid);
        }
    }

    let mut sorted: Vec<&ProgramHeader> = segments.iter().collect();
    sorted.sort_by_key(|s| s.vaddr);
    for pair in sorted.windows(2) {
        if pair[0].vaddr + pair[0].mem_size > pair[1].vaddr {
            log::warn!(
                "elf: segments at {:#x} and {:#x} overlap",
                pair[0].vaddr,
                pair[1].vaddr
            );
            return Err(Error::Invalid);
        }
    }
    Ok(())
}

/// Page-round each segment and merge runs that share pages.
fn spans_of(segments: &[ProgramHeader], to_phys: impl Fn(&ProgramHeader) -> u64, bias: u64) -> Result<Vec<Span>> {
    let mut sorted: Vec<&ProgramHeader> = segments.iter().collect();
    sorted.sort_by_key(|s| s.vaddr);

    let mut spans: Vec<Span> = Vec::new();
    for seg in sorted {
        let virt = align_down(seg.vaddr, PAGE_SIZE);
        let end = align_up(seg.vaddr + seg.mem_size, PAGE_SIZE);
        let phys = align_down(to_phys(seg), PAGE_SIZE);
        let span = Span {
            virt: virt.wrapping_add(bias),
            phys,
            size: end - virt,
            flags: seg.map_flags(),
        };

        match spans.last_mut() {
            Some(last) if last.virt + last.size > span.virt => {
                // Shared page: only mergeable if both agree on placement.
                if last.phys.wrapping_sub(last.virt) != span.phys.wrapping_sub(span.virt) {
                    return Err(Error::Invalid);
                }
                last.size = (span.virt + span.size).max(last.virt + last.size) - last.virt;
                last.flags = last.flags | span.flags;
            }
            _ => spans.push(span),
        }
    }
    Ok(spans)
}

/// `ET_EXEC`: every segment goes exactly where `p_paddr` says.
fn place_fixed(segments: &[ProgramHeader], mem: &mut MemoryManager) -> Result<Vec<Span>> {
    if segments.iter().any(|s| s.vaddr % PAGE_SIZE != s.paddr % PAGE_SIZE) {
        log::warn!("elf: physical and virtual page offsets differ");
        return Err(Error::Invalid);
    }
    let spans = spans_of(segments, |s| s.paddr, 0)?;
    for span in &spans {
        mem.allocate_at(span.phys, span.size, RegionKind::Kernel, "kernel")
            .map_err(|e| {
                log::warn!(
                    "elf: cannot place {:#x} bytes at {:#x}",
                    span.size,
                    span.phys
                );
                e
            })?;
    }
    Ok(spans)
}

/// `ET_DYN`: one block wherever it fits, mapped at its physical address.
fn place_relocatable(
    segments: &[ProgramHeader],
    mem: &mut MemoryManager,
    below_4g: bool,
) -> Result<(u64, Vec<Span>)> {
    let low = segments
        .iter()
        .map(|s| align_down(s.vaddr, PAGE_SIZE))
        .min()
        .ok_or(Error::Invalid)?;
    let high = segments
        .iter()
        .map(|s| align_up(s.vaddr + s.mem_size, PAGE_SIZE))
        .max()
        .ok_or(Error::Invalid)?;
    let align = segments
        .iter()
        .map(|s| s.align)
        .filter(|a| a.is_power_of_two())
        .max()
        .unwrap_or(PAGE_SIZE)
        .clamp(PAGE_SIZE, MAX_PLACEMENT_ALIGN);

    let mut req = AllocRequest::new(high - low, RegionKind::Kernel)
        .align(align)
        .owner("kernel");
    if below_4g {
        req = req.flags(AllocFlags::BELOW_4G);
    }
    let base = mem.allocate_with(req)?;
    let bias = base.wrapping_sub(low);
    log::debug!("elf: relocatable image at {:#x} (bias {:#x})", base, bias);

    let spans = spans_of(segments, |s| s.vaddr.wrapping_add(bias), bias)?;
    Ok((bias, spans))
}
