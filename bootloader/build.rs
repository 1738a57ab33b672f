// Build script: assembles the flat hand-off and real-mode blobs with NASM

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// The core copies the hand-off blob into one page, after the GDT and
/// the parameter block.
const MAX_HANDOFF_SIZE: u64 = 4096 - 0x100;
/// The real-mode thunk must fit below the bounce buffer at 0x2000.
const MAX_THUNK_SIZE: u64 = 0x1000;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let asm_dir = manifest_dir.join("asm");

    for file in ["handoff32.asm", "handoff64.asm", "enter32.inc", "thunk.asm"] {
        println!("cargo:rerun-if-changed={}", asm_dir.join(file).display());
    }

    if Command::new("nasm").arg("--version").output().is_err() {
        panic!("NASM not found; install it to build the hand-off code (https://www.nasm.us/)");
    }

    let efi = env::var_os("CARGO_FEATURE_EFI").is_some();
    let bios = env::var_os("CARGO_FEATURE_BIOS").is_some();

    if efi {
        assemble(&asm_dir, "handoff64.asm", &out_dir.join("handoff64.bin"), MAX_HANDOFF_SIZE);
    }
    if bios {
        assemble(&asm_dir, "handoff32.asm", &out_dir.join("handoff32.bin"), MAX_HANDOFF_SIZE);
        assemble(&asm_dir, "thunk.asm", &out_dir.join("thunk.bin"), MAX_THUNK_SIZE);
    }
}

fn assemble(asm_dir: &Path, source: &str, output: &Path, max_size: u64) {
    let mut include = asm_dir.as_os_str().to_owned();
    include.push("/");

    let status = Command::new("nasm")
        .arg("-f")
        .arg("bin")
        .arg("-I")
        .arg(&include)
        .arg("-o")
        .arg(output)
        .arg(asm_dir.join(source))
        .status()
        .unwrap_or_else(|e| panic!("failed to run NASM for {}: {}", source, e));

    if !status.success() {
        panic!("failed to assemble {}", source);
    }

    let size = std::fs::metadata(output)
        .unwrap_or_else(|e| panic!("no output for {}: {}", source, e))
        .len();
    if size > max_size {
        panic!("{} is {} bytes, limit is {}", source, size, max_size);
    }
}
