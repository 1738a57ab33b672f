//! Dynamic relocation of `ET_DYN` images
//!
//! Only base-relative fix-ups are meaningful for a kernel with no
//! dynamic linker around, so `R_*_RELATIVE` is applied, `R_*_NONE` is
//! skipped and anything else rejects the image.

use alloc::vec;

use super::{le32, le64, ElfClass, ElfImage, PT_DYNAMIC};
use crate::memory::PhysicalMemory;
use crate::mmu::MmuContext;
use crate::{Error, Result};

const DT_NULL: u64 = 0;
const DT_RELA: u64 = 7;
const DT_RELASZ: u64 = 8;
const DT_RELAENT: u64 = 9;
const DT_REL: u64 = 17;
const DT_RELSZ: u64 = 18;
const DT_RELENT: u64 = 19;

/// `R_X86_64_NONE` and `R_386_NONE`
const R_NONE: u32 = 0;
/// `R_X86_64_RELATIVE` and `R_386_RELATIVE` share the number.
const R_RELATIVE: u32 = 8;

#[derive(Debug, Default, Clone, Copy)]
struct Table {
    addr: u64,
    size: u64,
    entsize: u64,
}

/// Apply the image's relocation tables. Returns how many were applied.
pub(super) fn apply<M: PhysicalMemory + ?Sized>(
    image: &ElfImage,
    ctx: &MmuContext,
    phys: &mut M,
    bias: u64,
) -> Result<usize> {
    let Some(dynamic) = image.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
        return Ok(0);
    };
    let word = match image.header.class {
        ElfClass::Elf32 => 4,
        ElfClass::Elf64 => 8,
    };

    let span = mapped_span(image, bias);
    let dynamic_at = dynamic.vaddr.wrapping_add(bias);
    if !within(span, dynamic_at, dynamic.file_size) {
        log::warn!("elf: dynamic section outside the loaded image");
        return Err(Error::Invalid);
    }
    let mut raw = vec![0u8; dynamic.file_size as usize];
    ctx.memcpy_from(phys, dynamic_at, &mut raw)?;

    let mut rela = Table::default();
    let mut rel = Table::default();
    for entry in raw.chunks_exact(word * 2) {
        let (tag, value) = match image.header.class {
            ElfClass::Elf32 => (le32(entry, 0) as u64, le32(entry, 4) as u64),
            ElfClass::Elf64 => (le64(entry, 0), le64(entry, 8)),
        };
        match tag {
            DT_NULL => break,
            DT_RELA => rela.addr = value,
            DT_RELASZ => rela.size = value,
            DT_RELAENT => rela.entsize = value,
            DT_REL => rel.addr = value,
            DT_RELSZ => rel.size = value,
            DT_RELENT => rel.entsize = value,
            _ => {}
        }
    }

    let mut applied = 0;
    if rela.size > 0 {
        applied += apply_table(image.header.class, rela, true, span, ctx, phys, bias)?;
    }
    if rel.size > 0 {
        applied += apply_table(image.header.class, rel, false, span, ctx, phys, bias)?;
    }
    log::debug!("elf: {} relocations applied", applied);
    Ok(applied)
}

/// `[start, end)` of the image's loaded range, bias applied.
fn mapped_span(image: &ElfImage, bias: u64) -> (u64, u64) {
    let start = image.load_segments().map(|s| s.vaddr).min().unwrap_or(0);
    let end = image
        .load_segments()
        .map(|s| s.vaddr.saturating_add(s.mem_size))
        .max()
        .unwrap_or(0);
    (start.wrapping_add(bias), end.wrapping_add(bias))
}

fn within(span: (u64, u64), at: u64, len: u64) -> bool {
    at >= span.0 && at.checked_add(len).map_or(false, |end| end <= span.1)
}

fn apply_table<M: PhysicalMemory + ?Sized>(
    class: ElfClass,
    table: Table,
    explicit_addend: bool,
    span: (u64, u64),
    ctx: &MmuContext,
    phys: &mut M,
    bias: u64,
) -> Result<usize> {
    let word: u64 = match class {
        ElfClass::Elf32 => 4,
        ElfClass::Elf64 => 8,
    };
    let expected = if explicit_addend { word * 3 } else { word * 2 };
    if table.entsize < expected || table.size % table.entsize != 0 {
        log::warn!("elf: bad relocation table entry size {}", table.entsize);
        return Err(Error::Invalid);
    }

    let table_at = table.addr.wrapping_add(bias);
    if !within(span, table_at, table.size) {
        log::warn!(
            "elf: relocation table {:#x}+{:#x} outside the loaded image",
            table.addr,
            table.size
        );
        return Err(Error::Invalid);
    }
    let mut raw = vec![0u8; table.size as usize];
    ctx.memcpy_from(phys, table_at, &mut raw)?;

    let mut applied = 0;
    for entry in raw.chunks_exact(table.entsize as usize) {
        let (offset, kind, addend) = match class {
            ElfClass::Elf32 => (
                le32(entry, 0) as u64,
                le32(entry, 4) & 0xFF,
                explicit_addend.then(|| le32(entry, 8) as i32 as i64 as u64),
            ),
            ElfClass::Elf64 => (
                le64(entry, 0),
                le64(entry, 8) as u32,
                explicit_addend.then(|| le64(entry, 16)),
            ),
        };

        match kind {
            R_NONE => continue,
            R_RELATIVE => {}
            other => {
                log::warn!("elf: relocation type {} not supported", other);
                return Err(Error::Invalid);
            }
        }

        let target = offset.wrapping_add(bias);
        let mut slot = [0u8; 8];
        let slot = &mut slot[..word as usize];
        let addend = match addend {
            Some(addend) => addend,
            None => {
                ctx.memcpy_from(phys, target, slot)?;
                match class {
                    ElfClass::Elf32 => le32(slot, 0) as u64,
                    ElfClass::Elf64 => le64(slot, 0),
                }
            }
        };
        let value = bias.wrapping_add(addend);
        match class {
            ElfClass::Elf32 => slot.copy_from_slice(&(value as u32).to_le_bytes()),
            ElfClass::Elf64 => slot.copy_from_slice(&value.to_le_bytes()),
        }
        ctx.memcpy_to(phys, target, slot)?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_must_sit_inside_the_image() {
        let span = (0x20_1000, 0x20_4000);
        assert!(within(span, 0x20_1000, 0x3000));
        assert!(within(span, 0x20_3FF0, 0x10));
        assert!(!within(span, 0x20_3FF0, 0x11));
        assert!(!within(span, 0x20_0FF8, 0x10));
        assert!(!within(span, 0x20_2000, 0x180_0000_0000));
        assert!(!within(span, 0x20_2000, u64::MAX));
    }
}
