//! Minimal ELF32/ELF64 image writer for loader tests.

use laos_core::elf::{ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD};

const PAGE: u64 = 4096;

#[derive(Clone)]
pub struct Segment {
    pub p_type: u32,
    pub vaddr: u64,
    pub paddr: u64,
    pub flags: u32,
    pub data: Vec<u8>,
    pub mem_size: u64,
}

pub struct ElfBuilder {
    is_64: bool,
    kind: u16,
    entry: u64,
    segments: Vec<Segment>,
    relocs: Vec<(u64, u64)>,
}

impl ElfBuilder {
    pub fn elf64() -> Self {
        Self {
            is_64: true,
            kind: ET_EXEC,
            entry: 0,
            segments: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn elf32() -> Self {
        Self {
            is_64: false,
            ..Self::elf64()
        }
    }

    pub fn relocatable(mut self) -> Self {
        self.kind = ET_DYN;
        self
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Executable text at `vaddr`, loaded at `paddr`.
    pub fn text(self, vaddr: u64, paddr: u64, data: &[u8]) -> Self {
        self.load(vaddr, paddr, PF_R | PF_X, data, data.len() as u64)
    }

    pub fn load(mut self, vaddr: u64, paddr: u64, flags: u32, data: &[u8], mem_size: u64) -> Self {
        self.segments.push(Segment {
            p_type: PT_LOAD,
            vaddr,
            paddr,
            flags,
            data: data.to_vec(),
            mem_size,
        });
        self
    }

    /// `R_*_RELATIVE` at `offset` with `addend`. ELF64 images get RELA
    /// entries, ELF32 images REL entries with the addend stored in place.
    pub fn relative(mut self, offset: u64, addend: u64) -> Self {
        self.relocs.push((offset, addend));
        self
    }

    fn word(&self) -> usize {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    fn put_word(&self, out: &mut Vec<u8>, value: u64) {
        if self.is_64 {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }

    /// Dynamic section plus relocation table in one extra RW segment.
    fn dynamic_segment(&mut self) {
        if self.relocs.is_empty() {
            return;
        }
        assert_eq!(self.kind, ET_DYN, "relocations need a relocatable image");

        let end = self
            .segments
            .iter()
            .map(|s| s.vaddr + s.mem_size)
            .max()
            .unwrap_or(0);
        let base = end.next_multiple_of(PAGE);
        let word = self.word() as u64;
        let entries = 4u64;
        let table_at = base + entries * 2 * word;
        let entsize = if self.is_64 { 3 * word } else { 2 * word };
        let (tag, size_tag, ent_tag) = if self.is_64 { (7, 8, 9) } else { (17, 18, 19) };

        let mut data = Vec::new();
        for (t, v) in [
            (tag, table_at),
            (size_tag, entsize * self.relocs.len() as u64),
            (ent_tag, entsize),
            (0, 0),
        ] {
            self.put_word(&mut data, t);
            self.put_word(&mut data, v);
        }
        let dynamic_len = data.len() as u64;

        let relocs = self.relocs.clone();
        for &(offset, addend) in &relocs {
            self.put_word(&mut data, offset);
            self.put_word(&mut data, 8);
            if self.is_64 {
                self.put_word(&mut data, addend);
            } else {
                self.patch(offset, addend as u32);
            }
        }

        self.segments.push(Segment {
            p_type: PT_LOAD,
            vaddr: base,
            paddr: base,
            flags: PF_R | PF_W,
            mem_size: data.len() as u64,
            data,
        });
        self.segments.push(Segment {
            p_type: PT_DYNAMIC,
            vaddr: base,
            paddr: base,
            flags: PF_R | PF_W,
            data: Vec::new(),
            mem_size: dynamic_len,
        });
    }

    fn patch(&mut self, vaddr: u64, value: u32) {
        let seg = self
            .segments
            .iter_mut()
            .find(|s| vaddr >= s.vaddr && vaddr + 4 <= s.vaddr + s.data.len() as u64)
            .expect("relocation target outside file data");
        let at = (vaddr - seg.vaddr) as usize;
        seg.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn build(mut self) -> Vec<u8> {
        self.dynamic_segment();
        let (ehsize, phentsize) = if self.is_64 { (64usize, 56usize) } else { (52, 32) };

        // Lay out file data: page-congruent offsets for loadable segments.
        let mut offsets = Vec::new();
        let mut cursor = PAGE;
        let mut dynamic_index = None;
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.p_type == PT_DYNAMIC {
                dynamic_index = Some(i);
                offsets.push(0);
                continue;
            }
            let offset = cursor.next_multiple_of(PAGE) + seg.vaddr % PAGE;
            offsets.push(offset);
            cursor = offset + seg.data.len() as u64;
        }
        if let Some(i) = dynamic_index {
            // Same bytes as the preceding loadable segment.
            offsets[i] = offsets[i - 1];
        }

        let mut out = vec![0u8; cursor.max(PAGE) as usize];
        out[..4].copy_from_slice(b"\x7FELF");
        out[4] = if self.is_64 { 2 } else { 1 };
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&self.kind.to_le_bytes());
        let machine: u16 = if self.is_64 { 62 } else { 3 };
        out[18..20].copy_from_slice(&machine.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());

        let phnum = self.segments.len() as u16;
        if self.is_64 {
            out[24..32].copy_from_slice(&self.entry.to_le_bytes());
            out[32..40].copy_from_slice(&(ehsize as u64).to_le_bytes());
            out[52..54].copy_from_slice(&(ehsize as u16).to_le_bytes());
            out[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes());
            out[56..58].copy_from_slice(&phnum.to_le_bytes());
        } else {
            out[24..28].copy_from_slice(&(self.entry as u32).to_le_bytes());
            out[28..32].copy_from_slice(&(ehsize as u32).to_le_bytes());
            out[40..42].copy_from_slice(&(ehsize as u16).to_le_bytes());
            out[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
            out[44..46].copy_from_slice(&phnum.to_le_bytes());
        }
        assert!(ehsize + phentsize * self.segments.len() <= PAGE as usize);

        for (i, seg) in self.segments.iter().enumerate() {
            let at = ehsize + i * phentsize;
            let file_size = if seg.p_type == PT_DYNAMIC {
                seg.mem_size
            } else {
                seg.data.len() as u64
            };
            let mut ph = Vec::with_capacity(phentsize);
            if self.is_64 {
                ph.extend_from_slice(&seg.p_type.to_le_bytes());
                ph.extend_from_slice(&seg.flags.to_le_bytes());
                for v in [offsets[i], seg.vaddr, seg.paddr, file_size, seg.mem_size, PAGE] {
                    ph.extend_from_slice(&v.to_le_bytes());
                }
            } else {
                ph.extend_from_slice(&seg.p_type.to_le_bytes());
                for v in [offsets[i], seg.vaddr, seg.paddr, file_size, seg.mem_size] {
                    ph.extend_from_slice(&(v as u32).to_le_bytes());
                }
                ph.extend_from_slice(&seg.flags.to_le_bytes());
                ph.extend_from_slice(&(PAGE as u32).to_le_bytes());
            }
            out[at..at + phentsize].copy_from_slice(&ph);

            if seg.p_type != PT_DYNAMIC {
                let offset = offsets[i] as usize;
                out[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
            }
        }
        out
    }
}
