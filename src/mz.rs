use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::addr::{Address, Offset, PARAGRAPH_SIZE};
use crate::error::{Error, Result};
use crate::memory::PatternByte;

pub const MZ_SIGNATURE: u16 = 0x5a4d; // "MZ"
pub const MZ_HEADER_SIZE: usize = 28;
const MZ_RELOC_SIZE: usize = 4;
const PAGE_SIZE: usize = 512;

/// The 28-byte MZ executable header, fields in file order, little-endian.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MzHeader {
    pub signature: u16,
    /// Remainder under 512 in the last page.
    pub last_page_size: u16,
    /// Page count, each page being 512 bytes.
    pub pages_in_file: u16,
    pub num_relocs: u16,
    /// Header length in paragraphs; locates the load module in the file.
    pub header_paragraphs: u16,
    pub min_extra_paragraphs: u16,
    pub max_extra_paragraphs: u16,
    /// Initial stack, segment relative to the load module.
    pub ss: u16,
    pub sp: u16,
    pub checksum: u16,
    pub ip: u16,
    /// Relocated at load time by adding the load segment.
    pub cs: u16,
    pub reloc_table_offset: u16,
    pub overlay_number: u16,
}

impl MzHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MZ_HEADER_SIZE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("file too small for MZ header: {} bytes", buf.len()),
            )));
        }
        let word = |off: usize| u16::from_le_bytes([buf[off], buf[off + 1]]);
        Ok(MzHeader {
            signature: word(0x00),
            last_page_size: word(0x02),
            pages_in_file: word(0x04),
            num_relocs: word(0x06),
            header_paragraphs: word(0x08),
            min_extra_paragraphs: word(0x0a),
            max_extra_paragraphs: word(0x0c),
            ss: word(0x0e),
            sp: word(0x10),
            checksum: word(0x12),
            ip: word(0x14),
            cs: word(0x16),
            reloc_table_offset: word(0x18),
            overlay_number: word(0x1a),
        })
    }
}

/// One relocation table entry plus the original word found at its target.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Relocation {
    pub offset: u16,
    pub segment: u16,
    /// Word at the relocation target before patching.
    pub value: u16,
}

impl Relocation {
    fn linear(&self) -> Offset {
        Address::new(self.segment, self.offset).to_linear()
    }
}

/// A parsed MZ executable: header, relocation table and load module bytes.
/// `load` patches the relocations for a concrete load segment.
pub struct MzImage {
    path: PathBuf,
    header: MzHeader,
    relocs: Vec<Relocation>,
    ovl_info: Vec<u8>,
    load_module_offset: Offset,
    load_module_size: Offset,
    load_module_data: Vec<u8>,
    load_segment: u16,
}

impl MzImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        let header = MzHeader::parse(&data)?;
        if header.signature != MZ_SIGNATURE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("incorrect MZ signature: {:#06x}", header.signature),
            )));
        }
        if header.pages_in_file == 0 {
            return Err(Error::Dos("page count in MZ header is zero".into()));
        }

        // bytes between the header and the relocation table may carry
        // overlay information; keep them opaque
        let reloc_off = header.reloc_table_offset as usize;
        let ovl_info = if reloc_off > MZ_HEADER_SIZE && reloc_off <= data.len() {
            data[MZ_HEADER_SIZE..reloc_off].to_vec()
        } else {
            Vec::new()
        };

        let mut relocs = Vec::with_capacity(header.num_relocs as usize);
        for i in 0..header.num_relocs as usize {
            let off = reloc_off + i * MZ_RELOC_SIZE;
            if off + MZ_RELOC_SIZE > data.len() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "relocation table extends past end of file",
                )));
            }
            relocs.push(Relocation {
                offset: u16::from_le_bytes([data[off], data[off + 1]]),
                segment: u16::from_le_bytes([data[off + 2], data[off + 3]]),
                value: 0,
            });
        }

        let load_module_offset = header.header_paragraphs as Offset * PARAGRAPH_SIZE;
        let total_size = (header.pages_in_file as Offset - 1) * PAGE_SIZE
            + header.last_page_size as Offset;
        if total_size < load_module_offset || total_size > data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "load module of size {:#x} does not fit file of size {:#x}",
                    total_size,
                    data.len()
                ),
            )));
        }
        let load_module_size = total_size - load_module_offset;
        let load_module_data = data[load_module_offset..total_size].to_vec();

        // remember the pre-patch words at the relocation targets
        for r in relocs.iter_mut() {
            let target = r.linear();
            if target + 2 > load_module_size {
                return Err(Error::Dos(format!(
                    "relocation target {:#x} outside load module",
                    target
                )));
            }
            r.value =
                u16::from_le_bytes([load_module_data[target], load_module_data[target + 1]]);
        }

        debug!(
            "loaded MZ header from {}, entrypoint {}, stack {}, {} relocations",
            path.display(),
            Address::new(header.cs, header.ip),
            Address::new(header.ss, header.sp),
            relocs.len()
        );
        Ok(MzImage {
            path,
            header,
            relocs,
            ovl_info,
            load_module_offset,
            load_module_size,
            load_module_data,
            load_segment: 0,
        })
    }

    /// Patches every relocation for the given load segment. The patched
    /// word is always the original file value plus the load segment, so
    /// loading is idempotent.
    pub fn load(&mut self, load_segment: u16) {
        debug!(
            "loading executable code, size {:#x} at file offset {:#x}, relocation factor {:#x}",
            self.load_module_size, self.load_module_offset, load_segment
        );
        self.load_segment = load_segment;
        for i in 0..self.relocs.len() {
            let r = self.relocs[i];
            let patched = r.value.wrapping_add(load_segment);
            let target = r.linear();
            self.load_module_data[target..target + 2].copy_from_slice(&patched.to_le_bytes());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &MzHeader {
        &self.header
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    pub fn header_length(&self) -> Offset {
        self.header.header_paragraphs as Offset * PARAGRAPH_SIZE
    }

    pub fn load_module_size(&self) -> Offset {
        self.load_module_size
    }

    pub fn load_module_offset(&self) -> Offset {
        self.load_module_offset
    }

    pub fn load_module_data(&self) -> &[u8] {
        &self.load_module_data
    }

    pub fn load_segment(&self) -> u16 {
        self.load_segment
    }

    pub fn min_alloc(&self) -> Offset {
        self.header.min_extra_paragraphs as Offset * PARAGRAPH_SIZE
    }

    pub fn max_alloc(&self) -> Offset {
        self.header.max_extra_paragraphs as Offset * PARAGRAPH_SIZE
    }

    /// Entrypoint as stored in the header, not yet relocated.
    pub fn entrypoint(&self) -> Address {
        Address::new(self.header.cs, self.header.ip)
    }

    pub fn stack_pointer(&self) -> Address {
        Address::new(self.header.ss, self.header.sp)
    }

    /// Naive wildcard search over the load module; returns the position as
    /// an address within the unrelocated module.
    pub fn find(&self, pattern: &[PatternByte]) -> Option<Address> {
        if pattern.is_empty() || pattern.len() > self.load_module_data.len() {
            return None;
        }
        for start in 0..=(self.load_module_data.len() - pattern.len()) {
            let window = &self.load_module_data[start..start + pattern.len()];
            if pattern.iter().zip(window).all(|(p, b)| p.map_or(true, |v| v == *b)) {
                return Address::from_linear(start).ok();
            }
        }
        None
    }

    pub fn write_load_module(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, &self.load_module_data)?;
        Ok(())
    }

    /// Human readable header description for `mzhdr`.
    pub fn describe(&self) -> String {
        let h = &self.header;
        let mut ret = String::new();
        let _ = writeln!(ret, "--- {} MZ header ({} bytes)", self.path.display(), MZ_HEADER_SIZE);
        let _ = writeln!(ret, "\t[0x00] signature = {:#06x}", h.signature);
        let _ = writeln!(
            ret,
            "\t[0x02] last_page_size = {:#x} ({} bytes)",
            h.last_page_size, h.last_page_size
        );
        let _ = writeln!(
            ret,
            "\t[0x04] pages_in_file = {} ({} bytes)",
            h.pages_in_file,
            h.pages_in_file as usize * PAGE_SIZE
        );
        let _ = writeln!(ret, "\t[0x06] num_relocs = {}", h.num_relocs);
        let _ = writeln!(
            ret,
            "\t[0x08] header_paragraphs = {} ({} bytes)",
            h.header_paragraphs,
            self.header_length()
        );
        let _ = writeln!(
            ret,
            "\t[0x0a] min_extra_paragraphs = {} ({} bytes)",
            h.min_extra_paragraphs,
            self.min_alloc()
        );
        let _ = writeln!(ret, "\t[0x0c] max_extra_paragraphs = {}", h.max_extra_paragraphs);
        let _ = writeln!(ret, "\t[0x0e] ss:sp = {:x}:{:x}", h.ss, h.sp);
        let _ = writeln!(ret, "\t[0x12] checksum = {:#x}", h.checksum);
        let _ = writeln!(ret, "\t[0x14] cs:ip = {:x}:{:x}", h.cs, h.ip);
        let _ = writeln!(ret, "\t[0x18] reloc_table_offset = {:#x}", h.reloc_table_offset);
        let _ = writeln!(ret, "\t[0x1a] overlay_number = {}", h.overlay_number);
        if !self.ovl_info.is_empty() {
            let _ = writeln!(ret, "--- extra data (overlay info?): {} bytes", self.ovl_info.len());
        }
        if !self.relocs.is_empty() {
            let _ = writeln!(ret, "--- relocations:");
            for (i, r) in self.relocs.iter().enumerate() {
                let _ = writeln!(
                    ret,
                    "\t[{}]: {:x}:{:x}, linear: {:#x}, file offset: {:#x}, file value = {:#x}",
                    i,
                    r.segment,
                    r.offset,
                    r.linear(),
                    r.linear() + self.load_module_offset,
                    r.value
                );
            }
        }
        let _ = write!(
            ret,
            "--- load module @ {:#x}, size = {:#x} / {} bytes",
            self.load_module_offset, self.load_module_size, self.load_module_size
        );
        ret
    }

    /// Machine readable header summary for `mzhdr --format json`.
    pub fn info(&self) -> MzInfo<'_> {
        MzInfo {
            path: self.path.display().to_string(),
            header: self.header,
            relocations: &self.relocs,
            load_module_offset: self.load_module_offset,
            load_module_size: self.load_module_size,
        }
    }
}

#[derive(Serialize)]
pub struct MzInfo<'a> {
    pub path: String,
    pub header: MzHeader,
    pub relocations: &'a [Relocation],
    pub load_module_offset: Offset,
    pub load_module_size: Offset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // assembles a small exe: header, one relocation, and a module whose
    // first word gets patched
    fn sample_exe(signature: u16, pages: u16) -> Vec<u8> {
        let module: Vec<u8> = vec![
            0x34, 0x12, // word at 0:0, target of the relocation
            0xb8, 0xcd, 0xab, // mov ax, 0xabcd
            0xc3, // ret
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let header_paragraphs = 2u16; // 32 bytes: header + one reloc entry
        let total = header_paragraphs as usize * 16 + module.len();
        let mut out = Vec::new();
        let mut word = |v: u16| out.extend_from_slice(&v.to_le_bytes());
        word(signature);
        word((total % 512) as u16); // last_page_size
        word(pages); // pages_in_file
        word(1); // num_relocs
        word(header_paragraphs);
        word(0x10); // min_extra_paragraphs
        word(0xffff); // max_extra_paragraphs
        word(0x0001); // ss
        word(0x0100); // sp
        word(0); // checksum
        word(0x0002); // ip
        word(0x0000); // cs
        word(MZ_HEADER_SIZE as u16); // reloc_table_offset
        word(0); // overlay_number
        word(0x0000); // reloc offset
        word(0x0000); // reloc segment
        out.extend_from_slice(&module);
        out
    }

    fn write_exe(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_and_load() {
        let bytes = sample_exe(MZ_SIGNATURE, 1);
        let file = write_exe(&bytes);
        let mut mz = MzImage::open(file.path()).unwrap();
        assert_eq!(mz.header().num_relocs, 1);
        assert_eq!(mz.load_module_offset(), 32);
        assert_eq!(mz.load_module_size(), 16);
        assert_eq!(mz.entrypoint(), Address::new(0, 2));
        assert_eq!(mz.stack_pointer(), Address::new(1, 0x100));
        // original value at the relocation target was captured
        assert_eq!(mz.relocations()[0].value, 0x1234);
        // loading patches the word by the load segment
        mz.load(0x1000);
        assert_eq!(mz.load_segment(), 0x1000);
        let word = u16::from_le_bytes([mz.load_module_data()[0], mz.load_module_data()[1]]);
        assert_eq!(word, 0x2234);
    }

    #[test]
    fn test_bad_signature() {
        let bytes = sample_exe(0x4d5a, 1);
        let file = write_exe(&bytes);
        match MzImage::open(file.path()) {
            Err(Error::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_zero_pages() {
        let bytes = sample_exe(MZ_SIGNATURE, 0);
        let file = write_exe(&bytes);
        match MzImage::open(file.path()) {
            Err(Error::Dos(_)) => {}
            other => panic!("expected Dos error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_truncated_file() {
        let bytes = sample_exe(MZ_SIGNATURE, 1);
        let file = write_exe(&bytes[..10]);
        assert!(MzImage::open(file.path()).is_err());
    }

    #[test]
    fn test_find_pattern() {
        let bytes = sample_exe(MZ_SIGNATURE, 1);
        let file = write_exe(&bytes);
        let mz = MzImage::open(file.path()).unwrap();
        let pat = crate::memory::parse_pattern("b8??ab").unwrap();
        let found = mz.find(&pat).unwrap();
        assert_eq!(found.to_linear(), 2);
        let missing = crate::memory::parse_pattern("deadbeef").unwrap();
        assert!(mz.find(&missing).is_none());
    }

    #[test]
    fn test_write_load_module() {
        let bytes = sample_exe(MZ_SIGNATURE, 1);
        let file = write_exe(&bytes);
        let mut mz = MzImage::open(file.path()).unwrap();
        mz.load(0x100);
        let out = tempfile::NamedTempFile::new().unwrap();
        mz.write_load_module(out.path()).unwrap();
        let written = std::fs::read(out.path()).unwrap();
        assert_eq!(written, mz.load_module_data());
    }
}
