use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::addr::{seg_to_offset, Address, Block, Offset, MEM_TOTAL, PARAGRAPH_SIZE};
use crate::error::{Error, Result};

/// Beginning of the free conventional memory block.
const INIT_BREAK: Offset = 0x500;
/// End of usable memory, start of the upper memory area.
const MEM_END: Offset = 0xa0000;

/// A byte pattern element; `None` matches any byte.
pub type PatternByte = Option<u8>;

/// Parses a hexadecimal byte pattern string, e.g. `ab12??ea`, where `??`
/// stands for a wildcard byte. The string must have an even length.
pub fn parse_pattern(s: &str) -> Result<Vec<PatternByte>> {
    if s.len() % 2 != 0 {
        return Err(Error::Arg(format!("odd length of pattern string: {}", s)));
    }
    let mut ret = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let pair = std::str::from_utf8(pair).map_err(|_| {
            Error::Arg(format!("invalid characters in pattern string: {}", s))
        })?;
        if pair == "??" {
            ret.push(None);
        } else {
            let val = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::Arg(format!("invalid pattern byte: {}", pair)))?;
            ret.push(Some(val));
        }
    }
    Ok(ret)
}

/// Flat image of the 1 MB real-mode address space.
pub struct Memory {
    data: Vec<u8>,
    brk: Offset,
}

impl Memory {
    pub fn new() -> Self {
        // fill with a recognizable pattern so uninitialized reads stand out
        let pattern = [0xdeu8, 0xad, 0xbe, 0xef];
        let mut data = vec![0u8; MEM_TOTAL];
        for (i, b) in data.iter_mut().enumerate() {
            *b = pattern[i % pattern.len()];
        }
        Memory { data, brk: INIT_BREAK }
    }

    /// Creates an image with `data` copied in at the base of `segment`.
    pub fn with_code(segment: u16, data: &[u8]) -> Result<Self> {
        let mut mem = Memory::new();
        mem.write_buf(seg_to_offset(segment), data)?;
        Ok(mem)
    }

    pub fn size(&self) -> Offset {
        MEM_TOTAL
    }

    pub fn available_bytes(&self) -> Offset {
        ((MEM_END - self.brk) / PARAGRAPH_SIZE) * PARAGRAPH_SIZE
    }

    pub fn free_start(&self) -> Offset {
        self.brk
    }

    pub fn alloc_block(&mut self, para: Offset) -> Result<()> {
        let size = para * PARAGRAPH_SIZE;
        if self.brk + size > MEM_END {
            return Err(Error::Memory(format!(
                "no room to allocate {} bytes, available = {}",
                size,
                self.available_bytes()
            )));
        }
        self.brk += size;
        Ok(())
    }

    pub fn free_block(&mut self, para: Offset) -> Result<()> {
        let size = para * PARAGRAPH_SIZE;
        if self.brk < INIT_BREAK + size {
            return Err(Error::Memory(format!(
                "no room to free {} bytes, break = {:#x}",
                size, self.brk
            )));
        }
        self.brk -= size;
        Ok(())
    }

    fn check_range(&self, addr: Offset, size: Offset) -> Result<()> {
        if addr + size > MEM_TOTAL {
            return Err(Error::Memory(format!(
                "access of size {} at {:#x} outside memory bounds",
                size, addr
            )));
        }
        Ok(())
    }

    pub fn read_byte(&self, addr: Offset) -> Result<u8> {
        self.check_range(addr, 1)?;
        Ok(self.data[addr])
    }

    pub fn read_word(&self, addr: Offset) -> Result<u16> {
        self.check_range(addr, 2)?;
        Ok(u16::from_le_bytes([self.data[addr], self.data[addr + 1]]))
    }

    pub fn write_byte(&mut self, addr: Offset, value: u8) -> Result<()> {
        self.check_range(addr, 1)?;
        self.data[addr] = value;
        Ok(())
    }

    pub fn write_word(&mut self, addr: Offset, value: u16) -> Result<()> {
        self.check_range(addr, 2)?;
        self.data[addr..addr + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_buf(&mut self, addr: Offset, buf: &[u8]) -> Result<()> {
        self.check_range(addr, buf.len())?;
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Borrow of the image starting at a linear offset.
    pub fn slice_at(&self, addr: Offset) -> Result<&[u8]> {
        self.check_range(addr, 0)?;
        Ok(&self.data[addr..])
    }

    pub fn slice_at_addr(&self, addr: &Address) -> Result<&[u8]> {
        self.slice_at(addr.to_linear())
    }

    /// Scans `block` for a byte pattern with wildcards; a naive scan is fine
    /// at these sizes. Returns the address of the first match.
    pub fn find(&self, pattern: &[PatternByte], block: &Block) -> Option<Address> {
        if pattern.is_empty() || !block.is_valid() {
            return None;
        }
        let begin = block.begin.to_linear();
        let end = (block.end.to_linear() + 1).min(MEM_TOTAL);
        if begin + pattern.len() > end {
            return None;
        }
        for start in begin..=(end - pattern.len()) {
            let window = &self.data[start..start + pattern.len()];
            let matched = pattern
                .iter()
                .zip(window)
                .all(|(p, b)| p.map_or(true, |v| v == *b));
            if matched {
                return Address::from_linear(start).ok();
            }
        }
        None
    }

    /// Writes a range of the image to a file, or hex-dumps it to stdout when
    /// no path is given.
    pub fn dump(&self, range: &Block, path: Option<&Path>) -> Result<()> {
        if !range.is_valid() {
            return Err(Error::Arg(format!("invalid range for memory dump: {}", range)));
        }
        let begin = range.begin.to_linear();
        self.check_range(begin, range.size())?;
        let bytes = &self.data[begin..begin + range.size()];
        match path {
            Some(path) => {
                let mut file = File::create(path)?;
                file.write_all(bytes)?;
            }
            None => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for (i, chunk) in bytes.chunks(16).enumerate() {
                    write!(out, "{:#08x}: ", begin + i * 16)?;
                    for b in chunk {
                        write!(out, "{:02x} ", b)?;
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let mut mem = Memory::new();
        assert!(mem.read_byte(MEM_TOTAL).is_err());
        assert!(mem.read_word(MEM_TOTAL - 1).is_err());
        assert!(mem.write_byte(MEM_TOTAL, 1).is_err());
        assert!(mem.write_word(MEM_TOTAL - 1, 1).is_err());
        assert!(mem.write_buf(MEM_TOTAL - 1, &[1, 2]).is_err());
        mem.write_word(0x1000, 0xabcd).unwrap();
        assert_eq!(mem.read_word(0x1000).unwrap(), 0xabcd);
        assert_eq!(mem.read_byte(0x1000).unwrap(), 0xcd);
        assert_eq!(mem.read_byte(0x1001).unwrap(), 0xab);
    }

    #[test]
    fn test_fill_pattern() {
        let mem = Memory::new();
        assert_eq!(mem.read_byte(0).unwrap(), 0xde);
        assert_eq!(mem.read_byte(1).unwrap(), 0xad);
        assert_eq!(mem.read_byte(2).unwrap(), 0xbe);
        assert_eq!(mem.read_byte(3).unwrap(), 0xef);
    }

    #[test]
    fn test_alloc() {
        let mut mem = Memory::new();
        let before = mem.available_bytes();
        mem.alloc_block(2).unwrap();
        assert_eq!(mem.available_bytes(), before - 2 * PARAGRAPH_SIZE);
        mem.free_block(2).unwrap();
        assert_eq!(mem.available_bytes(), before);
        assert!(mem.free_block(0x10000).is_err());
    }

    #[test]
    fn test_find_with_wildcards() {
        let mut mem = Memory::new();
        mem.write_buf(0x10000, &[0x12, 0x34, 0x56, 0x78, 0x9a]).unwrap();
        let block = Block::from_linear(0x10000, 0x10010).unwrap();
        let pat = parse_pattern("34??78").unwrap();
        let found = mem.find(&pat, &block).unwrap();
        assert_eq!(found.to_linear(), 0x10001);
        let missing = parse_pattern("3456ff").unwrap();
        assert!(mem.find(&missing, &block).is_none());
    }

    #[test]
    fn test_parse_pattern() {
        assert_eq!(
            parse_pattern("ab12??ea").unwrap(),
            vec![Some(0xab), Some(0x12), None, Some(0xea)]
        );
        assert!(parse_pattern("abc").is_err());
        assert!(parse_pattern("zz").is_err());
    }
}
