use log::debug;

use crate::addr::{seg_to_offset, Address, Block, Offset, Segment, SegmentKind};
use crate::error::{Error, Result};
use crate::instruction::Instruction;
use crate::memory::{Memory, PatternByte};
use crate::mz::MzImage;

/// An executable loaded into the byte image: code bytes, load metadata and
/// the segments discovered so far.
pub struct Executable {
    code: Memory,
    load_segment: u16,
    code_size: Offset,
    ep: Address,
    stack: Address,
    code_extents: Block,
    segments: Vec<Segment>,
}

impl Executable {
    pub fn from_mz(mz: &MzImage) -> Result<Self> {
        let mut ep = mz.entrypoint();
        ep.relocate(mz.load_segment())?;
        let mut exe = Executable {
            code: Memory::with_code(mz.load_segment(), mz.load_module_data())?,
            load_segment: mz.load_segment(),
            code_size: mz.load_module_size(),
            ep,
            stack: mz.stack_pointer(),
            code_extents: Block::invalid(),
            segments: Vec::new(),
        };
        exe.init()?;
        Ok(exe)
    }

    /// Builds an executable directly from raw code bytes; used by tests and
    /// the comparison of bare code fragments.
    pub fn with_code(load_segment: u16, data: &[u8]) -> Result<Self> {
        let mut exe = Executable {
            code: Memory::with_code(load_segment, data)?,
            load_segment,
            code_size: data.len(),
            ep: Address::new(load_segment, 0),
            stack: Address::invalid(),
            code_extents: Block::invalid(),
            segments: Vec::new(),
        };
        exe.init()?;
        Ok(exe)
    }

    fn init(&mut self) -> Result<()> {
        if self.code_size == 0 {
            return Err(Error::Arg("code size is zero while constructing executable".into()));
        }
        self.code_extents = Block::new(
            Address::new(self.load_segment, 0),
            Address::from_linear(seg_to_offset(self.load_segment) + self.code_size - 1)?,
        );
        let ep_segment = self.ep.segment;
        self.store_segment(SegmentKind::Code, ep_segment);
        if self.stack.is_valid() {
            self.stack.relocate(self.load_segment)?;
            let stack_segment = self.stack.segment;
            self.store_segment(SegmentKind::Stack, stack_segment);
        }
        debug!(
            "loaded executable, code at {}, entrypoint {}, stack {}",
            self.code_extents, self.ep, self.stack
        );
        Ok(())
    }

    pub fn entrypoint(&self) -> Address {
        self.ep
    }

    pub fn stack(&self) -> Address {
        self.stack
    }

    pub fn size(&self) -> Offset {
        self.code_size
    }

    pub fn load_segment(&self) -> u16 {
        self.load_segment
    }

    pub fn extents(&self) -> &Block {
        &self.code_extents
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.code_extents.contains(addr)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Overrides the entrypoint, optionally treating the given address as
    /// relative to the load module.
    pub fn set_entrypoint(&mut self, addr: Address, relocate: bool) -> Result<()> {
        self.ep = addr;
        if relocate {
            self.ep.relocate(self.load_segment)?;
        }
        debug!("entrypoint set to {}", self.ep);
        Ok(())
    }

    /// Code bytes starting at an address, for handing to the decoder.
    pub fn code_at(&self, addr: &Address) -> Result<&[u8]> {
        if !self.contains(addr) {
            return Err(Error::Memory(format!(
                "address {} outside code extents {}",
                addr, self.code_extents
            )));
        }
        self.code.slice_at(addr.to_linear())
    }

    pub fn memory(&self) -> &Memory {
        &self.code
    }

    /// Registers a discovered segment. Existing CODE segments are exclusive
    /// at their address; a DATA segment replaces a STACK segment at the
    /// same address. Unnamed segments receive an automatic name.
    pub fn store_segment(&mut self, kind: SegmentKind, addr: u16) -> bool {
        let seg_address = Address::new(addr, 0);
        if !self.code_extents.contains(&seg_address) {
            debug!(
                "segment {} outside extents of executable: {}",
                seg_address, self.code_extents
            );
            return false;
        }
        if self.segments.iter().any(|s| s.kind == kind && s.address == addr) {
            return true;
        }
        if let Some(pos) = self.segments.iter().position(|s| s.address == addr) {
            let existing = &self.segments[pos];
            match (existing.kind, kind) {
                (SegmentKind::Code, _) => {
                    debug!("segment at {:#x} already exists with type CODE, ignoring", addr);
                    return false;
                }
                (SegmentKind::Stack, SegmentKind::Data) => {
                    debug!("segment {:#x} exists with type STACK, replacing with DATA", addr);
                    self.segments.remove(pos);
                }
                _ => {
                    debug!(
                        "segment {:#x} already exists with type {}, ignoring",
                        addr,
                        existing.kind.name()
                    );
                    return false;
                }
            }
        }
        let idx = self.segments.iter().filter(|s| s.kind == kind).count() + 1;
        let name = match kind {
            SegmentKind::Code => format!("Code{}", idx),
            SegmentKind::Data => format!("Data{}", idx),
            SegmentKind::Stack => format!("Stack{}", idx),
        };
        let seg = Segment::new(name, kind, addr);
        debug!("registered new segment: {}", seg);
        self.segments.push(seg);
        true
    }

    /// Pattern search over the code extents, or a narrower block.
    pub fn find(&self, pattern: &[PatternByte], within: Option<Block>) -> Option<Address> {
        let block = within.unwrap_or(self.code_extents);
        self.code.find(pattern, &block)
    }

    /// Extracts the instruction shape fingerprints over a single-segment
    /// block, one per instruction.
    pub fn signatures(&self, range: &Block) -> Result<Vec<u32>> {
        if !range.is_valid() {
            return Err(Error::Arg("invalid block provided for signature extraction".into()));
        }
        if !range.single_segment() {
            return Err(Error::Logic(format!(
                "block boundaries in different segments for signature extraction: {}",
                range
            )));
        }
        let mut ret = Vec::new();
        let mut addr = range.begin;
        while addr <= range.end {
            let ins = Instruction::decode(addr, self.code_at(&addr)?)?;
            ret.push(ins.signature());
            addr += ins.length as u16;
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::parse_pattern;

    #[test]
    fn test_with_code_init() {
        let exe = Executable::with_code(0x1000, &[0x90, 0xc3]).unwrap();
        assert_eq!(exe.entrypoint(), Address::new(0x1000, 0));
        assert_eq!(exe.size(), 2);
        assert!(exe.contains(&Address::new(0x1000, 1)));
        assert!(!exe.contains(&Address::new(0x1000, 2)));
        // the entrypoint's code segment gets registered
        assert_eq!(exe.segments().len(), 1);
        assert_eq!(exe.segments()[0].kind, SegmentKind::Code);
        assert!(Executable::with_code(0x1000, &[]).is_err());
    }

    #[test]
    fn test_store_segment_precedence() {
        let mut exe = Executable::with_code(0x1000, &[0u8; 0x200]).unwrap();
        // code segment at the entrypoint already exists and is exclusive
        assert!(!exe.store_segment(SegmentKind::Data, 0x1000));
        // a stack segment gets replaced by data at the same address
        assert!(exe.store_segment(SegmentKind::Stack, 0x1010));
        assert!(exe.store_segment(SegmentKind::Data, 0x1010));
        assert_eq!(
            exe.segments().iter().filter(|s| s.address == 0x1010).count(),
            1
        );
        assert_eq!(
            exe.segments().iter().find(|s| s.address == 0x1010).unwrap().kind,
            SegmentKind::Data
        );
        // data does not get replaced by stack
        assert!(!exe.store_segment(SegmentKind::Stack, 0x1010));
        // registering the same segment twice is fine
        assert!(exe.store_segment(SegmentKind::Data, 0x1010));
        // out of extents is rejected
        assert!(!exe.store_segment(SegmentKind::Data, 0x2000));
    }

    #[test]
    fn test_find() {
        let exe = Executable::with_code(0x100, &[0xb8, 0x34, 0x12, 0xc3]).unwrap();
        let pat = parse_pattern("34??c3").unwrap();
        let found = exe.find(&pat, None).unwrap();
        assert_eq!(found.to_linear(), 0x1001);
    }

    #[test]
    fn test_signatures() {
        // mov ax, 0x1234; mov ax, 0x5678; ret
        let exe =
            Executable::with_code(0x100, &[0xb8, 0x34, 0x12, 0xb8, 0x78, 0x56, 0xc3]).unwrap();
        let block = Block::new(Address::new(0x100, 0), Address::new(0x100, 6));
        let sigs = exe.signatures(&block).unwrap();
        assert_eq!(sigs.len(), 3);
        // immediates do not contribute to the fingerprint
        assert_eq!(sigs[0], sigs[1]);
        assert_ne!(sigs[0], sigs[2]);
    }
}
