use std::cmp::Ordering;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

/// Total real-mode address space reachable with segment:offset addressing.
pub const MEM_TOTAL: Offset = 1 << 20;
/// Span of a single segment.
pub const SEGMENT_SIZE: Offset = 1 << 16;
pub const PARAGRAPH_SIZE: Offset = 16;
pub const OFFSET_MAX: Offset = 0xffff;

const SEGMENT_SHIFT: u32 = 4;
const OFFSET_NORMAL_MASK: u16 = 0xf;
const ADDR_INVALID: u16 = 0xffff;

/// Linear offset into the 1 MB address space.
pub type Offset = usize;
/// Signed offset, used where displacements can go below zero.
pub type SOffset = isize;

pub fn seg_to_offset(segment: u16) -> Offset {
    (segment as Offset) << SEGMENT_SHIFT
}

pub fn offset_to_seg(offset: Offset) -> u16 {
    (offset >> SEGMENT_SHIFT) as u16
}

pub fn bytes_to_para(bytes: Offset) -> Offset {
    (bytes + PARAGRAPH_SIZE - 1) / PARAGRAPH_SIZE
}

/// A segmented address. Equality and ordering are by linear value, so two
/// aliased segment:offset pairs pointing at the same byte compare equal.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    pub segment: u16,
    pub offset: u16,
}

lazy_static! {
    static ref FARADDR_RE: Regex = Regex::new("^([0-9a-fA-F]{1,4}):([0-9a-fA-F]{1,4})$").unwrap();
    static ref HEXOFFSET_RE: Regex = Regex::new("^0x([0-9a-fA-F]{1,5})$").unwrap();
    static ref DECOFFSET_RE: Regex = Regex::new("^([0-9]{1,7})$").unwrap();
    static ref BLOCK_RE: Regex = Regex::new("^([0-9a-fA-F]{1,6})-([0-9a-fA-F]{1,6})$").unwrap();
    static ref SEGMENT_RE: Regex =
        Regex::new("^([$_a-zA-Z0-9]+) (CODE|DATA|STACK) ([0-9a-fA-F]{1,4})$").unwrap();
}

impl Address {
    pub fn new(segment: u16, offset: u16) -> Self {
        Address { segment, offset }
    }

    /// The invalid sentinel address; compares greater than any real address.
    pub fn invalid() -> Self {
        Address { segment: ADDR_INVALID, offset: ADDR_INVALID }
    }

    pub fn from_linear(linear: Offset) -> Result<Self> {
        if linear >= MEM_TOTAL {
            return Err(Error::Memory(format!(
                "linear address too big for segmented representation: {:#x}",
                linear
            )));
        }
        Ok(Address {
            segment: ((linear & 0xf0000) >> SEGMENT_SHIFT) as u16,
            offset: (linear & 0xffff) as u16,
        })
    }

    /// Parses `seg:off`, `0x<hex>` linear, or decimal linear forms.
    pub fn parse(s: &str, fix_normal: bool) -> Result<Self> {
        let mut addr = if let Some(cap) = FARADDR_RE.captures(s) {
            Address::new(
                u16::from_str_radix(&cap[1], 16).unwrap(),
                u16::from_str_radix(&cap[2], 16).unwrap(),
            )
        } else if let Some(cap) = HEXOFFSET_RE.captures(s) {
            Address::from_linear(Offset::from_str_radix(&cap[1], 16).unwrap())?
        } else if let Some(cap) = DECOFFSET_RE.captures(s) {
            Address::from_linear(cap[1].parse::<Offset>().unwrap())?
        } else {
            return Err(Error::Arg(format!("invalid address string: {}", s)));
        };
        if fix_normal {
            addr.normalize();
        }
        Ok(addr)
    }

    pub fn to_linear(&self) -> Offset {
        seg_to_offset(self.segment) + self.offset as Offset
    }

    pub fn is_null(&self) -> bool {
        self.segment == 0 && self.offset == 0
    }

    pub fn is_valid(&self) -> bool {
        self.segment != ADDR_INVALID || self.offset != ADDR_INVALID
    }

    /// Whether this address is reachable from `segment` within a 16-bit offset.
    pub fn in_segment(&self, segment: u16) -> bool {
        let linear = self.to_linear();
        let base = seg_to_offset(segment);
        linear >= base && linear - base <= OFFSET_MAX
    }

    /// Moves the bulk of the offset into the segment part, leaving the offset
    /// below a paragraph.
    pub fn normalize(&mut self) {
        self.segment = self.segment.wrapping_add(self.offset >> SEGMENT_SHIFT);
        self.offset &= OFFSET_NORMAL_MASK;
    }

    pub fn normalized(&self) -> Self {
        let mut a = *self;
        a.normalize();
        a
    }

    /// Advances the segment part, e.g. relocate(0234:000a, 0x1000) -> 1234:000a.
    pub fn relocate(&mut self, reloc: u16) -> Result<()> {
        if self.segment > 0xffff - reloc {
            return Err(Error::Memory(format!(
                "unable to relocate address {} by {:#x}",
                self, reloc
            )));
        }
        self.segment += reloc;
        Ok(())
    }

    /// Inverse of relocate, e.g. rebase(1234:000a, 0x1000) -> 0234:000a.
    pub fn rebase(&mut self, base: u16) -> Result<()> {
        if base > self.segment {
            return Err(Error::Memory(format!(
                "unable to rebase address {} to {:#x}",
                self, base
            )));
        }
        self.segment -= base;
        Ok(())
    }

    /// Re-expresses the same linear address relative to another segment.
    pub fn move_to_segment(&mut self, segment: u16) -> Result<()> {
        if !self.in_segment(segment) {
            return Err(Error::Memory(format!(
                "unable to move address {} to segment {:#x}",
                self, segment
            )));
        }
        self.offset = (self.to_linear() - seg_to_offset(segment)) as u16;
        self.segment = segment;
        Ok(())
    }

    /// Offset-wrapping displacement within the same segment.
    pub fn displaced(&self, displacement: i16) -> Self {
        Address::new(self.segment, self.offset.wrapping_add(displacement as u16))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:04x}:{:04x}", self.segment, self.offset)
        } else {
            write!(f, "(invalid)")
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.to_linear() == other.to_linear()
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_linear().cmp(&other.to_linear())
    }
}

impl std::ops::Add<u16> for Address {
    type Output = Address;
    fn add(self, rhs: u16) -> Address {
        Address::new(self.segment, self.offset.wrapping_add(rhs))
    }
}

impl std::ops::AddAssign<u16> for Address {
    fn add_assign(&mut self, rhs: u16) {
        self.offset = self.offset.wrapping_add(rhs);
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = Offset;
    fn sub(self, rhs: Address) -> Offset {
        self.to_linear() - rhs.to_linear()
    }
}

/// An address range with both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub begin: Address,
    pub end: Address,
}

impl Block {
    pub fn new(begin: Address, end: Address) -> Self {
        Block { begin, end }
    }

    pub fn at(begin: Address) -> Self {
        Block { begin, end: begin }
    }

    pub fn from_linear(begin: Offset, end: Offset) -> Result<Self> {
        Ok(Block::new(Address::from_linear(begin)?, Address::from_linear(end)?))
    }

    /// The default block is invalid (begin past end).
    pub fn invalid() -> Self {
        Block {
            begin: Address::invalid(),
            end: Address::invalid(),
        }
    }

    /// Parses a `begin-end` pair of hex linear offsets.
    pub fn parse(s: &str) -> Result<Self> {
        let cap = BLOCK_RE
            .captures(s)
            .ok_or_else(|| Error::Arg(format!("invalid block string: {}", s)))?;
        Block::from_linear(
            Offset::from_str_radix(&cap[1], 16).unwrap(),
            Offset::from_str_radix(&cap[2], 16).unwrap(),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.begin.is_valid() && self.end.is_valid() && self.begin <= self.end
    }

    pub fn size(&self) -> Offset {
        if self.is_valid() {
            self.end - self.begin + 1
        } else {
            0
        }
    }

    pub fn in_segment(&self, segment: u16) -> bool {
        self.begin.in_segment(segment) && self.end.in_segment(segment)
    }

    /// Both ends carry the same segment value (after a move both will).
    pub fn single_segment(&self) -> bool {
        self.begin.segment == self.end.segment
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.is_valid() && *addr >= self.begin && *addr <= self.end
    }

    /// Whether the blocks overlap by at least one byte.
    pub fn intersects(&self, other: &Block) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return false;
        }
        let max_begin = self.begin.max(other.begin);
        let min_end = self.end.min(other.end);
        max_begin <= min_end
    }

    /// Whether the blocks are disjoint but consecutive.
    pub fn adjacent(&self, other: &Block) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return false;
        }
        let max_begin = self.begin.max(other.begin);
        let min_end = self.end.min(other.end);
        max_begin > min_end && max_begin - min_end == 1
    }

    /// Extends this block over another when they intersect or touch.
    pub fn coalesce(&mut self, other: &Block) {
        if !self.intersects(other) && !self.adjacent(other) {
            return;
        }
        self.begin = self.begin.min(other.begin);
        self.end = self.end.max(other.end);
    }

    pub fn coalesced(&self, other: &Block) -> Block {
        let mut b = *self;
        b.coalesce(other);
        b
    }

    /// Cuts `other` out of this block, leaving 0, 1 or 2 disjoint pieces.
    pub fn cut(&self, other: &Block) -> Vec<Block> {
        if !self.is_valid() || !other.is_valid() {
            return Vec::new();
        }
        let mut ret = Vec::new();
        if other.begin < self.begin {
            if other.end < self.begin {
                ret.push(*self);
            } else if other.end < self.end {
                ret.push(Block::new(other.end.displaced(1), self.end));
            }
            // other encloses self, nothing remains
        } else if other.begin <= self.end {
            if other.begin > self.begin {
                ret.push(Block::new(self.begin, other.begin.displaced(-1)));
            }
            if other.end < self.end {
                ret.push(Block::new(other.end.displaced(1), self.end));
            }
        } else {
            ret.push(*self);
        }
        ret
    }

    /// Partitions a block that straddles 64 KB boundaries into per-segment
    /// pieces. The total size of the pieces equals the size of the input.
    pub fn split_segments(&self) -> Result<Vec<Block>> {
        if !self.is_valid() {
            return Err(Error::Memory(format!(
                "unable to split invalid block into segments: {}",
                self
            )));
        }
        let mut ret = Vec::new();
        let mut span = self.size();
        let mut start = self.begin;
        while span != 0 {
            let max_span = (OFFSET_MAX - start.offset as Offset) + 1;
            let piece = if span > max_span {
                let b = Block::new(start, Address::new(start.segment, 0xffff));
                start = Address::new(start.segment + 0x1000, 0);
                b
            } else {
                Block::new(
                    start,
                    Address::new(start.segment, start.offset.wrapping_add((span - 1) as u16)),
                )
            };
            debug_assert!(piece.size() <= span);
            span -= piece.size();
            ret.push(piece);
        }
        Ok(ret)
    }

    pub fn relocate(&mut self, reloc: u16) -> Result<()> {
        self.begin.relocate(reloc)?;
        self.end.relocate(reloc)
    }

    pub fn rebase(&mut self, base: u16) -> Result<()> {
        self.begin.rebase(base)?;
        self.end.rebase(base)
    }

    pub fn move_to_segment(&mut self, segment: u16) -> Result<()> {
        self.begin.move_to_segment(segment)?;
        self.end.move_to_segment(segment)
    }

    /// Offset-pair form used by the map file format, e.g. `12f-340`.
    pub fn to_hex(&self) -> String {
        format!("{:x}-{:x}", self.begin.offset, self.end.offset)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            write!(f, "[invalid] ")?;
        }
        write!(f, "{}-{}/{:#x}", self.begin, self.end, self.size())
    }
}

impl PartialOrd for Block {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Block {
    fn cmp(&self, other: &Self) -> Ordering {
        self.begin.cmp(&other.begin).then(self.end.cmp(&other.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
    Stack,
}

impl SegmentKind {
    pub fn name(&self) -> &'static str {
        match self {
            SegmentKind::Code => "CODE",
            SegmentKind::Data => "DATA",
            SegmentKind::Stack => "STACK",
        }
    }
}

/// A named, typed, addressed segment. Equality is by (kind, address).
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub kind: SegmentKind,
    pub address: u16,
}

impl Segment {
    pub fn new(name: impl Into<String>, kind: SegmentKind, address: u16) -> Self {
        Segment { name: name.into(), kind, address }
    }

    /// Parses a `Name CODE|DATA|STACK hexaddr` definition line, returning
    /// `None` when the line is not a segment definition at all.
    pub fn parse(line: &str) -> Option<Result<Segment>> {
        let cap = SEGMENT_RE.captures(line)?;
        let kind = match &cap[2] {
            "CODE" => SegmentKind::Code,
            "DATA" => SegmentKind::Data,
            "STACK" => SegmentKind::Stack,
            other => return Some(Err(Error::Arg(format!("invalid segment type: {}", other)))),
        };
        let address = u16::from_str_radix(&cap[3], 16).unwrap();
        Some(Ok(Segment::new(&cap[1], kind, address)))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:x}", self.name, self.kind.name(), self.address)
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.address == other.address
    }
}

impl Eq for Segment {}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_linear() {
        let a = Address::new(0x06ef, 0x1234);
        assert_eq!(a.to_linear(), 0x8124);
        let n = a.normalized();
        assert_eq!(n.segment, 0x0812);
        assert_eq!(n.offset, 0x0004);
        assert_eq!(n.to_linear(), 0x8124);
        // aliased addresses compare equal
        assert_eq!(a, n);
    }

    #[test]
    fn test_address_from_linear_roundtrip() {
        for &linear in &[0usize, 0x4ff, 0x8124, 0x9fff0, 0xfffff] {
            let a = Address::from_linear(linear).unwrap();
            assert_eq!(a.to_linear(), linear);
        }
        assert!(Address::from_linear(MEM_TOTAL).is_err());
    }

    #[test]
    fn test_address_parse() {
        assert_eq!(Address::parse("1234:0056", false).unwrap(), Address::new(0x1234, 0x56));
        assert_eq!(Address::parse("0x8124", false).unwrap().to_linear(), 0x8124);
        assert_eq!(Address::parse("256", false).unwrap().to_linear(), 256);
        assert!(Address::parse("bogus", false).is_err());
    }

    #[test]
    fn test_address_move() {
        let mut a = Address::new(0x1234, 0x000a);
        a.move_to_segment(0x1000).unwrap();
        assert_eq!(a.segment, 0x1000);
        assert_eq!(a.offset, 0x234a);
        // same linear address not reachable from a segment too far away
        let mut b = Address::new(0x1000, 0x0000);
        assert!(b.move_to_segment(0x2000).is_err());
    }

    #[test]
    fn test_address_relocate_rebase() {
        let mut a = Address::new(0x0234, 0x000a);
        a.relocate(0x1000).unwrap();
        assert_eq!(a, Address::new(0x1234, 0x000a));
        a.rebase(0x1000).unwrap();
        assert_eq!(a, Address::new(0x0234, 0x000a));
        assert!(a.rebase(0x1000).is_err());
        let mut c = Address::new(0xf000, 0);
        assert!(c.relocate(0x2000).is_err());
    }

    #[test]
    fn test_block_basics() {
        let b = Block::from_linear(100, 200).unwrap();
        assert!(b.is_valid());
        assert_eq!(b.size(), 101);
        assert!(b.contains(&Address::from_linear(150).unwrap()));
        assert!(!b.contains(&Address::from_linear(201).unwrap()));
        // end before begin is invalid, operations return empty/false
        let bad = Block::from_linear(10, 5).unwrap();
        assert!(!bad.is_valid());
        assert_eq!(bad.size(), 0);
        assert!(!bad.contains(&Address::from_linear(7).unwrap()));
        assert!(!bad.intersects(&b));
    }

    #[test]
    fn test_block_intersect_adjacent_coalesce() {
        let b1 = Block::from_linear(100, 200).unwrap();
        let b2 = Block::from_linear(150, 250).unwrap();
        let b3 = Block::from_linear(201, 300).unwrap();
        assert!(b1.intersects(&b2));
        assert!(!b1.intersects(&b3));
        assert!(b1.adjacent(&b3));
        assert!(!b1.adjacent(&b2));
        let c = b1.coalesced(&b2);
        assert_eq!(c, Block::from_linear(100, 250).unwrap());
        let c = b1.coalesced(&b3);
        assert_eq!(c, Block::from_linear(100, 300).unwrap());
        // disjoint and non-adjacent blocks do not coalesce
        let far = Block::from_linear(500, 600).unwrap();
        assert_eq!(b1.coalesced(&far), b1);
    }

    #[test]
    fn test_block_cut() {
        let b = Block::from_linear(100, 200).unwrap();
        // cutting a block with itself leaves nothing
        assert!(b.cut(&b).is_empty());
        // disjoint cut leaves the block intact
        let far = Block::from_linear(300, 400).unwrap();
        assert_eq!(b.cut(&far), vec![b]);
        let before = Block::from_linear(10, 99).unwrap();
        assert_eq!(b.cut(&before), vec![b]);
        // cut in the middle leaves two pieces
        let mid = Block::from_linear(120, 130).unwrap();
        let pieces = b.cut(&mid);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0], Block::from_linear(100, 119).unwrap());
        assert_eq!(pieces[1], Block::from_linear(131, 200).unwrap());
        assert_eq!(pieces[0].size() + pieces[1].size() + mid.size(), b.size());
        // overlap from the left leaves the tail
        let left = Block::from_linear(50, 150).unwrap();
        assert_eq!(b.cut(&left), vec![Block::from_linear(151, 200).unwrap()]);
        // enclosing cut removes everything
        let enclosing = Block::from_linear(50, 250).unwrap();
        assert!(b.cut(&enclosing).is_empty());
    }

    #[test]
    fn test_block_split_segments() {
        // block spanning three 64k segments
        let b = Block::new(Address::new(0x0, 0x8000), Address::new(0x2000, 0x7fff));
        let pieces = b.split_segments().unwrap();
        assert_eq!(pieces.len(), 3);
        let total: Offset = pieces.iter().map(|p| p.size()).sum();
        assert_eq!(total, b.size());
        for p in &pieces {
            assert!(p.single_segment());
        }
        assert_eq!(pieces[0], Block::new(Address::new(0x0, 0x8000), Address::new(0x0, 0xffff)));
        assert_eq!(pieces[1], Block::new(Address::new(0x1000, 0x0), Address::new(0x1000, 0xffff)));
        // block fitting a single segment stays whole
        let small = Block::new(Address::new(0x100, 0x10), Address::new(0x100, 0x20));
        assert_eq!(small.split_segments().unwrap(), vec![small]);
    }

    #[test]
    fn test_block_parse_hex() {
        let b = Block::parse("12f-340").unwrap();
        assert_eq!(b.begin.to_linear(), 0x12f);
        assert_eq!(b.end.to_linear(), 0x340);
        assert!(Block::parse("nope").is_err());
    }

    #[test]
    fn test_segment_parse_display() {
        let s = Segment::parse("MainCode CODE 1000").unwrap().unwrap();
        assert_eq!(s.name, "MainCode");
        assert_eq!(s.kind, SegmentKind::Code);
        assert_eq!(s.address, 0x1000);
        assert_eq!(s.to_string(), "MainCode CODE 1000");
        assert!(Segment::parse("not a segment line").is_none());
        // equality ignores the name
        let t = Segment::new("Other", SegmentKind::Code, 0x1000);
        assert_eq!(s, t);
        assert_ne!(s, Segment::new("MainCode", SegmentKind::Data, 0x1000));
    }
}
