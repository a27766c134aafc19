use std::cmp::Ordering;
use std::fmt;

use log::debug;

use crate::addr::{Address, Block, Offset};

/// One discovered routine: its extents, the blocks attributed to it, and
/// the annotation flags carried through the map file.
#[derive(Debug, Clone)]
pub struct Routine {
    pub name: String,
    pub idx: usize,
    /// Largest single block starting at the entrypoint.
    pub extents: Block,
    /// Blocks provably reached by control flow from the entrypoint.
    pub reachable: Vec<Block>,
    /// Blocks attributed by surrounding context, not by direct flow.
    pub unreachable: Vec<Block>,
    pub near: bool,
    pub ignore: bool,
    pub complete: bool,
    pub external: bool,
    pub detached: bool,
    pub assembly: bool,
    pub duplicate: bool,
    /// Fake routine standing in for an unclaimed gap in summaries.
    pub unclaimed: bool,
    pub comments: Vec<String>,
}

impl Routine {
    pub fn new(name: impl Into<String>, extents: Block) -> Self {
        Routine {
            name: name.into(),
            idx: 0,
            extents,
            reachable: Vec::new(),
            unreachable: Vec::new(),
            near: true,
            ignore: false,
            complete: false,
            external: false,
            detached: false,
            assembly: false,
            duplicate: false,
            unclaimed: false,
            comments: Vec::new(),
        }
    }

    pub fn invalid() -> Self {
        Routine::new("", Block::invalid())
    }

    pub fn is_valid(&self) -> bool {
        self.extents.is_valid()
    }

    pub fn entrypoint(&self) -> Address {
        self.extents.begin
    }

    pub fn size(&self) -> Offset {
        self.extents.size()
    }

    pub fn reachable_size(&self) -> Offset {
        self.reachable.iter().map(Block::size).sum()
    }

    pub fn unreachable_size(&self) -> Offset {
        self.unreachable.iter().map(Block::size).sum()
    }

    /// Excluded from comparison and signature extraction.
    pub fn is_ignored(&self) -> bool {
        self.ignore || self.external
    }

    pub fn is_reachable(&self, b: &Block) -> bool {
        self.reachable.contains(b)
    }

    pub fn is_unreachable(&self, b: &Block) -> bool {
        self.unreachable.contains(b)
    }

    /// The reachable block beginning at the entrypoint.
    pub fn main_block(&self) -> Block {
        let ep = self.entrypoint();
        self.reachable
            .iter()
            .find(|b| b.begin == ep)
            .copied()
            .unwrap_or_else(Block::invalid)
    }

    pub fn block_containing(&self, addr: &Address) -> Block {
        if let Some(b) = self.reachable.iter().find(|b| b.contains(addr)) {
            return *b;
        }
        if let Some(b) = self.unreachable.iter().find(|b| b.contains(addr)) {
            return *b;
        }
        Block::invalid()
    }

    /// First reachable block starting at or after `from`.
    pub fn next_reachable(&self, from: &Address) -> Block {
        let mut blocks: Vec<&Block> = self.reachable.iter().filter(|b| b.begin >= *from).collect();
        blocks.sort();
        blocks.first().map(|b| **b).unwrap_or_else(Block::invalid)
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.extents.contains(addr)
            || self.reachable.iter().any(|b| b.contains(addr))
            || self.unreachable.iter().any(|b| b.contains(addr))
    }

    /// Whether a block crosses over any block claimed by this routine.
    pub fn colides(&self, block: &Block, check_extents: bool) -> bool {
        if check_extents && self.extents.intersects(block) {
            debug!("block {} colides with extents of routine {}", block, self.name);
            return true;
        }
        for b in self.reachable.iter().chain(self.unreachable.iter()) {
            if b.intersects(block) {
                debug!("block {} colides with block {} of routine {}", block, b, self.name);
                return true;
            }
        }
        false
    }

    /// All blocks of the routine in address order.
    pub fn sorted_blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> =
            self.reachable.iter().chain(self.unreachable.iter()).copied().collect();
        blocks.sort();
        blocks
    }

    /// Recomputes the extents as the maximal run starting at the
    /// entrypoint: the main block coalesced with any subsequent touching
    /// blocks of this routine.
    pub fn recalculate_extents(&mut self) {
        let ep = self.entrypoint();
        let main = self.main_block();
        if !main.is_valid() {
            return;
        }
        self.extents = main;
        for b in self.sorted_blocks() {
            if b.begin >= ep {
                self.extents.coalesce(&b);
            }
        }
        debug!("recalculated extents of routine {}: {}", self.name, self.extents);
    }

    /// Multi-line description listing the routine's blocks.
    pub fn dump_blocks(&self) -> String {
        let mut ret = format!("{}", self);
        for b in self.sorted_blocks() {
            let role = if b.begin == self.entrypoint() {
                "main"
            } else if self.is_reachable(&b) {
                "chunk"
            } else if self.is_unreachable(&b) {
                "unreachable"
            } else {
                "unknown"
            };
            ret.push_str(&format!("\n\t{}: {}", b, role));
        }
        ret
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.extents, self.name)?;
        write!(f, " [{}]", if self.near { "near" } else { "far" })?;
        if self.ignore {
            write!(f, " [ignored]")?;
        }
        if self.complete {
            write!(f, " [complete]")?;
        }
        if self.unclaimed {
            write!(f, " [unclaimed]")?;
        }
        if self.detached {
            write!(f, " [detached]")?;
        }
        if self.external {
            write!(f, " [external]")?;
        }
        if self.assembly {
            write!(f, " [assembly]")?;
        }
        if self.duplicate {
            write!(f, " [duplicate]")?;
        }
        Ok(())
    }
}

impl PartialEq for Routine {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.extents == other.extents
            && self.reachable == other.reachable
            && self.unreachable == other.unreachable
            && self.near == other.near
    }
}

impl Eq for Routine {}

impl PartialOrd for Routine {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Routine {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entrypoint().cmp(&other.entrypoint())
    }
}

/// A named data location within a known segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub addr: Address,
    pub external: bool,
    pub bss: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, addr: Address) -> Self {
        Variable { name: name.into(), addr, external: false, bss: false }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.addr)?;
        if self.external {
            write!(f, " external")?;
        }
        if self.bss {
            write!(f, " bss")?;
        }
        Ok(())
    }
}

impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr.cmp(&other.addr).then_with(|| self.name.cmp(&other.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(begin: Offset, end: Offset) -> Block {
        Block::from_linear(begin, end).unwrap()
    }

    #[test]
    fn test_blocks() {
        let mut r = Routine::new("test", block(0x10, 0x20));
        r.reachable.push(block(0x10, 0x20));
        r.reachable.push(block(0x40, 0x50));
        r.unreachable.push(block(0x30, 0x35));
        assert_eq!(r.entrypoint(), Address::from_linear(0x10).unwrap());
        assert_eq!(r.main_block(), block(0x10, 0x20));
        assert_eq!(r.reachable_size(), 0x11 + 0x11);
        assert_eq!(r.unreachable_size(), 6);
        assert_eq!(r.block_containing(&Address::from_linear(0x33).unwrap()), block(0x30, 0x35));
        assert_eq!(r.next_reachable(&Address::from_linear(0x21).unwrap()), block(0x40, 0x50));
        assert!(r.colides(&block(0x4f, 0x60), false));
        assert!(!r.colides(&block(0x60, 0x70), false));
        assert!(r.contains(&Address::from_linear(0x45).unwrap()));
    }

    #[test]
    fn test_recalculate_extents() {
        // adjacent block after the entrypoint grows the extents, the
        // detached one does not
        let mut r = Routine::new("test", Block::at(Address::from_linear(0x10).unwrap()));
        r.reachable.push(block(0x10, 0x1f));
        r.reachable.push(block(0x20, 0x2f));
        r.reachable.push(block(0x40, 0x4f));
        r.unreachable.push(block(0x05, 0x0f));
        r.recalculate_extents();
        assert_eq!(r.extents, block(0x10, 0x2f));
    }
}
