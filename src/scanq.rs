use std::collections::VecDeque;
use std::fmt;

use log::debug;

use crate::addr::{Address, Block, Offset};
use crate::error::{Error, Result};
use crate::registers::RegisterState;
use crate::routine::Routine;

/// Index of a routine within the entrypoint registry, 1-based. Zero is the
/// "no routine" sentinel; the top bit is reserved for the rehydration
/// marker so real indices stay below it.
pub type RoutineIdx = u32;
pub const NULL_ROUTINE: RoutineIdx = 0;
/// Marks bytes as claimed-by-something while rebuilding unclaimed blocks
/// from a saved map, without reference to a concrete routine.
pub const VISITED_ID: RoutineIdx = 1 << 31;

/// A jump or call destination pending a visit, with the register state
/// captured at the branch site.
#[derive(Debug, Clone)]
pub struct Destination {
    pub address: Address,
    pub routine_idx: RoutineIdx,
    pub is_call: bool,
    pub regs: RegisterState,
}

impl Destination {
    pub fn new(address: Address, routine_idx: RoutineIdx, is_call: bool, regs: RegisterState) -> Self {
        Destination { address, routine_idx, is_call, regs }
    }

    fn matches(&self, other: &Destination) -> bool {
        self.address == other.address && self.is_call == other.is_call
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} / {} / {}]",
            self.address,
            self.routine_idx,
            if self.is_call { "call" } else { "jump" }
        )
    }
}

/// A classified control transfer found while scanning.
#[derive(Debug, Clone, Copy)]
pub struct Branch {
    pub source: Address,
    pub destination: Option<Address>,
    pub is_call: bool,
    pub is_conditional: bool,
    pub is_near: bool,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination {
            Some(dest) => write!(f, "{} -> {}", self.source, dest)?,
            None => write!(f, "{} -> (unresolved)", self.source)?,
        }
        write!(
            f,
            " [{},{},{}]",
            if self.is_call { "call" } else { "jump" },
            if self.is_conditional { "cond" } else { "nocond" },
            if self.is_near { "near" } else { "far" }
        )
    }
}

#[derive(Debug, Clone)]
pub struct RoutineEntrypoint {
    pub addr: Address,
    pub idx: RoutineIdx,
    pub near: bool,
    pub name: Option<String>,
}

/// Worklist of pending destinations plus the per-byte visited map recording
/// which routine owns each byte of the scanned image.
pub struct ScanQueue {
    visited: Vec<RoutineIdx>,
    origin: Address,
    cur_search: Option<Destination>,
    queue: VecDeque<Destination>,
    entrypoints: Vec<RoutineEntrypoint>,
}

impl ScanQueue {
    pub fn new(origin: Address, code_size: Offset, seed: Destination, name: Option<&str>) -> Self {
        debug!(
            "initializing scan queue, origin {}, size {:#x}, seed {}",
            origin, code_size, seed
        );
        let mut sq = ScanQueue::empty(origin, code_size);
        sq.entrypoints.push(RoutineEntrypoint {
            addr: seed.address,
            idx: seed.routine_idx,
            near: true,
            name: name.map(String::from),
        });
        sq.queue.push_front(seed);
        sq
    }

    /// Queue with no seed; used to rebuild unclaimed blocks from a saved
    /// map and for linker-map seeding.
    pub fn empty(origin: Address, code_size: Offset) -> Self {
        ScanQueue {
            visited: vec![NULL_ROUTINE; code_size],
            origin,
            cur_search: None,
            queue: VecDeque::new(),
            entrypoints: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn origin(&self) -> Address {
        self.origin
    }

    pub fn routine_count(&self) -> usize {
        self.entrypoints.len()
    }

    pub fn status_string(&self) -> String {
        let idx = self.cur_search.as_ref().map(|d| d.routine_idx).unwrap_or(NULL_ROUTINE);
        format!("[r{}/q{}]", idx, self.len())
    }

    /// Pops the next destination to walk and makes it current.
    pub fn next_point(&mut self) -> Option<Destination> {
        let dest = self.queue.pop_front()?;
        self.cur_search = Some(dest.clone());
        Some(dest)
    }

    pub fn has_point(&self, dest: &Address, is_call: bool) -> bool {
        let findme = Destination::new(*dest, 0, is_call, RegisterState::new());
        self.queue.iter().any(|d| d.matches(&findme))
    }

    fn index_of(&self, off: Offset) -> Option<usize> {
        let origin = self.origin.to_linear();
        if off < origin {
            return None;
        }
        let idx = off - origin;
        if idx >= self.visited.len() {
            return None;
        }
        Some(idx)
    }

    pub fn get_routine_idx(&self, off: Offset) -> RoutineIdx {
        match self.index_of(off) {
            Some(idx) => self.visited[idx],
            None => NULL_ROUTINE,
        }
    }

    /// Marks `length` bytes from `off` as belonging to a routine; with no
    /// explicit index the current search's routine claims them.
    pub fn set_routine_idx(&mut self, off: Offset, length: Offset, idx: Option<RoutineIdx>) -> Result<()> {
        let idx = match idx {
            Some(i) => i,
            None => self
                .cur_search
                .as_ref()
                .map(|d| d.routine_idx)
                .unwrap_or(NULL_ROUTINE),
        };
        let origin = self.origin.to_linear();
        if off < origin {
            return Err(Error::Arg(format!(
                "unable to mark visited location {:#x} before origin {}",
                off, self.origin
            )));
        }
        let start = off - origin;
        if start >= self.visited.len() || start + length > self.visited.len() {
            return Err(Error::Arg(format!(
                "unable to mark visited location {:#x} with length {:#x} past map of size {:#x}",
                off,
                length,
                self.visited.len()
            )));
        }
        for slot in &mut self.visited[start..start + length] {
            *slot = idx;
        }
        Ok(())
    }

    /// Clears the contiguous forward run of whatever routine index is
    /// stored at `off`; the rollback path uses this to abandon a walk that
    /// decoded into garbage.
    pub fn clear_routine_idx(&mut self, off: Offset) {
        let start = match self.index_of(off) {
            Some(idx) => idx,
            None => return,
        };
        let clear_id = self.visited[start];
        if clear_id == NULL_ROUTINE {
            return;
        }
        for slot in self.visited[start..].iter_mut() {
            if *slot != clear_id {
                break;
            }
            *slot = NULL_ROUTINE;
        }
    }

    /// Routine index registered at an address, or the null sentinel.
    pub fn is_entrypoint(&self, addr: &Address) -> RoutineIdx {
        self.entrypoints
            .iter()
            .find(|ep| ep.addr == *addr)
            .map(|ep| ep.idx)
            .unwrap_or(NULL_ROUTINE)
    }

    pub fn entrypoint_by_name(&self, name: &str) -> Option<&RoutineEntrypoint> {
        self.entrypoints.iter().find(|ep| ep.name.as_deref() == Some(name))
    }

    /// Registers a function call destination. A fresh routine index is
    /// allocated unless the address is already a known entrypoint or a
    /// pending call; a call into the middle of an already visited routine
    /// still claims the destination as a new entrypoint.
    pub fn save_call(
        &mut self,
        dest: &Address,
        regs: &RegisterState,
        near: bool,
        name: Option<&str>,
    ) -> bool {
        if !dest.is_valid() {
            return false;
        }
        let known = self.is_entrypoint(dest);
        if known != NULL_ROUTINE {
            debug!("address {} already registered as entrypoint for routine {}", dest, known);
            return false;
        }
        if self.has_point(dest, true) {
            debug!("scan queue already contains call to {}", dest);
            return false;
        }
        let owner = self.get_routine_idx(dest.to_linear());
        let new_idx = (self.routine_count() + 1) as RoutineIdx;
        self.queue.push_back(Destination::new(*dest, new_idx, true, *regs));
        if owner == NULL_ROUTINE {
            debug!(
                "call destination {} unclaimed, queued as entrypoint of new routine {}, queue size {}",
                dest, new_idx, self.len()
            );
        } else {
            debug!(
                "call destination {} within routine {}, reclaiming as entrypoint of new routine {}",
                dest, owner, new_idx
            );
        }
        self.entrypoints.push(RoutineEntrypoint {
            addr: *dest,
            idx: new_idx,
            near,
            name: name.map(String::from),
        });
        true
    }

    /// Registers a jump destination against the current routine. Jumps are
    /// pushed to the front so the current routine finishes its walk before
    /// any pending calls run. The destination is first re-expressed in the
    /// routine's segment; jumps that cannot be are dropped.
    pub fn save_jump(&mut self, dest: &Address, regs: &RegisterState) -> bool {
        let cur_idx = match self.cur_search.as_ref() {
            Some(d) => d.routine_idx,
            None => return false,
        };
        let owner = self.get_routine_idx(dest.to_linear());
        if owner != NULL_ROUTINE {
            debug!("jump destination {} already visited by routine {}", dest, owner);
            return false;
        }
        if self.has_point(dest, false) {
            debug!("queue already contains jump to {}", dest);
            return false;
        }
        let mut dest = *dest;
        debug_assert!(cur_idx as usize <= self.entrypoints.len());
        let ep = &self.entrypoints[cur_idx as usize - 1];
        if ep.addr.segment != dest.segment {
            if let Err(e) = dest.move_to_segment(ep.addr.segment) {
                debug!(
                    "unable to move jump destination {} to segment of routine {}: {}, ignoring",
                    dest, ep.idx, e
                );
                return false;
            }
        }
        self.queue.push_front(Destination::new(dest, cur_idx, false, *regs));
        debug!(
            "jump destination {} unvisited, scheduled from routine {}, queue size {}",
            dest, cur_idx, self.len()
        );
        true
    }

    /// Dispatches a resolved branch to the call or jump variant, bounded by
    /// the code extents of the scanned executable.
    pub fn save_branch(
        &mut self,
        branch: &Branch,
        regs: &RegisterState,
        code_extents: &Block,
    ) -> bool {
        let dest = match branch.destination {
            Some(d) => d,
            None => return false,
        };
        if !code_extents.contains(&dest) {
            debug!("{}: branch destination outside code boundaries: {}", branch.source, dest);
            return false;
        }
        if branch.is_call {
            self.save_call(&dest, regs, branch.is_near, None)
        } else {
            self.save_jump(&dest, regs)
        }
    }

    /// Materializes routine skeletons from the entrypoint registry; blocks
    /// come later from the visited map walk.
    pub fn get_routines(&self) -> Vec<Routine> {
        let mut routines = vec![Routine::invalid(); self.routine_count()];
        for ep in &self.entrypoints {
            let r = &mut routines[ep.idx as usize - 1];
            r.extents = Block::at(ep.addr);
            r.near = ep.near;
            r.idx = ep.idx as usize;
            r.name = match &ep.name {
                Some(name) => name.clone(),
                None if ep.addr == self.origin => "start".into(),
                None => format!("routine_{}", ep.idx),
            };
        }
        routines
    }

    /// Coalesced runs of unvisited bytes, re-expressed in the origin's
    /// segment.
    pub fn get_unvisited(&self) -> Vec<Block> {
        let mut ret = Vec::new();
        let mut begin: Option<Offset> = None;
        for (off, idx) in self.visited.iter().enumerate() {
            match (idx, begin) {
                (&NULL_ROUTINE, None) => begin = Some(off),
                (&NULL_ROUTINE, Some(_)) => {}
                (_, Some(b)) => {
                    if let Ok(mut block) = Block::from_linear(b, off - 1) {
                        if block.relocate(self.origin.segment).is_ok() {
                            ret.push(block);
                        }
                    }
                    begin = None;
                }
                _ => {}
            }
        }
        if let Some(b) = begin {
            if let Ok(mut block) = Block::from_linear(b, self.visited.len() - 1) {
                if block.relocate(self.origin.segment).is_ok() {
                    ret.push(block);
                }
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(off: u16) -> Address {
        Address::new(0, off)
    }

    fn seeded() -> ScanQueue {
        let seed = Destination::new(addr(0x10), 1, true, RegisterState::new());
        ScanQueue::new(addr(0), 0x100, seed, Some("start"))
    }

    #[test]
    fn test_seed_and_next() {
        let mut sq = seeded();
        assert_eq!(sq.routine_count(), 1);
        assert_eq!(sq.is_entrypoint(&addr(0x10)), 1);
        assert_eq!(sq.is_entrypoint(&addr(0x20)), NULL_ROUTINE);
        let dest = sq.next_point().unwrap();
        assert_eq!(dest.address, addr(0x10));
        assert!(dest.is_call);
        assert!(sq.next_point().is_none());
    }

    #[test]
    fn test_jump_front_call_back() {
        let mut sq = seeded();
        let _ = sq.next_point();
        let regs = RegisterState::new();
        // a discovered call goes to the back of the queue
        assert!(sq.save_call(&addr(0x40), &regs, true, None));
        // a jump inside the current routine goes to the front
        assert!(sq.save_jump(&addr(0x20), &regs));
        assert_eq!(sq.len(), 2);
        let first = sq.next_point().unwrap();
        assert_eq!(first.address, addr(0x20));
        assert!(!first.is_call);
        // the jump belongs to the current routine
        assert_eq!(first.routine_idx, 1);
        let second = sq.next_point().unwrap();
        assert_eq!(second.address, addr(0x40));
        assert!(second.is_call);
        assert_eq!(second.routine_idx, 2);
    }

    #[test]
    fn test_save_call_dedup() {
        let mut sq = seeded();
        let _ = sq.next_point();
        let regs = RegisterState::new();
        assert!(sq.save_call(&addr(0x40), &regs, true, None));
        // same destination again: already queued
        assert!(!sq.save_call(&addr(0x40), &regs, true, None));
        // known entrypoint is never re-registered
        assert!(!sq.save_call(&addr(0x10), &regs, true, None));
        assert_eq!(sq.routine_count(), 2);
    }

    #[test]
    fn test_save_jump_visited() {
        let mut sq = seeded();
        let _ = sq.next_point();
        let regs = RegisterState::new();
        sq.set_routine_idx(0x20, 4, None).unwrap();
        // destination already claimed: dropped
        assert!(!sq.save_jump(&addr(0x20), &regs));
        // unclaimed: queued
        assert!(sq.save_jump(&addr(0x30), &regs));
        assert!(!sq.save_jump(&addr(0x30), &regs));
    }

    #[test]
    fn test_visited_marks() {
        let mut sq = seeded();
        let _ = sq.next_point();
        sq.set_routine_idx(0x20, 4, None).unwrap();
        assert_eq!(sq.get_routine_idx(0x20), 1);
        assert_eq!(sq.get_routine_idx(0x23), 1);
        assert_eq!(sq.get_routine_idx(0x24), NULL_ROUTINE);
        // marking past the end of the map fails
        assert!(sq.set_routine_idx(0xff, 2, None).is_err());
        // clearing erases the contiguous run only
        sq.set_routine_idx(0x24, 2, Some(2)).unwrap();
        sq.clear_routine_idx(0x20);
        assert_eq!(sq.get_routine_idx(0x20), NULL_ROUTINE);
        assert_eq!(sq.get_routine_idx(0x23), NULL_ROUTINE);
        assert_eq!(sq.get_routine_idx(0x24), 2);
    }

    #[test]
    fn test_branch_bounds() {
        let mut sq = seeded();
        let _ = sq.next_point();
        let regs = RegisterState::new();
        let extents = Block::new(addr(0), addr(0x7f));
        let inside = Branch {
            source: addr(0x11),
            destination: Some(addr(0x50)),
            is_call: true,
            is_conditional: false,
            is_near: true,
        };
        assert!(sq.save_branch(&inside, &regs, &extents));
        let outside = Branch { destination: Some(addr(0x90)), ..inside };
        assert!(!sq.save_branch(&outside, &regs, &extents));
        let unresolved = Branch { destination: None, ..inside };
        assert!(!sq.save_branch(&unresolved, &regs, &extents));
    }

    #[test]
    fn test_get_routines_names() {
        let seed = Destination::new(addr(0x0), 1, true, RegisterState::new());
        let mut sq = ScanQueue::new(addr(0), 0x100, seed, None);
        let _ = sq.next_point();
        sq.save_call(&addr(0x40), &RegisterState::new(), true, None);
        sq.save_call(&addr(0x60), &RegisterState::new(), false, Some("known"));
        let routines = sq.get_routines();
        assert_eq!(routines.len(), 3);
        // origin routine is called start, the rest get automatic names
        assert_eq!(routines[0].name, "start");
        assert_eq!(routines[1].name, "routine_2");
        assert_eq!(routines[2].name, "known");
        assert!(!routines[2].near);
    }

    #[test]
    fn test_get_unvisited() {
        let mut sq = ScanQueue::empty(Address::new(0x100, 0), 0x10);
        sq.set_routine_idx(0x1002, 2, Some(1)).unwrap();
        sq.set_routine_idx(0x1008, 4, Some(2)).unwrap();
        let unvisited = sq.get_unvisited();
        assert_eq!(unvisited.len(), 3);
        assert_eq!(unvisited[0], Block::new(Address::new(0x100, 0), Address::new(0x100, 1)));
        assert_eq!(unvisited[1], Block::new(Address::new(0x100, 4), Address::new(0x100, 7)));
        assert_eq!(unvisited[2], Block::new(Address::new(0x100, 0xc), Address::new(0x100, 0xf)));
    }
}
