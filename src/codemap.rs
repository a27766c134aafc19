use std::fmt::Write as _;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use regex::Regex;

use crate::addr::{offset_to_seg, seg_to_offset, Address, Block, Offset, Segment, SegmentKind, PARAGRAPH_SIZE};
use crate::error::{Error, Result};
use crate::routine::{Routine, Variable};
use crate::scanq::{RoutineIdx, ScanQueue, NULL_ROUTINE, VISITED_ID};

/// On-disk flavors a code map can be loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFormat {
    /// The native editable text format.
    Map,
    /// Best-effort import of an IDA listing (.lst).
    IdaListing,
    /// Microsoft LINK map, used to seed exploration.
    MsLink,
}

/// Aggregate statistics over a map, plus the rendered report.
#[derive(Debug, Default)]
pub struct Summary {
    pub text: String,
    pub code_size: Offset,
    pub data_size: Offset,
    pub completed_size: Offset,
    pub complete_count: usize,
    pub uncomplete_size: i64,
    pub uncomplete_count: i64,
    pub assembly_size: Offset,
    pub assembly_count: usize,
    pub ignored_size: Offset,
    pub ignore_count: usize,
    pub external_size: Offset,
    pub external_count: usize,
    pub other_size: i64,
    pub other_count: i64,
    pub ignored_reachable_size: i64,
    pub ignored_reachable_count: i64,
    pub detached_size: Offset,
    pub detached_count: usize,
    pub unclaimed_size: Offset,
    pub unclaimed_count: usize,
    pub data_code_size: Offset,
    pub data_code_count: usize,
    pub unaccounted_size: i64,
    pub unaccounted_count: i64,
}

// Per-walk context while converting the visited map into blocks.
#[derive(Debug, Default, Clone, Copy)]
struct BlockWalk {
    cur_id: RoutineIdx,
    prev_id: RoutineIdx,
    cur_block_id: RoutineIdx,
    prev_block_id: RoutineIdx,
}

/// The persistent, editable model of an executable's discovered structure:
/// routines with their blocks, unclaimed gaps, segments and variables.
pub struct CodeMap {
    load_segment: u16,
    map_size: Offset,
    routines: Vec<Routine>,
    unclaimed: Vec<Block>,
    segments: Vec<Segment>,
    vars: Vec<Variable>,
    ida: bool,
}

lazy_static! {
    static ref SIZE_RE: Regex = Regex::new(r"^Size\s+([0-9a-fA-F]+)$").unwrap();
    static ref RANGE_RE: Regex = Regex::new(r"^([0-9a-fA-F]{1,4})-([0-9a-fA-F]{1,4})$").unwrap();
    static ref VAR_RE: Regex =
        Regex::new(r"^([$_a-zA-Z0-9]+):\s+([$_a-zA-Z0-9]+)\s+VAR\s+([0-9a-fA-F]{1,4})\s*(.*)$")
            .unwrap();
    // MS linker map grammars
    static ref LINK_SEGMENTS_RE: Regex =
        Regex::new(r"^\s*Start\s+Stop\s+Length\s+Name\s+Class").unwrap();
    static ref LINK_PUBLICS_RE: Regex = Regex::new(r"^\s*Address\s+Publics by Name").unwrap();
    static ref LINK_PUBVAL_RE: Regex = Regex::new(r"^\s*Address\s+Publics by Value").unwrap();
    static ref LINK_SEGDEF_RE: Regex = Regex::new(
        r"^\s*([0-9A-Fa-f]+)H\s+([0-9A-Fa-f]+)H\s+([0-9A-Fa-f]+)H\s+([_$0-9A-Za-z]+)\s+([_$0-9A-Za-z]+)"
    )
    .unwrap();
    static ref LINK_PUBDEF_RE: Regex =
        Regex::new(r"^\s*([0-9A-Fa-f]+):([0-9A-Fa-f]+)\s+([_$0-9A-Za-z]+)").unwrap();
    // IDA listing grammars
    static ref IDA_ADDR_RE: Regex =
        Regex::new(r"^([_a-zA-Z0-9]+):([0-9a-fA-F]{1,4})$").unwrap();
    static ref IDA_LOADLEN_RE: Regex = Regex::new(r"Loaded length: ([0-9a-fA-F]+)h").unwrap();
}

fn size_str(size: Offset) -> String {
    format!("{:#x}/{}", size, size)
}

fn ratio_str(part: impl Into<i64>, whole: impl Into<i64>) -> String {
    let (part, whole) = (part.into(), whole.into());
    if whole <= 0 {
        return "-".into();
    }
    format!("{:.1}%", part as f64 * 100.0 / whole as f64)
}

impl CodeMap {
    pub fn new(load_segment: u16, map_size: Offset) -> Self {
        CodeMap {
            load_segment,
            map_size,
            routines: Vec::new(),
            unclaimed: Vec::new(),
            segments: Vec::new(),
            vars: Vec::new(),
            ida: false,
        }
    }

    /// Builds a map from the scan queue left behind by an exploration run:
    /// routine skeletons come from the entrypoint registry, blocks from a
    /// single pass over the visited map.
    pub fn from_queue(
        sq: &ScanQueue,
        segments: &[Segment],
        vars: &[Variable],
        load_segment: u16,
        map_size: Offset,
    ) -> Result<Self> {
        if sq.routine_count() == 0 {
            return Err(Error::Analysis(
                "attempted to create code map from scan queue with no routines".into(),
            ));
        }
        let mut map = CodeMap::new(load_segment, map_size);
        map.set_segments(segments.to_vec());
        info!(
            "building code map from scan queue: {} routines over {} segments",
            sq.routine_count(),
            map.segments.len()
        );
        map.routines = sq.get_routines();
        map.blocks_from_queue(sq, false)?;
        for v in vars {
            map.store_variable(v.clone());
        }
        map.order();
        Ok(map)
    }

    /// Loads a map from one of the supported on-disk formats and rebuilds
    /// the unclaimed blocks the text format does not carry.
    pub fn load(path: impl AsRef<Path>, load_segment: u16, format: MapFormat) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Arg(format!("map file does not exist: {}", path.display())));
        }
        let mut map = CodeMap::new(load_segment, 0);
        match format {
            MapFormat::Map => map.load_from_map_file(path, load_segment)?,
            MapFormat::IdaListing => map.load_from_ida_file(path, load_segment)?,
            MapFormat::MsLink => map.load_from_link_file(path, load_segment)?,
        }
        debug!(
            "loaded {} routines, {} variables from {}",
            map.routines.len(),
            map.vars.len(),
            path.display()
        );
        // populate a throwaway visited map with markers where the routines
        // are, to reconstruct the unclaimed gaps between them
        let mut sq = ScanQueue::empty(Address::new(load_segment, 0), map.map_size);
        for r in &map.routines {
            for b in r.reachable.iter().chain(r.unreachable.iter()) {
                sq.set_routine_idx(b.begin.to_linear(), b.size(), Some(VISITED_ID))?;
            }
        }
        map.blocks_from_queue(&sq, true)?;
        map.order();
        Ok(map)
    }

    pub fn load_segment(&self) -> u16 {
        self.load_segment
    }

    pub fn code_size(&self) -> Offset {
        self.map_size
    }

    pub fn set_map_size(&mut self, size: Offset) {
        self.map_size = size;
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn is_ida(&self) -> bool {
        self.ida
    }

    pub fn routine_count(&self) -> usize {
        self.routines.len()
    }

    pub fn variable_count(&self) -> usize {
        self.vars.len()
    }

    pub fn routines(&self) -> &[Routine] {
        &self.routines
    }

    pub fn routines_mut(&mut self) -> &mut [Routine] {
        &mut self.routines
    }

    pub fn add_routine(&mut self, r: Routine) {
        self.routines.push(r);
    }

    pub fn unclaimed(&self) -> &[Block] {
        &self.unclaimed
    }

    pub fn variables(&self) -> &[Variable] {
        &self.vars
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn set_segments(&mut self, mut segments: Vec<Segment>) {
        segments.sort();
        self.segments = segments;
    }

    pub fn segment_count(&self, kind: SegmentKind) -> usize {
        self.segments.iter().filter(|s| s.kind == kind).count()
    }

    pub fn get_routine(&self, idx: usize) -> Option<&Routine> {
        self.routines.get(idx)
    }

    pub fn get_routine_by_name(&self, name: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| r.name == name)
    }

    pub fn get_routine_mut(&mut self, name: &str) -> Option<&mut Routine> {
        self.routines.iter_mut().find(|r| r.name == name)
    }

    /// Routine owning an address, by extents or by any reachable block.
    pub fn routine_at(&self, addr: &Address) -> Option<&Routine> {
        self.routines
            .iter()
            .find(|r| r.extents.contains(addr) || r.reachable.iter().any(|b| b.contains(addr)))
    }

    pub fn find_by_entrypoint(&self, ep: &Address) -> Option<&Routine> {
        self.routines.iter().find(|r| r.entrypoint() == *ep)
    }

    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn get_variable_at(&self, addr: &Address) -> Option<&Variable> {
        self.vars.iter().find(|v| v.addr == *addr)
    }

    pub fn add_variable(&mut self, v: Variable) {
        self.vars.push(v);
    }

    /// First block from any routine crossing over the given one.
    pub fn find_collision(&self, b: &Block) -> Option<Block> {
        for r in &self.routines {
            for rb in r.reachable.iter().chain(r.unreachable.iter()) {
                if rb.intersects(b) {
                    return Some(*rb);
                }
            }
        }
        None
    }

    /// Routine whose extents or blocks collide with the given block.
    pub fn colides_block(&self, b: &Block) -> Option<&Routine> {
        self.routines.iter().find(|r| r.colides(b, true))
    }

    /// Counts routines with equal extents in another map; with `only_entry`
    /// a shared entrypoint is enough.
    pub fn match_map(&self, other: &CodeMap, only_entry: bool) -> usize {
        let mut count = 0;
        for r in &self.routines {
            let matched = other.routines.iter().any(|o| {
                r.extents == o.extents || (only_entry && r.entrypoint() == o.entrypoint())
            });
            if matched {
                count += 1;
            } else {
                debug!("unable to find match for {}", r);
            }
        }
        count
    }

    pub fn find_segment(&self, addr: u16) -> Option<&Segment> {
        self.segments.iter().find(|s| s.address == addr)
    }

    pub fn find_segment_by_name(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// Last segment containing the linear offset within a 64 KB span, or
    /// with `past` the first segment starting beyond the offset.
    pub fn find_segment_for_offset(&self, off: Offset, past: bool) -> Option<&Segment> {
        let mut ret = None;
        for s in &self.segments {
            let seg_off = seg_to_offset(s.address);
            if past && seg_off > off {
                return Some(s);
            }
            if seg_off <= off && off - seg_off <= 0xffff {
                ret = Some(s);
            }
        }
        if past {
            None
        } else {
            ret
        }
    }

    /// Recalculates routine extents and sorts the whole map.
    pub fn order(&mut self) {
        debug!("recalculating routine extents and sorting map");
        for r in &mut self.routines {
            r.recalculate_extents();
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.routines.sort();
        self.unclaimed.sort();
        for r in &mut self.routines {
            r.reachable.sort();
            r.unreachable.sort();
        }
        self.segments.sort();
        self.vars.sort();
    }

    fn store_variable(&mut self, v: Variable) {
        if self.find_segment(v.addr.segment).is_none() {
            debug!(
                "unable to store variable at {}, no record of segment {:#x}",
                v.addr, v.addr.segment
            );
            return;
        }
        if v.name.is_empty() {
            let name = format!("var_{}", self.vars.len() + 1);
            self.vars.push(Variable::new(name, v.addr));
        } else {
            self.vars.push(v);
        }
    }

    // Walks the visited map byte by byte, closing a block at every routine
    // id transition, at routine entrypoints, and at segment boundaries the
    // open block cannot span.
    fn blocks_from_queue(&mut self, sq: &ScanQueue, unclaimed_only: bool) -> Result<()> {
        let start_offset = seg_to_offset(self.load_segment);
        let mut end_offset = start_offset + self.map_size;
        let mut b = Block::at(Address::from_linear(start_offset)?);
        let mut walk = BlockWalk::default();
        let mut cur_seg: Option<Segment> = None;
        debug!(
            "walking visited map from {:#x} to {:#x}, map size {}",
            start_offset,
            end_offset,
            size_str(self.map_size)
        );
        let mut map_offset = start_offset;
        while map_offset < end_offset {
            walk.cur_id = sq.get_routine_idx(map_offset);
            // locate the segment for the current offset
            let new_seg = match self.find_segment_for_offset(map_offset, false) {
                Some(s) => s.clone(),
                None => {
                    warn!("unable to find segment for offset {:#x} while generating code map", map_offset);
                    match self.find_segment_for_offset(map_offset, true) {
                        Some(s) => {
                            // skip the hole up to the next known segment
                            let s = s.clone();
                            debug!("skipping to next segment {}, closing block {}", s, b);
                            self.close_block(&mut walk, &b, map_offset, sq, unclaimed_only)?;
                            b = Block::invalid();
                            map_offset = seg_to_offset(s.address);
                            continue;
                        }
                        None => {
                            error!("no more segments, ignoring remainder of address space");
                            end_offset = map_offset;
                            break;
                        }
                    }
                }
            };
            if cur_seg.as_ref() != Some(&new_seg) {
                cur_seg = Some(new_seg.clone());
                debug!("=== segment change to {}", new_seg);
                // the open block may no longer fit the new segment
                if !b.begin.in_segment(new_seg.address) {
                    self.close_block(&mut walk, &b, map_offset, sq, unclaimed_only)?;
                    if walk.cur_id == walk.prev_id {
                        // reopen in the new segment so the run is not lost
                        let mut reopen = Address::from_linear(map_offset)?;
                        reopen.move_to_segment(new_seg.address)?;
                        b = Block::at(reopen);
                        debug!("{}: forced reopen of block for routine {}", reopen, walk.cur_id);
                    } else {
                        b = Block::invalid();
                    }
                }
            }
            let seg_address = cur_seg.as_ref().unwrap().address;
            let mut cur_addr = Address::from_linear(map_offset)?;
            cur_addr.move_to_segment(seg_address)?;
            // nothing to do until the id changes, unless a routine
            // entrypoint forces a block boundary mid-run
            if walk.cur_id == walk.prev_id && sq.is_entrypoint(&cur_addr) == NULL_ROUTINE {
                map_offset += 1;
                continue;
            }
            if map_offset != start_offset {
                self.close_block(&mut walk, &b, map_offset, sq, unclaimed_only)?;
            }
            debug!("{}: starting block for routine {}", cur_addr, walk.cur_id);
            b = Block::at(cur_addr);
            walk.cur_block_id = walk.cur_id;
            walk.prev_id = walk.cur_id;
            map_offset += 1;
        }
        debug!("closing final block {} at offset {:#x}", b, end_offset);
        self.close_block(&mut walk, &b, end_offset, sq, unclaimed_only)
    }

    // Closes the open block just before `next_linear` and attributes it:
    // owned id -> reachable, null id sandwiched by one routine ->
    // unreachable, anything else -> unclaimed.
    fn close_block(
        &mut self,
        walk: &mut BlockWalk,
        open: &Block,
        next_linear: Offset,
        sq: &ScanQueue,
        unclaimed_only: bool,
    ) -> Result<()> {
        if !open.is_valid() || next_linear == open.begin.to_linear() {
            return Ok(());
        }
        let mut b = *open;
        b.end = Address::from_linear(next_linear - 1)?;
        b.end.move_to_segment(b.begin.segment)?;
        if !b.is_valid() {
            return Err(Error::Analysis(format!("attempted to close invalid block {}", b)));
        }
        debug!(
            "closing block {}, cur_id {}, prev_id {}, cur_block_id {}, prev_block_id {}",
            b, walk.cur_id, walk.prev_id, walk.cur_block_id, walk.prev_block_id
        );

        if unclaimed_only {
            // rebuilding from a saved map: routine blocks are known, only
            // the gaps between them are of interest
            if walk.cur_block_id == NULL_ROUTINE {
                self.unclaimed.push(b);
            }
            walk.prev_block_id = walk.cur_block_id;
            return Ok(());
        }

        if walk.cur_block_id > NULL_ROUTINE {
            // reachable code of the owning routine
            let idx = walk.cur_block_id as usize - 1;
            if idx >= self.routines.len() {
                return Err(Error::Logic(format!("routine index {} out of range", idx + 1)));
            }
            let ep_segment = self.routines[idx].entrypoint().segment;
            b.move_to_segment(ep_segment)?;
            if sq.is_entrypoint(&b.begin) != NULL_ROUTINE {
                debug!("    block starts at routine entrypoint");
            }
            self.routines[idx].reachable.push(b);
        } else if walk.prev_block_id > NULL_ROUTINE && walk.cur_id == walk.prev_block_id {
            // unreachable gap surrounded by the same routine on both sides
            let idx = walk.prev_block_id as usize - 1;
            if idx >= self.routines.len() {
                return Err(Error::Logic(format!("routine index {} out of range", idx + 1)));
            }
            let ep_segment = self.routines[idx].entrypoint().segment;
            b.move_to_segment(ep_segment)?;
            self.routines[idx].unreachable.push(b);
        } else {
            self.unclaimed.push(b);
        }

        walk.prev_block_id = walk.cur_block_id;
        Ok(())
    }

    // String form of a routine for the map file; the Display impl is the
    // human-oriented variant.
    fn routine_string(&self, r: &Routine, reloc: u16) -> Result<String> {
        let mut rextent = r.extents;
        if !rextent.is_valid() {
            return Err(Error::Analysis(format!("invalid extents for routine {}", r.name)));
        }
        rextent.rebase(reloc)?;
        if !rextent.single_segment() {
            return Err(Error::Analysis(format!(
                "extents of routine {} span different segments: {}",
                r.name, rextent
            )));
        }
        let rseg = self.find_segment(r.extents.begin.segment).ok_or_else(|| {
            Error::Analysis(format!(
                "unable to find segment for routine {}, start {}",
                r.name,
                r.extents.begin
            ))
        })?;
        let mut str = String::new();
        for c in &r.comments {
            let _ = writeln!(str, "# {}", c);
        }
        let _ = write!(
            str,
            "{}: {} {} {}",
            r.name,
            rseg.name,
            if r.near { "NEAR" } else { "FAR" },
            rextent.to_hex()
        );
        if r.unclaimed {
            let _ = write!(str, " U{}", rextent.to_hex());
        } else {
            for b in r.sorted_blocks() {
                let mut rblock = b;
                rblock.rebase(reloc)?;
                if rblock.begin.segment != rextent.begin.segment {
                    return Err(Error::Analysis(format!(
                        "block of routine {} lies in a different segment than its extents: {}",
                        r.name, rblock
                    )));
                }
                if !rblock.single_segment() {
                    return Err(Error::Analysis(format!(
                        "block of routine {} spans different segments: {}",
                        r.name, rblock
                    )));
                }
                let _ = write!(
                    str,
                    " {}{}",
                    if r.is_reachable(&b) { "R" } else { "U" },
                    rblock.to_hex()
                );
            }
        }
        if r.ignore {
            str.push_str(" ignore");
        }
        if r.complete {
            str.push_str(" complete");
        }
        if r.external {
            str.push_str(" external");
        }
        if r.detached {
            str.push_str(" detached");
        }
        if r.assembly {
            str.push_str(" assembly");
        }
        if r.duplicate {
            str.push_str(" duplicate");
        }
        Ok(str)
    }

    // Variable offsets are relative to their segment already, so there is
    // no relocation to reverse here.
    fn var_string(&self, v: &Variable) -> Result<String> {
        if !v.addr.is_valid() {
            return Err(Error::Arg(format!("invalid address for variable {}", v.name)));
        }
        let vseg = self.find_segment(v.addr.segment).ok_or_else(|| {
            Error::Analysis(format!("unable to find segment for variable {}", v))
        })?;
        let mut str = format!("{}: {} VAR {:x}", v.name, vseg.name, v.addr.offset);
        if v.external {
            str.push_str(" external");
        }
        if v.bss {
            str.push_str(" bss");
        }
        Ok(str)
    }

    /// Writes the map in its editable text form, with a preamble explaining
    /// the format. Saving over an existing file requires `overwrite`.
    pub fn save(&self, path: impl AsRef<Path>, reloc: u16, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if self.is_empty() {
            return Ok(());
        }
        if path.exists() && !overwrite {
            return Err(Error::Analysis(format!("map file already exists: {}", path.display())));
        }
        info!(
            "saving code map ({} routines) to {}, reversing relocation by {:#x}",
            self.routine_count(),
            path.display(),
            reloc
        );
        let mut out = String::new();
        if self.ida {
            out.push_str(concat!(
                "# ================== !!! WARNING !!! ==================\n",
                "# The content of this mapfile has been deduced from loading an IDA listing, which is not 100% reliable.\n",
                "# Please verify these values (particularly the load module size and segment addresses), and tweak manually if needed\n",
                "# before using this mapfile for further processing by the tooling.\n",
            ));
        }
        out.push_str("#\n# Size of the executable's load module covered by the map\n#\n");
        let _ = writeln!(out, "Size {:x}", self.map_size);
        out.push_str(concat!(
            "#\n",
            "# Discovered segments, one per line, syntax is \"SegmentName Type(CODE/DATA/STACK) Address\"\n",
            "#\n",
        ));
        for s in &self.segments {
            let mut s = s.clone();
            s.address -= reloc;
            let _ = writeln!(out, "{}", s);
        }
        out.push_str(concat!(
            "#\n",
            "# Discovered routines, one per line, syntax is \"RoutineName: Segment Type(NEAR/FAR) Extents [R/U]Block1 [R/U]Block2... [annotation1] [annotation2]...\"\n",
            "# The routine extents is the largest continuous block of instructions attributed to this routine and originating\n",
            "# at the location determined to be the routine's entrypoint.\n",
            "# Blocks are offset ranges relative to the segment that the routine belongs to, specifying address as belonging to the routine.\n",
            "# Blocks starting with R contain code that was determined reachable, U were unreachable but still likely belong to the routine.\n",
            "# The routine blocks may cover a greater area than the extents if the routine has disconected chunks it jumps into.\n",
            "# Possible annotation types:\n",
            "# ignore - ignore this routine in processing (comparison, signature extraction etc.)\n",
            "# complete - this routine was completely reconstructed into C, only influences stat display when printing map\n",
            "# external - is part of an external library (e.g. libc), ignore in comparison, don't count as uncompleted in stats\n",
            "# detached - routine has no callers, looks useless, don't count as uncompleted in stats\n",
            "# assembly - routine was written in assembly, don't include in comparisons by default\n",
            "# duplicate - routine is a duplicate of another\n",
            "#\n",
        ));
        for r in &self.routines {
            let _ = writeln!(out, "{}", self.routine_string(r, reloc)?);
        }
        out.push_str(concat!(
            "#\n",
            "# Discovered variables, one per line, syntax is \"VariableName: Segment VAR OffsetWithinSegment\"\n",
            "#\n",
        ));
        for v in &self.vars {
            let _ = writeln!(out, "{}", self.var_string(v)?);
        }
        fs::write(path, out)?;
        Ok(())
    }

    fn load_from_map_file(&mut self, path: &Path, reloc: u16) -> Result<()> {
        debug!("loading code map from {}, relocating to {:#x}", path.display(), reloc);
        let file = fs::File::open(path)?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let lineno = lineno + 1;
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(cap) = SIZE_RE.captures(line) {
                self.map_size = Offset::from_str_radix(&cap[1], 16)
                    .map_err(|_| Error::parse_line(lineno, "invalid map size"))?;
                debug!("parsed map size {}", size_str(self.map_size));
                continue;
            }
            if let Some(seg) = Segment::parse(line) {
                let mut seg = seg.map_err(|e| Error::parse_line(lineno, e.to_string()))?;
                seg.address += reloc;
                debug!("parsed segment: {}", seg);
                self.segments.push(seg);
                continue;
            }
            if let Some(cap) = VAR_RE.captures(line) {
                let (name, segname, offstr, attrs) = (&cap[1], &cap[2], &cap[3], &cap[4]);
                let vseg = self.find_segment_by_name(segname).ok_or_else(|| {
                    Error::parse_line(lineno, format!("unknown segment '{}'", segname))
                })?;
                let addr = Address::new(vseg.address, u16::from_str_radix(offstr, 16).unwrap());
                let mut var = Variable::new(name, addr);
                for attr in attrs.split_whitespace() {
                    match attr {
                        "external" => var.external = true,
                        "bss" => var.bss = true,
                        other => {
                            return Err(Error::parse_line(
                                lineno,
                                format!("invalid variable attribute: '{}'", other),
                            ))
                        }
                    }
                }
                self.vars.push(var);
                continue;
            }
            self.parse_routine_line(line, lineno)?;
        }
        if self.map_size == 0 {
            return Err(Error::Parse("invalid or undefined map size".into()));
        }
        Ok(())
    }

    fn parse_routine_line(&mut self, line: &str, lineno: usize) -> Result<()> {
        enum BlockKind {
            None,
            Extents,
            Reachable,
            Unreachable,
        }
        let mut r = Routine::invalid();
        let mut rseg: Option<Segment> = None;
        for (tokenno, token) in line.split_whitespace().enumerate() {
            let mut kind = BlockKind::None;
            let mut token = token;
            match tokenno {
                0 => {
                    if !token.ends_with(':') {
                        return Err(Error::parse_line(
                            lineno,
                            format!("invalid routine name token syntax '{}'", token),
                        ));
                    }
                    r.name = token[..token.len() - 1].to_string();
                    continue;
                }
                1 => {
                    rseg = Some(
                        self.find_segment_by_name(token)
                            .ok_or_else(|| {
                                Error::parse_line(lineno, format!("unknown segment '{}'", token))
                            })?
                            .clone(),
                    );
                    continue;
                }
                2 => {
                    match token {
                        "NEAR" => r.near = true,
                        "FAR" => r.near = false,
                        other => {
                            return Err(Error::parse_line(
                                lineno,
                                format!("invalid routine type '{}'", other),
                            ))
                        }
                    }
                    continue;
                }
                3 => kind = BlockKind::Extents,
                _ => {
                    if let Some(rest) = token.strip_prefix('R') {
                        kind = BlockKind::Reachable;
                        token = rest;
                    } else if let Some(rest) = token.strip_prefix('U') {
                        kind = BlockKind::Unreachable;
                        token = rest;
                    } else {
                        match token {
                            "ignore" => r.ignore = true,
                            "complete" => r.complete = true,
                            "external" => {
                                r.ignore = true;
                                r.external = true;
                            }
                            "detached" => {
                                r.ignore = true;
                                r.detached = true;
                            }
                            "assembly" => r.assembly = true,
                            "duplicate" => r.duplicate = true,
                            other => {
                                return Err(Error::parse_line(
                                    lineno,
                                    format!("invalid token: '{}'", other),
                                ))
                            }
                        }
                        continue;
                    }
                }
            }
            let seg = rseg.as_ref().ok_or_else(|| {
                Error::parse_line(lineno, "routine block before segment name")
            })?;
            let cap = RANGE_RE.captures(token).ok_or_else(|| {
                Error::parse_line(lineno, format!("invalid routine block '{}'", token))
            })?;
            let block = Block::new(
                Address::new(seg.address, u16::from_str_radix(&cap[1], 16).unwrap()),
                Address::new(seg.address, u16::from_str_radix(&cap[2], 16).unwrap()),
            );
            // adding a block intersecting anything already claimed is fatal
            let collision = match self.colides_block(&block) {
                Some(other) => Some(other.name.clone()),
                None if r.colides(&block, false) => Some(r.name.clone()),
                None => None,
            };
            if let Some(name) = collision {
                return Err(Error::parse_line(
                    lineno,
                    format!("block {} colides with routine {}", block, name),
                ));
            }
            match kind {
                BlockKind::Extents => r.extents = block,
                BlockKind::Reachable => r.reachable.push(block),
                BlockKind::Unreachable => r.unreachable.push(block),
                BlockKind::None => {}
            }
        }
        if !r.extents.is_valid() {
            return Err(Error::parse_line(lineno, format!("invalid routine extents {}", r.extents)));
        }
        debug!("routine: {}", r);
        r.idx = self.routines.len() + 1;
        self.routines.push(r);
        Ok(())
    }

    // Builds a map from a Microsoft LINK mapfile: segment definitions
    // become segments, publics become routines (CODE) or variables (DATA).
    fn load_from_link_file(&mut self, path: &Path, reloc: u16) -> Result<()> {
        debug!("loading linker mapfile {}, relocation factor {:#x}", path.display(), reloc);
        #[derive(PartialEq)]
        enum Mode {
            None,
            Segments,
            Publics,
        }
        let mut mode = Mode::None;
        let mut total_size: Offset = 0;
        let file = fs::File::open(path)?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let lineno = lineno + 1;
            let line = line?;
            if mode != Mode::Segments && LINK_SEGMENTS_RE.is_match(&line) {
                mode = Mode::Segments;
                continue;
            }
            if mode != Mode::Publics && LINK_PUBLICS_RE.is_match(&line) {
                mode = Mode::Publics;
                continue;
            }
            if LINK_PUBVAL_RE.is_match(&line) {
                mode = Mode::None;
                continue;
            }
            if mode == Mode::Segments {
                if let Some(cap) = LINK_SEGDEF_RE.captures(&line) {
                    let start = Offset::from_str_radix(&cap[1], 16).unwrap();
                    let stop = Offset::from_str_radix(&cap[2], 16).unwrap();
                    if start > stop {
                        return Err(Error::parse_line(lineno, "start offset above stop offset"));
                    }
                    let name = &cap[4];
                    let class = &cap[5];
                    let seg_addr = offset_to_seg(start) + reloc;
                    if stop > total_size {
                        total_size = stop;
                    }
                    if self.find_segment(seg_addr).is_some() {
                        continue;
                    }
                    let kind = if class == "CODE" {
                        SegmentKind::Code
                    } else if class.starts_with("DAT")
                        || matches!(class, "BSS" | "CONST" | "MP" | "FAR_DATA" | "FAR_BSS")
                    {
                        SegmentKind::Data
                    } else {
                        debug!("ignoring segment of class '{}'", class);
                        continue;
                    };
                    self.segments.push(Segment::new(name, kind, seg_addr));
                }
            } else if mode == Mode::Publics {
                if let Some(cap) = LINK_PUBDEF_RE.captures(&line) {
                    let mut addr = Address::new(
                        u16::from_str_radix(&cap[1], 16).unwrap(),
                        u16::from_str_radix(&cap[2], 16).unwrap(),
                    );
                    addr.relocate(reloc)?;
                    let name = &cap[3];
                    let seg = match self.find_segment(addr.segment) {
                        Some(s) => s,
                        None => {
                            debug!("no segment at {:#x} for public {}, ignoring", addr.segment, name);
                            continue;
                        }
                    };
                    match seg.kind {
                        SegmentKind::Code => {
                            if self.routine_at(&addr).is_some() {
                                continue;
                            }
                            let mut r = Routine::new(name, Block::at(addr));
                            r.idx = self.routines.len() + 1;
                            self.routines.push(r);
                        }
                        SegmentKind::Data => {
                            if self.get_variable_at(&addr).is_some() {
                                continue;
                            }
                            self.vars.push(Variable::new(name, addr));
                        }
                        SegmentKind::Stack => {}
                    }
                }
            }
        }
        self.map_size = total_size;
        debug!(
            "finished parsing linker map, map size {:#x}, {} segments",
            self.map_size,
            self.segments.len()
        );
        Ok(())
    }

    // Best-effort map from an IDA listing; segment start positions are a
    // paragraph-aligned guess, so the output carries a warning banner.
    fn load_from_ida_file(&mut self, path: &Path, reloc: u16) -> Result<()> {
        debug!("loading IDA listing from {}, relocation factor {:#x}", path.display(), reloc);
        self.ida = true;
        let file = fs::File::open(path)?;
        let mut global_pos: Offset = 0;
        let mut prev_offset: u16 = 0;
        let mut cur_segment: Option<Segment> = None;
        let mut cur_proc: Option<Routine> = None;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let lineno = lineno + 1;
            let line = line?;
            let mut tokens = line.split_whitespace();
            let addr_str = match tokens.next() {
                Some(t) => t,
                None => continue,
            };
            let name_str = match tokens.next() {
                Some(t) => t,
                None => continue,
            };
            if name_str.starts_with(';') {
                // the loaded length comment tells us the map size
                if self.map_size == 0 {
                    if let Some(cap) = IDA_LOADLEN_RE.captures(&line) {
                        self.map_size = Offset::from_str_radix(&cap[1], 16).unwrap();
                        debug!("extracted loaded length {:#x} from line {}", self.map_size, lineno);
                    }
                }
                continue;
            }
            let cap = match IDA_ADDR_RE.captures(addr_str) {
                Some(c) => c,
                None => continue,
            };
            let offset_val = u16::from_str_radix(&cap[2], 16)
                .map_err(|_| Error::parse_line(lineno, "invalid address offset"))?;
            let type_str = match tokens.next() {
                Some(t) => t.to_lowercase(),
                None => continue,
            };
            match type_str.as_str() {
                "segment" => {
                    if cur_segment.is_some() {
                        return Err(Error::parse_line(
                            lineno,
                            "new segment opening while previous still open",
                        ));
                    }
                    let cls = tokens.nth(2).ok_or_else(|| {
                        Error::parse_line(lineno, "invalid segment definition")
                    })?;
                    let kind = match cls {
                        "'CODE'" => SegmentKind::Code,
                        "'DATA'" => SegmentKind::Data,
                        "'STACK'" => SegmentKind::Stack,
                        other => {
                            return Err(Error::parse_line(
                                lineno,
                                format!("unrecognized segment class {}", other),
                            ))
                        }
                    };
                    // guess the segment start by padding to a paragraph
                    if global_pos != 0 {
                        global_pos += PARAGRAPH_SIZE - (global_pos % PARAGRAPH_SIZE);
                    }
                    let mut seg_addr = Address::from_linear(global_pos)?;
                    seg_addr.normalize();
                    cur_segment = Some(Segment::new(name_str, kind, seg_addr.segment + reloc));
                    prev_offset = 0;
                }
                "ends" => {
                    if let Some(seg) = cur_segment.take() {
                        self.segments.push(seg);
                    }
                }
                "proc" => {
                    if cur_proc.is_some() {
                        return Err(Error::parse_line(
                            lineno,
                            format!("opening proc '{}' while previous still open", name_str),
                        ));
                    }
                    let seg = cur_segment.as_ref().ok_or_else(|| {
                        Error::parse_line(lineno, "proc outside of segment")
                    })?;
                    let mut r =
                        Routine::new(name_str, Block::at(Address::new(seg.address, offset_val)));
                    if tokens.next() == Some("far") {
                        r.near = false;
                    }
                    cur_proc = Some(r);
                }
                "endp" => {
                    let mut r = cur_proc.take().ok_or_else(|| {
                        Error::parse_line(lineno, format!("closing proc '{}' without open", name_str))
                    })?;
                    if r.name != name_str {
                        return Err(Error::parse_line(
                            lineno,
                            format!("closing proc '{}' while '{}' open", name_str, r.name),
                        ));
                    }
                    let seg = cur_segment.as_ref().ok_or_else(|| {
                        Error::parse_line(lineno, "endp outside of segment")
                    })?;
                    r.extents.end = Address::new(seg.address, offset_val);
                    r.reachable.push(r.extents);
                    r.idx = self.routines.len() + 1;
                    self.routines.push(r);
                }
                "db" | "dw" | "dd" => {
                    if let Some(seg) = cur_segment.as_ref() {
                        self.vars
                            .push(Variable::new(name_str, Address::new(seg.address, offset_val)));
                    }
                }
                _ => {}
            }
            if offset_val < prev_offset {
                return Err(Error::parse_line(
                    lineno,
                    format!("offsets going backwards ({:#x} -> {:#x})", prev_offset, offset_val),
                ));
            }
            global_pos += (offset_val - prev_offset) as Offset;
            prev_offset = offset_val;
        }
        Ok(())
    }

    /// Builds the summary report partitioning the code size into the
    /// completed/uncompleted/assembly/ignored/unclaimed categories; the
    /// "unaccounted" residual is a consistency check and must be zero.
    pub fn summary(&self, verbose: bool, brief: bool, format: bool) -> Result<Summary> {
        let mut sum = Summary::default();
        let mut text = String::new();
        if self.is_empty() {
            text.push_str("--- Empty code map\n");
            sum.text = text;
            return Ok(sum);
        }

        // fake routines stand in for unclaimed blocks while printing
        let mut print_routines = self.routines.clone();
        for (i, b) in self.unclaimed.iter().enumerate() {
            let mut r = Routine::new(format!("unclaimed_{}", i + 1), *b);
            r.unclaimed = true;
            print_routines.push(r);
        }
        print_routines.sort();

        let map_count = self.routine_count();
        let _ = writeln!(text, "--- Map contains {} routines", map_count);
        let _ = writeln!(text, "Size {}", size_str(self.map_size));
        for s in &self.segments {
            let _ = writeln!(text, "{}", s);
        }

        for r in &print_routines {
            let seg_kind = self
                .find_segment(r.extents.begin.segment)
                .map(|s| s.kind)
                .unwrap_or(SegmentKind::Data);
            if seg_kind == SegmentKind::Code {
                sum.code_size += r.size();
                if r.ignore {
                    sum.ignored_size += r.size();
                    sum.ignore_count += 1;
                }
                if r.complete {
                    sum.completed_size += r.size();
                    sum.complete_count += 1;
                }
                if r.unclaimed {
                    sum.unclaimed_size += r.size();
                    sum.unclaimed_count += 1;
                }
                if r.external {
                    sum.external_size += r.size();
                    sum.external_count += 1;
                }
                if r.detached {
                    sum.detached_size += r.size();
                    sum.detached_count += 1;
                }
                if r.assembly {
                    sum.assembly_size += r.size();
                    sum.assembly_count += 1;
                }
            } else if !r.unclaimed {
                sum.data_code_size += r.size();
                sum.data_code_count += 1;
            }
            // in brief mode show only the interesting leftovers
            let hidden = brief
                && (r.ignore
                    || r.complete
                    || r.external
                    || r.assembly
                    || r.size() < 3
                    || seg_kind != SegmentKind::Code);
            if !hidden {
                if format {
                    let _ = writeln!(text, "{}", self.routine_string(r, 0)?);
                } else if verbose {
                    let _ = writeln!(text, "{}", r.dump_blocks());
                } else {
                    let _ = writeln!(text, "{}", r);
                }
            }
        }
        if sum.code_size > self.map_size {
            return Err(Error::Logic(format!(
                "accumulated code size {} exceeds total map size {}",
                size_str(sum.code_size),
                size_str(self.map_size)
            )));
        }

        if !self.vars.is_empty() {
            let _ = writeln!(text, "--- Map contains {} variables", self.vars.len());
            for v in &self.vars {
                let _ = writeln!(text, "{}", self.var_string(v)?);
            }
        }

        sum.data_size = self.map_size - sum.code_size;
        sum.other_size = sum.ignored_size as i64 - sum.external_size as i64;
        sum.other_count = sum.ignore_count as i64 - sum.external_count as i64;
        sum.ignored_reachable_size = sum.other_size - sum.detached_size as i64;
        sum.ignored_reachable_count = sum.other_count - sum.detached_count as i64;
        sum.uncomplete_size = sum.code_size as i64
            - (sum.completed_size + sum.ignored_size + sum.assembly_size + sum.unclaimed_size)
                as i64;
        sum.uncomplete_count = map_count as i64
            - (sum.complete_count + sum.ignore_count + sum.data_code_count + sum.assembly_count)
                as i64;
        sum.unaccounted_size = sum.code_size as i64
            - (sum.completed_size as i64
                + sum.uncomplete_size
                + sum.assembly_size as i64
                + sum.external_size as i64
                + sum.ignored_reachable_size
                + sum.detached_size as i64
                + sum.unclaimed_size as i64);
        sum.unaccounted_count = map_count as i64
            - (sum.complete_count as i64
                + sum.uncomplete_count
                + sum.assembly_count as i64
                + sum.external_count as i64
                + sum.ignored_reachable_count
                + sum.detached_count as i64
                + sum.data_code_count as i64);

        let _ = writeln!(text, "--- Summary:");
        let _ = writeln!(
            text,
            "Code size: {} ({} of load module)",
            size_str(sum.code_size),
            ratio_str(sum.code_size as i64, self.map_size as i64)
        );
        let _ = writeln!(
            text,
            "  Completed: {} ({} routines, {} of code) - 1:1 rewritten to high level language",
            size_str(sum.completed_size),
            sum.complete_count,
            ratio_str(sum.completed_size as i64, sum.code_size as i64)
        );
        let _ = writeln!(
            text,
            "  Uncompleted: {} ({} routines, {} of code) - routines not yet rewritten which can be",
            sum.uncomplete_size,
            sum.uncomplete_count,
            ratio_str(sum.uncomplete_size, sum.code_size as i64)
        );
        let _ = writeln!(
            text,
            "  Assembly: {} ({} routines, {} of code) - impossible to rewrite 1:1",
            size_str(sum.assembly_size),
            sum.assembly_count,
            ratio_str(sum.assembly_size as i64, sum.code_size as i64)
        );
        let _ = writeln!(
            text,
            "  Ignored: {} ({} routines, {} of code) - excluded from comparison",
            size_str(sum.ignored_size),
            sum.ignore_count,
            ratio_str(sum.ignored_size as i64, sum.code_size as i64)
        );
        let _ = writeln!(
            text,
            "    External: {} ({} routines, {} of ignored) - e.g. libc library code",
            size_str(sum.external_size),
            sum.external_count,
            ratio_str(sum.external_size as i64, sum.ignored_size as i64)
        );
        let _ = writeln!(
            text,
            "    Other: {} ({} routines, {} of ignored) - code ignored for other reasons",
            sum.other_size,
            sum.other_count,
            ratio_str(sum.other_size, sum.ignored_size as i64)
        );
        let _ = writeln!(
            text,
            "      Reachable: {} ({} routines, {} of other) - code which has callers",
            sum.ignored_reachable_size,
            sum.ignored_reachable_count,
            ratio_str(sum.ignored_reachable_size, sum.other_size)
        );
        let _ = writeln!(
            text,
            "      Unreachable: {} ({} routines, {} of other) - code which appears unreachable",
            size_str(sum.detached_size),
            sum.detached_count,
            ratio_str(sum.detached_size as i64, sum.other_size)
        );
        let _ = writeln!(
            text,
            "  Unclaimed: {} ({} blocks, {} of code) - holes between routines not covered by map",
            size_str(sum.unclaimed_size),
            sum.unclaimed_count,
            ratio_str(sum.unclaimed_size as i64, sum.code_size as i64)
        );
        let _ = writeln!(
            text,
            "  Unaccounted: {} ({} routines) - consistency check, should be zero",
            sum.unaccounted_size, sum.unaccounted_count
        );
        let _ = writeln!(
            text,
            "Data size: {} ({} of load module)",
            size_str(sum.data_size),
            ratio_str(sum.data_size as i64, self.map_size as i64)
        );
        let _ = writeln!(
            text,
            "  Routines in data segment: {}, {} routines",
            size_str(sum.data_code_size),
            sum.data_code_count
        );
        sum.text = text;
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterState;
    use crate::scanq::Destination;

    fn linear(off: Offset) -> Address {
        Address::from_linear(off).unwrap()
    }

    fn block(begin: Offset, end: Offset) -> Block {
        Block::from_linear(begin, end).unwrap()
    }

    // Reconstructs the canonical visited-map walk scenario: three routines
    // across four code segments, with the final unreachable run overflowing
    // the segment where it starts.
    #[test]
    fn test_map_from_queue() {
        let load_segment = 0u16;
        #[rustfmt::skip]
        let visited: Vec<RoutineIdx> = {
            let mut v = vec![
            //  0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f
                0, 0, 1, 1, 1, 0, 0, 0, 1, 1, 1, 1, 2, 2, 0, 0, // 0
                0, 1, 1, 3, 3, 3, 3, 0, 0, 0, 0, 0, 0, 2, 2, 2, // 1
                3, 3, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, // 2
                0, 0,                                           // 3
            ];
            v.extend(std::iter::repeat(0).take(70000));
            v
        };
        let map_size = visited.len();
        let seed = Destination::new(linear(0x8), 1, true, RegisterState::new());
        let mut sq = ScanQueue::new(linear(0), map_size, seed, None);
        sq.save_call(&linear(0xc), &RegisterState::new(), true, None);
        sq.save_call(&linear(0x13), &RegisterState::new(), true, None);
        for (off, idx) in visited.iter().enumerate() {
            if *idx != NULL_ROUTINE {
                sq.set_routine_idx(off, 1, Some(*idx)).unwrap();
            }
        }
        let segments = vec![
            Segment::new("TestSeg1", SegmentKind::Code, 0x0),
            Segment::new("TestSeg2", SegmentKind::Code, 0x1),
            Segment::new("TestSeg3", SegmentKind::Code, 0x2),
            Segment::new("TestSeg4", SegmentKind::Code, 0x3),
        ];
        let map = CodeMap::from_queue(&sq, &segments, &[], load_segment, map_size).unwrap();
        assert_eq!(map.routine_count(), 3);

        let r1 = map.get_routine(0).unwrap();
        assert!(!r1.name.is_empty());
        assert_eq!(r1.extents, block(0x8, 0xb));
        assert_eq!(r1.reachable.len(), 3);
        assert_eq!(r1.reachable[0], block(0x2, 0x4));
        assert_eq!(r1.reachable[1], block(0x8, 0xb));
        assert_eq!(r1.reachable[2], block(0x11, 0x12));
        assert_eq!(r1.unreachable.len(), 1);
        assert_eq!(r1.unreachable[0], block(0x5, 0x7));

        let r2 = map.get_routine(1).unwrap();
        assert_eq!(r2.extents, block(0xc, 0xd));
        assert_eq!(r2.reachable.len(), 2);
        assert_eq!(r2.reachable[0], block(0xc, 0xd));
        assert_eq!(r2.reachable[1], block(0x1d, 0x1f));
        assert!(r2.unreachable.is_empty());

        let r3 = map.get_routine(2).unwrap();
        assert_eq!(r3.extents, block(0x13, 0x16));
        assert_eq!(r3.reachable.len(), 2);
        assert_eq!(r3.reachable[0], block(0x13, 0x16));
        assert_eq!(r3.reachable[1], block(0x20, 0x22));
        assert!(r3.unreachable.is_empty());

        let unclaimed = map.unclaimed();
        assert_eq!(unclaimed.len(), 6);
        assert_eq!(unclaimed[0], block(0x0, 0x1));
        assert_eq!(unclaimed[1], block(0xe, 0xf));
        assert_eq!(unclaimed[2], block(0x10, 0x10));
        assert_eq!(unclaimed[3], block(0x17, 0x1c));
        assert_eq!(unclaimed[4], block(0x23, 0x2f));
        assert_eq!(unclaimed[5], block(0x30, 0x30 + 0xffff));

        let sum = map.summary(false, false, false).unwrap();
        assert_eq!(sum.unaccounted_size, 0);
        assert_eq!(sum.unaccounted_count, 0);
    }

    #[test]
    fn test_collision_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.map");
        let b1 = block(100, 200);
        let b2 = block(150, 250);
        let b3 = block(300, 400);

        let mut map = CodeMap::new(0, 0);
        map.set_segments(vec![Segment::new("Code1", SegmentKind::Code, 0)]);
        map.set_map_size(b3.end.offset as Offset + 1);

        // coliding routine extents
        let mut r1 = Routine::new("r1", b1);
        r1.reachable.push(b1);
        let mut r2 = Routine::new("r2", b2);
        r2.reachable.push(b2);
        map.add_routine(r1.clone());
        map.add_routine(r2);
        map.save(&path, 0, true).unwrap();
        assert!(matches!(CodeMap::load(&path, 0, MapFormat::Map), Err(Error::Parse(_))));

        // coliding extent with a chunk of another routine
        let mut map = CodeMap::new(0, 0);
        map.set_segments(vec![Segment::new("Code1", SegmentKind::Code, 0)]);
        map.set_map_size(b3.end.offset as Offset + 1);
        let mut r3 = Routine::new("r3", b3);
        r3.reachable.push(b3);
        r3.reachable.push(b2);
        map.add_routine(r1.clone());
        map.add_routine(r3);
        map.save(&path, 0, true).unwrap();
        assert!(matches!(CodeMap::load(&path, 0, MapFormat::Map), Err(Error::Parse(_))));

        // no collision loads fine
        let mut map = CodeMap::new(0, 0);
        map.set_segments(vec![Segment::new("Code1", SegmentKind::Code, 0)]);
        map.set_map_size(b3.end.offset as Offset + 1);
        let mut r3 = Routine::new("r3", b3);
        r3.reachable.push(b3);
        map.add_routine(r1);
        map.add_routine(r3);
        map.save(&path, 0, true).unwrap();
        let reloaded = CodeMap::load(&path, 0, MapFormat::Map).unwrap();
        assert_eq!(reloaded.routine_count(), 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.map");
        let load_segment = 0x1000u16;

        let mut map = CodeMap::new(load_segment, 0x100);
        map.set_segments(vec![
            Segment::new("MainCode", SegmentKind::Code, load_segment),
            Segment::new("MainData", SegmentKind::Data, load_segment + 0x8),
        ]);
        let mut r1 = Routine::new("start", Block::new(Address::new(load_segment, 0), Address::new(load_segment, 0x1f)));
        r1.reachable.push(r1.extents);
        r1.unreachable.push(Block::new(Address::new(load_segment, 0x30), Address::new(load_segment, 0x3f)));
        r1.complete = true;
        let mut r2 = Routine::new("helper", Block::new(Address::new(load_segment, 0x40), Address::new(load_segment, 0x4f)));
        r2.reachable.push(r2.extents);
        r2.near = false;
        r2.ignore = true;
        r2.external = true;
        map.add_routine(r1);
        map.add_routine(r2);
        let mut var = Variable::new("counter", Address::new(load_segment + 0x8, 0x10));
        var.bss = true;
        map.add_variable(var);
        map.order();
        map.save(&path, load_segment, false).unwrap();

        // saving again without overwrite fails
        assert!(map.save(&path, load_segment, false).is_err());

        let reloaded = CodeMap::load(&path, load_segment, MapFormat::Map).unwrap();
        assert_eq!(reloaded.routine_count(), 2);
        assert_eq!(reloaded.variable_count(), 1);
        assert_eq!(reloaded.segments().len(), 2);
        let s = reloaded.get_routine_by_name("start").unwrap();
        assert_eq!(s.extents, map.get_routine_by_name("start").unwrap().extents);
        assert_eq!(s.unreachable.len(), 1);
        assert!(s.complete);
        let h = reloaded.get_routine_by_name("helper").unwrap();
        assert!(!h.near);
        assert!(h.ignore && h.external);
        let v = reloaded.get_variable("counter").unwrap();
        assert!(v.bss);
        assert_eq!(v.addr, Address::new(load_segment + 8, 0x10));
        // structural equality of the full routine list
        assert_eq!(reloaded.routines(), map.routines());
        // both maps agree on every extent and entrypoint
        assert_eq!(map.match_map(&reloaded, false), map.routine_count());

        // unclaimed blocks got reconstructed from the gaps
        assert!(!reloaded.unclaimed().is_empty());
        let unclaimed_total: Offset = reloaded.unclaimed().iter().map(Block::size).sum();
        let routine_total: Offset =
            reloaded.routines().iter().map(|r| r.reachable_size() + r.unreachable_size()).sum();
        assert_eq!(unclaimed_total + routine_total, reloaded.code_size());
    }

    #[test]
    fn test_link_map_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.map");
        let text = concat!(
            "\n",
            " Start  Stop   Length Name                   Class\n",
            " 00000H 004B1H 004B2H MAIN_TEXT              CODE\n",
            " 004C0H 007FFH 00340H _DATA                  DATA\n",
            "\n",
            "  Address         Publics by Name\n",
            "\n",
            " 0000:0010       _main\n",
            " 0000:0200       _helper\n",
            " 004C:0004       _counter\n",
            "\n",
            "  Address         Publics by Value\n",
            " 0000:0010       _main\n",
        );
        fs::write(&path, text).unwrap();
        let map = CodeMap::load(&path, 0, MapFormat::MsLink).unwrap();
        assert_eq!(map.segments().len(), 2);
        assert_eq!(map.routine_count(), 2);
        assert_eq!(map.variable_count(), 1);
        let main = map.get_routine_by_name("_main").unwrap();
        assert_eq!(main.entrypoint(), Address::new(0, 0x10));
        let var = map.get_variable("_counter").unwrap();
        assert_eq!(var.addr, Address::new(0x4c, 4));
        assert_eq!(map.code_size(), 0x7ff);
    }

    #[test]
    fn test_ida_listing_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.lst");
        let text = concat!(
            "seg000:0000 ; Loaded length: 50h\n",
            "seg000:0000 seg000 segment byte public 'CODE'\n",
            "seg000:0000 main proc near\n",
            "seg000:0010 main endp\n",
            "seg000:0020 other proc far\n",
            "seg000:0030 other endp\n",
            "seg000:0040 seg000 ends\n",
            "dseg:0000 dseg segment byte public 'DATA'\n",
            "dseg:0002 counter dw 0\n",
            "dseg:0004 dseg ends\n",
        );
        fs::write(&path, text).unwrap();
        let map = CodeMap::load(&path, 0, MapFormat::IdaListing).unwrap();
        assert!(map.is_ida());
        assert_eq!(map.routine_count(), 2);
        assert_eq!(map.segments().len(), 2);
        assert_eq!(map.variable_count(), 1);
        let main = map.get_routine_by_name("main").unwrap();
        assert!(main.near);
        let other = map.get_routine_by_name("other").unwrap();
        assert!(!other.near);
        assert_eq!(map.code_size(), 0x50);
    }
}
