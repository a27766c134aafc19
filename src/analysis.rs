use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::BufRead;
use std::path::Path;

use log::{debug, info, warn};
use smallvec::SmallVec;

use crate::addr::{Address, Block, Offset, SOffset, SegmentKind};
use crate::codemap::CodeMap;
use crate::error::{Error, Result};
use crate::executable::Executable;
use crate::instruction::{Instruction, InstructionClass, InstructionMatch, OperandType};
use crate::registers::{Register, RegisterState};
use crate::routine::{Routine, Variable};
use crate::scanq::{Branch, Destination, ScanQueue};
use crate::signature::{edit_distance, SignatureLibrary};

/// Per-invocation analysis configuration; every tool builds one of these
/// from its command line and hands it to the `Analyzer`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Reject matches with differing literal values; cleared by `--loose`.
    pub strict: bool,
    /// Keep comparing after a mismatch instead of failing the routine.
    pub ignore_diff: bool,
    /// Do not follow calls into new routine comparisons.
    pub no_call: bool,
    /// Allow equivalent instruction sequence rewrites.
    pub variant: bool,
    /// Descend into routines marked as assembly.
    pub check_asm: bool,
    /// Consecutive reference-side instructions a skip may consume.
    pub ref_skip: usize,
    /// Consecutive target-side instructions a skip may consume.
    pub tgt_skip: usize,
    /// Context instructions shown around a mismatch.
    pub ctx_count: usize,
    /// Minimum routine size (instructions) for duplicate search.
    pub routine_size_thresh: usize,
    /// Maximum edit distance for duplicates, as a percentage of size.
    pub routine_distance_thresh: usize,
    /// Address at which comparison stops with a success.
    pub stop_addr: Option<Address>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            strict: true,
            ignore_diff: false,
            no_call: false,
            variant: false,
            check_asm: false,
            ref_skip: 0,
            tgt_skip: 0,
            ctx_count: 10,
            routine_size_thresh: 15,
            routine_distance_thresh: 10,
            stop_addr: None,
        }
    }
}

impl From<&clap::ArgMatches<'_>> for Options {
    fn from(matches: &clap::ArgMatches) -> Self {
        let mut opt = Options::default();
        opt.strict = !matches.is_present("loose");
        opt.ignore_diff = matches.is_present("idiff");
        opt.no_call = matches.is_present("nocall");
        opt.variant = matches.is_present("variant");
        opt.check_asm = matches.is_present("asm");
        if let Some(v) = matches.value_of("rskip") {
            opt.ref_skip = v.parse().unwrap_or(0);
        }
        if let Some(v) = matches.value_of("tskip") {
            opt.tgt_skip = v.parse().unwrap_or(0);
        }
        if let Some(v) = matches.value_of("ctx") {
            opt.ctx_count = v.parse().unwrap_or(opt.ctx_count);
        }
        if let Some(v) = matches.value_of("minsize") {
            opt.routine_size_thresh = v.parse().unwrap_or(opt.routine_size_thresh);
        }
        if let Some(v) = matches.value_of("maxdist") {
            opt.routine_distance_thresh = v.parse().unwrap_or(opt.routine_distance_thresh);
        }
        opt
    }
}

const DATA_ALTERNATIVES: usize = 4;

/// Running correspondence of code, data and stack locations between the
/// reference and target executables. The code map is a strict bijection;
/// the data map allows as many alternative targets per offset as the
/// reference has data segments; the stack map is one-to-one and resets at
/// every routine boundary.
#[derive(Clone)]
pub struct OffsetMap {
    max_data: usize,
    code_map: BTreeMap<Address, Address>,
    data_map: BTreeMap<SOffset, SmallVec<[SOffset; DATA_ALTERNATIVES]>>,
    stack_map: BTreeMap<SOffset, SOffset>,
}

impl OffsetMap {
    /// `max_data` is the number of data segments of the reference; with no
    /// data segment recorded there is still at least one (tiny model).
    pub fn new(max_data: usize) -> Self {
        OffsetMap {
            max_data: max_data.max(1),
            code_map: BTreeMap::new(),
            data_map: BTreeMap::new(),
            stack_map: BTreeMap::new(),
        }
    }

    pub fn get_code(&self, from: &Address) -> Option<Address> {
        self.code_map.get(from).copied()
    }

    pub fn set_code(&mut self, from: Address, to: Address) {
        self.code_map.insert(from, to);
    }

    /// Binds or checks a code address pair; once a reference address maps
    /// to a target, any other correspondence for either side is an error.
    pub fn code_match(&mut self, from: Address, to: Address) -> bool {
        if let Some(known) = self.code_map.get(&from) {
            let ok = *known == to;
            if !ok {
                debug!("code offset mismatch: {} -> {} already bound to {}", from, to, known);
            }
            return ok;
        }
        if self.code_map.values().any(|v| *v == to) {
            debug!("code offset mismatch: target {} already bound to another source", to);
            return false;
        }
        debug!("binding code offsets {} -> {}", from, to);
        self.code_map.insert(from, to);
        true
    }

    /// Binds or checks a data offset pair, permitting a bounded number of
    /// alternatives in both directions.
    pub fn data_match(&mut self, from: SOffset, to: SOffset) -> bool {
        if let Some(set) = self.data_map.get(&from) {
            if set.contains(&to) {
                return true;
            }
            if set.len() >= self.max_data {
                debug!("data offset mismatch: {:#x} already has {} targets", from, set.len());
                return false;
            }
        }
        let reverse = self.data_map.values().filter(|set| set.contains(&to)).count();
        if reverse >= self.max_data {
            debug!("data offset mismatch: target {:#x} already has {} sources", to, reverse);
            return false;
        }
        debug!("binding data offsets {:#x} -> {:#x}", from, to);
        self.data_map.entry(from).or_default().push(to);
        true
    }

    /// Binds or checks a stack displacement pair, strictly one-to-one.
    pub fn stack_match(&mut self, from: SOffset, to: SOffset) -> bool {
        if let Some(known) = self.stack_map.get(&from) {
            let ok = *known == to;
            if !ok {
                debug!("stack offset mismatch: {:#x} -> {:#x} already bound to {:#x}", from, to, known);
            }
            return ok;
        }
        if self.stack_map.values().any(|v| *v == to) {
            debug!("stack offset mismatch: target {:#x} already bound", to);
            return false;
        }
        self.stack_map.insert(from, to);
        true
    }

    /// Stack displacements are local to a routine.
    pub fn reset_stack(&mut self) {
        self.stack_map.clear();
    }
}

/// How deep a variant rewrite reached on each side, in instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchDepth {
    pub left: usize,
    pub right: usize,
}

impl MatchDepth {
    pub fn is_match(&self) -> bool {
        self.left != 0 && self.right != 0
    }
}

/// Rulebook of mutually equivalent instruction sequences. Each bucket
/// holds alternatives; an alternative is one or more rendered instructions.
/// The text form has one bucket per line: alternatives separated by
/// semicolons, instructions within an alternative separated by slashes.
pub struct VariantMap {
    buckets: Vec<Vec<Vec<String>>>,
    max_depth: usize,
}

impl VariantMap {
    pub fn new() -> Self {
        VariantMap { buckets: Vec::new(), max_depth: 0 }
    }

    /// The built-in rewrites covering the common compiler idioms.
    pub fn builtin() -> Self {
        let mut vm = VariantMap::new();
        vm.parse_line("add sp, 0x2;pop cx;inc sp/inc sp");
        vm.parse_line("add sp, 0x4;pop cx/pop cx");
        vm.parse_line("sub ax, ax;xor ax, ax");
        vm.parse_line("sub dx, dx;xor dx, dx");
        vm
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut vm = VariantMap::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            vm.parse_line(line);
        }
        Ok(vm)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn parse_line(&mut self, line: &str) {
        let bucket: Vec<Vec<String>> = line
            .split(';')
            .map(|alt| alt.split('/').map(|i| i.trim().to_string()).collect())
            .collect();
        for alt in &bucket {
            self.max_depth = self.max_depth.max(alt.len());
        }
        self.buckets.push(bucket);
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn find(&self, search: &[String], bucket: usize) -> Option<usize> {
        self.buckets[bucket].iter().position(|alt| {
            alt.len() <= search.len() && alt.iter().zip(search).all(|(a, s)| a == s)
        })
    }

    /// Checks whether the head of `left` and the head of `right` are
    /// alternatives of the same bucket; the result tells how many
    /// instructions each side consumed.
    pub fn check_match(&self, left: &[String], right: &[String]) -> MatchDepth {
        for bucket in 0..self.buckets.len() {
            if let (Some(li), Some(ri)) = (self.find(left, bucket), self.find(right, bucket)) {
                return MatchDepth {
                    left: self.buckets[bucket][li].len(),
                    right: self.buckets[bucket][ri].len(),
                };
            }
        }
        MatchDepth::default()
    }
}

impl Default for VariantMap {
    fn default() -> Self {
        VariantMap::builtin()
    }
}

// Outcome of matching one reference/target instruction pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpResult {
    Match,
    DiffVal,
    DiffTgt,
    Variant(usize, usize),
    Mismatch,
}

// Outcome of one routine comparison.
enum RoutineOutcome {
    Matched,
    Mismatched,
    StopReached,
}

#[derive(Debug, Default)]
struct CompareStats {
    compared_size: Offset,
    reachable_size: Offset,
    unreachable_size: Offset,
    excluded_size: Offset,
    excluded_count: usize,
    missed_size: Offset,
    missed_names: BTreeSet<String>,
    routine_names: BTreeSet<String>,
}

/// Drives the static analyses: control-flow exploration producing a code
/// map, lockstep differential comparison, duplicate lookup and data
/// reference suggestions.
pub struct Analyzer {
    options: Options,
    off_map: OffsetMap,
    variants: VariantMap,
    seeds: Vec<(Address, bool, String)>,
    stats: CompareStats,
    target_map: Option<CodeMap>,
}

impl Analyzer {
    pub fn new(options: Options) -> Self {
        Analyzer {
            options,
            off_map: OffsetMap::new(0),
            variants: VariantMap::default(),
            seeds: Vec::new(),
            stats: CompareStats::default(),
            target_map: None,
        }
    }

    pub fn with_variants(options: Options, variants: VariantMap) -> Self {
        let mut a = Analyzer::new(options);
        a.variants = variants;
        a
    }

    /// Map of the target side built during the last comparison.
    pub fn target_map(&self) -> Option<&CodeMap> {
        self.target_map.as_ref()
    }

    /// Registers entrypoints from a linker map to seed the next exploration
    /// with known routine locations and names.
    pub fn seed_queue(&mut self, map: &CodeMap, exe: &mut Executable) {
        for seg in map.segments() {
            exe.store_segment(seg.kind, seg.address);
        }
        for r in map.routines() {
            self.seeds.push((r.entrypoint(), r.near, r.name.clone()));
        }
        info!("seeded scan queue with {} known entrypoints", self.seeds.len());
    }

    /// Explores the executable's control flow from its entrypoint and
    /// returns the resulting code map.
    pub fn explore_code(&mut self, exe: &mut Executable) -> Result<CodeMap> {
        let ep = exe.entrypoint();
        let origin = Address::new(exe.load_segment(), 0);
        let init_regs = RegisterState::with_context(ep, exe.stack());
        let mut sq = if self.seeds.is_empty() {
            ScanQueue::new(origin, exe.size(), Destination::new(ep, 1, true, init_regs), Some("start"))
        } else {
            let mut sq = ScanQueue::empty(origin, exe.size());
            sq.save_call(&ep, &init_regs, true, Some("start"));
            let seeds = std::mem::take(&mut self.seeds);
            for (addr, near, name) in seeds {
                sq.save_call(&addr, &init_regs, near, Some(name.as_str()));
            }
            sq
        };
        let mut vars: BTreeSet<Address> = BTreeSet::new();
        let end_linear = origin.to_linear() + exe.size();

        while let Some(dest) = sq.next_point() {
            let mut csip = dest.address;
            let mut regs = dest.regs;
            regs.set_value(Register::Cs, csip.segment);
            let anchor = csip.to_linear();
            debug!("starting walk at {} for routine {} {}", csip, dest.routine_idx, sq.status_string());
            loop {
                if !exe.contains(&csip) {
                    debug!("{}: walk left code extents", csip);
                    break;
                }
                regs.set_value(Register::Ip, csip.offset);
                let ins = match Instruction::decode(csip, exe.code_at(&csip)?) {
                    Ok(i) => i,
                    Err(e) => {
                        // data mixed into code: abandon and unmark the walk
                        debug!("{}: {}, rolling back current walk", csip, e);
                        sq.clear_routine_idx(anchor);
                        break;
                    }
                };
                if csip.to_linear() + ins.length as Offset > end_linear {
                    debug!("{}: instruction exceeds code extents", csip);
                    break;
                }
                sq.set_routine_idx(csip.to_linear(), ins.length as Offset, None)?;

                if ins.is_branch() {
                    let branch = Self::resolve_branch(&ins, &regs);
                    if let Some(bdest) = branch.destination {
                        if !branch.is_near {
                            // far destinations reveal code segments
                            exe.store_segment(SegmentKind::Code, bdest.segment);
                        }
                    }
                    sq.save_branch(&branch, &regs, exe.extents());
                    if ins.is_unconditional_jump() {
                        break;
                    }
                } else if ins.is_return() {
                    break;
                }

                self.apply_instruction(exe, &ins, &mut regs, &mut vars);
                csip += ins.length as u16;
            }
        }

        let segments = exe.segments().to_vec();
        let vars: Vec<Variable> = vars.into_iter().map(|a| Variable::new("", a)).collect();
        CodeMap::from_queue(&sq, &segments, &vars, exe.load_segment(), exe.size())
    }

    // Classifies a branch instruction and resolves its destination where
    // statically possible; register-indirect branches resolve only when the
    // register value is traceable, otherwise they are silently dropped.
    fn resolve_branch(ins: &Instruction, regs: &RegisterState) -> Branch {
        let is_near =
            !matches!(ins.class, InstructionClass::CallFar | InstructionClass::JmpFar);
        let mut branch = Branch {
            source: ins.addr,
            destination: ins.destination(),
            is_call: ins.is_call(),
            is_conditional: ins.is_conditional_branch(),
            is_near,
        };
        if branch.destination.is_none() && is_near {
            if let Some(reg) = ins.op1.kind.register() {
                if reg.is_word() && regs.is_known(reg) {
                    branch.destination = Some(Address::new(ins.addr.segment, regs.get_value(reg)));
                }
            }
        }
        branch
    }

    // Applies the effect of one instruction to the tracked register state;
    // only straightforward moves retain knowledge, anything else makes the
    // touched registers unknown. Direct memory references through a known
    // segment register are collected as variable candidates.
    fn apply_instruction(
        &mut self,
        exe: &mut Executable,
        ins: &Instruction,
        regs: &mut RegisterState,
        vars: &mut BTreeSet<Address>,
    ) {
        use InstructionClass::*;
        if let Some(mem) = ins.mem_operand() {
            if mem.kind == OperandType::MemOff16 {
                if let Some(seg_reg) = ins.mem_segment() {
                    if regs.is_known(seg_reg) {
                        vars.insert(Address::new(regs.get_value(seg_reg), mem.word_value()));
                    }
                }
            }
        }
        match ins.class {
            Mov => {
                if let Some(dst) = ins.op1.kind.register() {
                    if ins.op2.kind.is_explicit_imm() {
                        regs.set_value(dst, ins.op2.word_value());
                    } else if let Some(src) = ins.op2.kind.register() {
                        if regs.is_known(src) {
                            regs.set_value(dst, regs.get_value(src));
                        } else {
                            regs.set_unknown(dst);
                        }
                    } else {
                        regs.set_unknown(dst);
                    }
                    // a traceable segment register load reveals a data segment
                    if matches!(dst, Register::Ds | Register::Es) && regs.is_known(dst) {
                        exe.store_segment(SegmentKind::Data, regs.get_value(dst));
                    }
                }
            }
            Xchg => {
                for op in [&ins.op1, &ins.op2] {
                    if let Some(r) = op.kind.register() {
                        regs.set_unknown(r);
                    }
                }
            }
            Pop | In => {
                if let Some(r) = ins.op1.kind.register() {
                    regs.set_unknown(r);
                }
            }
            Les => {
                if let Some(r) = ins.op1.kind.register() {
                    regs.set_unknown(r);
                }
                regs.set_unknown(Register::Es);
            }
            Lds => {
                if let Some(r) = ins.op1.kind.register() {
                    regs.set_unknown(r);
                }
                regs.set_unknown(Register::Ds);
            }
            Mul | Imul | Div | Idiv | Aam | Aad | Cbw | Cwd => {
                regs.set_unknown(Register::Ax);
                regs.set_unknown(Register::Dx);
            }
            Lahf => regs.set_unknown(Register::Ah),
            Lodsb => regs.set_unknown(Register::Al),
            Lodsw => regs.set_unknown(Register::Ax),
            Add | Or | Adc | Sbb | And | Sub | Xor | Inc | Dec | Neg | Not | Rol | Ror | Rcl
            | Rcr | Shl | Shr | Sar | Lea => {
                if let Some(r) = ins.op1.kind.register() {
                    regs.set_unknown(r);
                }
            }
            _ => {}
        }
    }

    /// Walks the reference and target executables in parallel, starting at
    /// their entrypoints, and reports whether every routine of the
    /// reference map matches the target under the configured rules.
    pub fn compare_code(
        &mut self,
        ref_exe: &Executable,
        tgt_exe: &Executable,
        ref_map: &CodeMap,
    ) -> Result<bool> {
        self.off_map = OffsetMap::new(ref_map.segment_count(SegmentKind::Data));
        self.stats = CompareStats::default();
        let mut tgt_routines: Vec<Routine> = Vec::new();
        let mut queue: VecDeque<(Address, Address)> = VecDeque::new();
        let mut seen: BTreeSet<Address> = BTreeSet::new();
        queue.push_back((ref_exe.entrypoint(), tgt_exe.entrypoint()));
        self.off_map.set_code(ref_exe.entrypoint(), tgt_exe.entrypoint());

        let mut result = true;
        'routines: while let Some((ref_ep, tgt_ep)) = queue.pop_front() {
            if !seen.insert(ref_ep) {
                continue;
            }
            let routine = match ref_map.routine_at(&ref_ep) {
                Some(r) => r.clone(),
                None => {
                    // no map coverage: synthesize a routine spanning the
                    // remainder of the reference image
                    let mut r = Routine::new(
                        format!("unknown_{:x}", ref_ep.to_linear()),
                        Block::new(ref_ep, ref_exe.extents().end),
                    );
                    if ref_map.is_empty() && ref_ep == ref_exe.entrypoint() {
                        r.name = "start".into();
                    }
                    r
                }
            };
            if routine.is_ignored() || (routine.assembly && !self.options.check_asm) {
                debug!("skipping excluded routine {}", routine.name);
                self.stats.excluded_size += routine.size();
                self.stats.excluded_count += 1;
                continue;
            }
            info!("comparing routine {} at {} against {}", routine.name, ref_ep, tgt_ep);
            self.stats.routine_names.insert(routine.name.clone());
            let (outcome, tgt_end) =
                self.compare_routine(ref_exe, tgt_exe, &routine, ref_ep, tgt_ep, &mut queue)?;
            let mut tgt_routine = Routine::new(routine.name.clone(), Block::new(tgt_ep, tgt_end));
            tgt_routine.reachable.push(tgt_routine.extents);
            tgt_routines.push(tgt_routine);
            match outcome {
                RoutineOutcome::Matched => {
                    self.stats.reachable_size += routine.reachable_size();
                    self.stats.unreachable_size += routine.unreachable_size();
                }
                RoutineOutcome::Mismatched => {
                    result = false;
                    if !self.options.ignore_diff {
                        break 'routines;
                    }
                }
                RoutineOutcome::StopReached => break 'routines,
            }
        }

        self.check_missed_routines(ref_map, &seen);
        self.comparison_summary(result);

        let mut tgt_map = CodeMap::new(tgt_exe.load_segment(), tgt_exe.size());
        tgt_map.set_segments(tgt_exe.segments().to_vec());
        for r in tgt_routines {
            tgt_map.add_routine(r);
        }
        self.target_map = Some(tgt_map);
        Ok(result)
    }

    // Lockstep walk over one routine. Returns the outcome plus the highest
    // target address touched, for the target-side map.
    fn compare_routine(
        &mut self,
        ref_exe: &Executable,
        tgt_exe: &Executable,
        routine: &Routine,
        ref_ep: Address,
        tgt_ep: Address,
        queue: &mut VecDeque<(Address, Address)>,
    ) -> Result<(RoutineOutcome, Address)> {
        let mut ref_csip = ref_ep;
        let mut tgt_csip = tgt_ep;
        let mut tgt_end = tgt_ep;
        self.off_map.reset_stack();
        let routine_last = routine
            .sorted_blocks()
            .last()
            .map(|b| b.end)
            .unwrap_or(routine.extents.end);

        loop {
            if let Some(stop) = self.options.stop_addr {
                if ref_csip >= stop {
                    info!("stop address {} reached at {}", stop, ref_csip);
                    return Ok((RoutineOutcome::StopReached, tgt_end));
                }
            }
            if ref_csip > routine_last || !ref_exe.contains(&ref_csip) {
                debug!("routine {} compared to completion", routine.name);
                return Ok((RoutineOutcome::Matched, tgt_end));
            }
            // step over unreachable gaps between the routine's blocks,
            // re-deriving the target location from the code offset map
            if !routine.reachable.is_empty()
                && !routine.reachable.iter().any(|b| b.contains(&ref_csip))
            {
                let next = routine.next_reachable(&ref_csip);
                if !next.is_valid() {
                    debug!("no further reachable blocks in routine {}", routine.name);
                    return Ok((RoutineOutcome::Matched, tgt_end));
                }
                let delta = next.begin - ref_csip;
                ref_csip = next.begin;
                tgt_csip = match self.off_map.get_code(&ref_csip) {
                    Some(bound) => bound,
                    None => tgt_csip + delta as u16,
                };
                debug!("stepping over unreachable gap to {} / {}", ref_csip, tgt_csip);
                continue;
            }

            let pair = self.match_at(ref_exe, tgt_exe, ref_csip, tgt_csip);
            let (ref_ins, tgt_ins, res) = match pair {
                Ok(v) => v,
                Err(e) => {
                    // undecodable bytes on either side are a mismatch
                    warn!("decode failure during comparison at {} / {}: {}", ref_csip, tgt_csip, e);
                    self.diff_context(ref_exe, tgt_exe, ref_csip, tgt_csip);
                    return Ok((RoutineOutcome::Mismatched, tgt_end));
                }
            };

            let accepted = self.accept(res);
            if !accepted {
                // try to resynchronize by skipping instructions
                if let Some((new_ref, new_tgt)) =
                    self.try_skip(ref_exe, tgt_exe, ref_csip, tgt_csip)?
                {
                    debug!("resynchronized by skip to {} / {}", new_ref, new_tgt);
                    ref_csip = new_ref;
                    tgt_csip = new_tgt;
                    continue;
                }
                println!(
                    "Mismatch in routine {}: {}: {} <> {}: {}",
                    routine.name, ref_ins.addr, ref_ins, tgt_ins.addr, tgt_ins
                );
                self.diff_context(ref_exe, tgt_exe, ref_csip, tgt_csip);
                if self.options.ignore_diff {
                    self.stats.compared_size += ref_ins.length as Offset;
                    ref_csip += ref_ins.length as u16;
                    tgt_csip += tgt_ins.length as u16;
                    tgt_end = tgt_end.max(tgt_csip.displaced(-1));
                    continue;
                }
                return Ok((RoutineOutcome::Mismatched, tgt_end));
            }

            // follow calls into new routine comparisons
            if ref_ins.is_call() && !self.options.no_call {
                if let (Some(rd), Some(td)) = (ref_ins.destination(), tgt_ins.destination()) {
                    if ref_exe.contains(&rd) && tgt_exe.contains(&td) {
                        queue.push_back((rd, td));
                    }
                }
            }

            // advance both sides, possibly through a variant sequence
            let (ref_steps, tgt_steps) = match res {
                CmpResult::Variant(l, r) => (l, r),
                _ => (1, 1),
            };
            let ref_len = Self::sequence_length(ref_exe, ref_csip, ref_steps)?;
            let tgt_len = Self::sequence_length(tgt_exe, tgt_csip, tgt_steps)?;
            self.stats.compared_size += ref_len;
            ref_csip += ref_len as u16;
            tgt_csip += tgt_len as u16;
            tgt_end = tgt_end.max(tgt_csip.displaced(-1));
        }
    }

    // Total byte length of `count` consecutive instructions.
    fn sequence_length(exe: &Executable, mut addr: Address, count: usize) -> Result<Offset> {
        let mut total = 0;
        for _ in 0..count {
            let ins = Instruction::decode(addr, exe.code_at(&addr)?)?;
            total += ins.length as Offset;
            addr += ins.length as u16;
        }
        Ok(total)
    }

    fn match_at(
        &mut self,
        ref_exe: &Executable,
        tgt_exe: &Executable,
        ref_csip: Address,
        tgt_csip: Address,
    ) -> Result<(Instruction, Instruction, CmpResult)> {
        let ref_ins = Instruction::decode(ref_csip, ref_exe.code_at(&ref_csip)?)?;
        let tgt_ins = Instruction::decode(tgt_csip, tgt_exe.code_at(&tgt_csip)?)?;
        debug!("comparing {}: '{}' against {}: '{}'", ref_csip, ref_ins, tgt_csip, tgt_ins);
        let res = self.instructions_match(ref_exe, tgt_exe, &ref_ins, &tgt_ins)?;
        Ok((ref_ins, tgt_ins, res))
    }

    fn accept(&self, res: CmpResult) -> bool {
        match res {
            CmpResult::Match | CmpResult::DiffTgt => true,
            CmpResult::DiffVal => !self.options.strict,
            CmpResult::Variant(_, _) => true,
            CmpResult::Mismatch => false,
        }
    }

    // The matching ladder of the comparator: literal match, variant
    // rewrite, branch with consistently mapped target, then value-level
    // difference, in that order.
    fn instructions_match(
        &mut self,
        ref_exe: &Executable,
        tgt_exe: &Executable,
        ref_ins: &Instruction,
        tgt_ins: &Instruction,
    ) -> Result<CmpResult> {
        let m = ref_ins.matches(tgt_ins);
        match m {
            InstructionMatch::Full => {
                // even a literal branch match must keep the offset maps
                // consistent across executables
                if ref_ins.is_relative_branch() {
                    if let (Some(rd), Some(td)) = (ref_ins.destination(), tgt_ins.destination()) {
                        if !self.off_map.code_match(rd, td) {
                            return Ok(CmpResult::Mismatch);
                        }
                    }
                }
                if !self.record_offsets(ref_ins, tgt_ins) {
                    return Ok(CmpResult::Mismatch);
                }
                Ok(CmpResult::Match)
            }
            InstructionMatch::DiffOp1 | InstructionMatch::DiffOp2 | InstructionMatch::Diff => {
                if ref_ins.is_relative_branch() && tgt_ins.is_relative_branch() {
                    if let (Some(rd), Some(td)) = (ref_ins.destination(), tgt_ins.destination()) {
                        if self.off_map.code_match(rd, td) {
                            return Ok(CmpResult::DiffTgt);
                        }
                    }
                    return Ok(CmpResult::Mismatch);
                }
                if self.record_offsets(ref_ins, tgt_ins) {
                    Ok(CmpResult::DiffVal)
                } else {
                    Ok(CmpResult::Mismatch)
                }
            }
            InstructionMatch::Mismatch => {
                if self.options.variant {
                    let left = Self::render_sequence(ref_exe, ref_ins.addr, self.variants.max_depth());
                    let right = Self::render_sequence(tgt_exe, tgt_ins.addr, self.variants.max_depth());
                    let depth = self.variants.check_match(&left, &right);
                    if depth.is_match() {
                        debug!("variant match, depth {}:{}", depth.left, depth.right);
                        return Ok(CmpResult::Variant(depth.left, depth.right));
                    }
                }
                Ok(CmpResult::Mismatch)
            }
        }
    }

    // Records any data and stack references the pair makes in the offset
    // maps; returns false when the recorded pair contradicts an earlier
    // binding.
    fn record_offsets(&mut self, ref_ins: &Instruction, tgt_ins: &Instruction) -> bool {
        let pairs = [(&ref_ins.op1, &tgt_ins.op1), (&ref_ins.op2, &tgt_ins.op2)];
        for (ro, to) in &pairs {
            if !ro.kind.is_mem() || ro.kind != to.kind {
                continue;
            }
            if ro.kind.is_mem_direct() {
                let (from, to_off) = (ro.word_value() as SOffset, to.word_value() as SOffset);
                if !self.off_map.data_match(from, to_off) {
                    return false;
                }
            } else if let (Some(rd), Some(td)) = (ro.displacement(), to.displacement()) {
                if ro.kind.is_bp_based() {
                    if !self.off_map.stack_match(rd as SOffset, td as SOffset) {
                        return false;
                    }
                } else if !self.off_map.data_match(rd as SOffset, td as SOffset) {
                    return false;
                }
            }
        }
        true
    }

    // Looks for a resynchronization point by advancing the reference side
    // up to ref_skip and the target side up to tgt_skip instructions.
    fn try_skip(
        &mut self,
        ref_exe: &Executable,
        tgt_exe: &Executable,
        ref_csip: Address,
        tgt_csip: Address,
    ) -> Result<Option<(Address, Address)>> {
        if self.options.ref_skip == 0 && self.options.tgt_skip == 0 {
            return Ok(None);
        }
        let ref_addrs = Self::instruction_addresses(ref_exe, ref_csip, self.options.ref_skip);
        let tgt_addrs = Self::instruction_addresses(tgt_exe, tgt_csip, self.options.tgt_skip);
        // probing must not leave stray bindings in the offset maps; the
        // adopted pair re-binds when the main loop matches it for real
        let saved = self.off_map.clone();
        for (i, ra) in ref_addrs.iter().enumerate() {
            for (j, ta) in tgt_addrs.iter().enumerate() {
                if i == 0 && j == 0 {
                    continue;
                }
                let res = match self.match_at(ref_exe, tgt_exe, *ra, *ta) {
                    Ok((_, _, r)) => r,
                    Err(_) => continue,
                };
                self.off_map = saved.clone();
                if self.accept(res) {
                    debug!("skip of {} reference / {} target instructions resynchronizes", i, j);
                    return Ok(Some((*ra, *ta)));
                }
            }
        }
        Ok(None)
    }

    // Start addresses of up to `skip`+1 consecutive instructions.
    fn instruction_addresses(exe: &Executable, start: Address, skip: usize) -> Vec<Address> {
        let mut ret = vec![start];
        let mut addr = start;
        for _ in 0..skip {
            let ins = match exe.code_at(&addr).and_then(|code| Instruction::decode(addr, code)) {
                Ok(i) => i,
                Err(_) => break,
            };
            addr += ins.length as u16;
            if !exe.contains(&addr) {
                break;
            }
            ret.push(addr);
        }
        ret
    }

    // Rendered text of consecutive instructions, for the variant rulebook.
    fn render_sequence(exe: &Executable, start: Address, count: usize) -> Vec<String> {
        let mut ret = Vec::new();
        let mut addr = start;
        for _ in 0..count {
            if !exe.contains(&addr) {
                break;
            }
            let ins = match exe.code_at(&addr).and_then(|code| Instruction::decode(addr, code)) {
                Ok(i) => i,
                Err(_) => break,
            };
            ret.push(ins.to_string());
            addr += ins.length as u16;
        }
        ret
    }

    // Prints surrounding instructions of both sides after a mismatch.
    fn diff_context(&self, ref_exe: &Executable, tgt_exe: &Executable, ref_csip: Address, tgt_csip: Address) {
        if self.options.ctx_count == 0 {
            return;
        }
        println!("--- context: reference");
        let mut addr = ref_csip;
        for _ in 0..self.options.ctx_count {
            if !ref_exe.contains(&addr) {
                break;
            }
            match ref_exe.code_at(&addr).and_then(|code| Instruction::decode(addr, code)) {
                Ok(ins) => {
                    println!("{}: {}", addr, ins);
                    addr += ins.length as u16;
                }
                Err(_) => {
                    println!("{}: (unable to decode)", addr);
                    break;
                }
            }
        }
        println!("--- context: target");
        let mut addr = tgt_csip;
        for _ in 0..self.options.ctx_count {
            if !tgt_exe.contains(&addr) {
                break;
            }
            match tgt_exe.code_at(&addr).and_then(|code| Instruction::decode(addr, code)) {
                Ok(ins) => {
                    println!("{}: {}", addr, ins);
                    addr += ins.length as u16;
                }
                Err(_) => {
                    println!("{}: (unable to decode)", addr);
                    break;
                }
            }
        }
    }

    fn check_missed_routines(&mut self, ref_map: &CodeMap, seen: &BTreeSet<Address>) {
        for r in ref_map.routines() {
            if r.is_ignored() || (r.assembly && !self.options.check_asm) {
                continue;
            }
            if seen.contains(&r.entrypoint()) {
                continue;
            }
            self.stats.missed_size += r.size();
            self.stats.missed_names.insert(r.name.clone());
        }
    }

    fn comparison_summary(&self, result: bool) {
        info!(
            "--- comparison {}: compared {:#x} bytes over {} routines ({:#x} reachable, {:#x} unreachable), excluded {} routines ({:#x} bytes), missed {} routines ({:#x} bytes)",
            if result { "successful" } else { "failed" },
            self.stats.compared_size,
            self.stats.routine_names.len(),
            self.stats.reachable_size,
            self.stats.unreachable_size,
            self.stats.excluded_count,
            self.stats.excluded_size,
            self.stats.missed_names.len(),
            self.stats.missed_size,
        );
        for name in &self.stats.missed_names {
            info!("missed: {}", name);
        }
    }

    /// Marks routines of the target map whose signatures lie within the
    /// configured edit distance of a library entry as duplicates. Returns
    /// whether any duplicate was found.
    pub fn find_duplicates(
        &self,
        sigs: &SignatureLibrary,
        tgt_exe: &Executable,
        tgt_map: &mut CodeMap,
    ) -> Result<bool> {
        let mut found = 0usize;
        let count = tgt_map.routine_count();
        for idx in 0..count {
            let (name, block, skip) = {
                let r = tgt_map.get_routine(idx).unwrap();
                (r.name.clone(), r.main_block(), r.is_ignored())
            };
            if skip || !block.is_valid() {
                continue;
            }
            let tgt_sig = match tgt_exe.signatures(&block) {
                Ok(s) => s,
                Err(e) => {
                    debug!("unable to extract signature for {}: {}", name, e);
                    continue;
                }
            };
            if tgt_sig.len() < self.options.routine_size_thresh {
                debug!("routine {} too small for duplicate search: {} instructions", name, tgt_sig.len());
                continue;
            }
            let threshold =
                ((tgt_sig.len() * self.options.routine_distance_thresh) / 100).max(1) as u32;
            for si in sigs.iter() {
                let distance = edit_distance(&tgt_sig, &si.signature, threshold);
                if distance <= threshold {
                    info!(
                        "routine {} is a duplicate of {} (distance {}, threshold {})",
                        name, si.routine_name, distance, threshold
                    );
                    if let Some(r) = tgt_map.get_routine_mut(&name) {
                        r.duplicate = true;
                    }
                    found += 1;
                    break;
                }
            }
        }
        info!("found {} duplicate routines", found);
        Ok(found > 0)
    }

    /// Scans the instructions of all non-ignored routines for direct memory
    /// offsets and word immediates that point at known variables, and
    /// prints the suggested references. The map is not modified.
    pub fn find_data_refs(&self, exe: &Executable, map: &CodeMap) -> Result<()> {
        let mut suggestions = 0usize;
        for r in map.routines() {
            if r.is_ignored() {
                continue;
            }
            for block in &r.reachable {
                let mut addr = block.begin;
                while block.contains(&addr) {
                    let ins = match exe.code_at(&addr).and_then(|code| Instruction::decode(addr, code)) {
                        Ok(i) => i,
                        Err(_) => break,
                    };
                    for (op, desc) in [(&ins.op1, "op1"), (&ins.op2, "op2")] {
                        let candidate = if op.kind == OperandType::MemOff16 {
                            Some(op.word_value())
                        } else if op.kind == OperandType::Imm16 {
                            Some(op.word_value())
                        } else {
                            None
                        };
                        let value = match candidate {
                            Some(v) => v,
                            None => continue,
                        };
                        for var in map.variables() {
                            let in_data = map
                                .find_segment(var.addr.segment)
                                .map(|s| s.kind == SegmentKind::Data)
                                .unwrap_or(false);
                            if in_data && var.addr.offset == value {
                                println!(
                                    "{} ({}): '{}' {} value {:#x} could reference variable {}",
                                    addr, r.name, ins, desc, value, var
                                );
                                suggestions += 1;
                            }
                        }
                    }
                    addr += ins.length as u16;
                }
            }
        }
        info!("made {} data reference suggestions", suggestions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_map() {
        let mut om = OffsetMap::new(2);
        assert!(om.stack_match(0xc, 0xa));
        assert!(om.stack_match(0xa, 0x2));
        assert!(om.stack_match(0xe, 0x6));
        assert!(om.stack_match(0x2, 0x8));
        assert!(om.stack_match(0x4, 0xc));
        assert!(om.stack_match(0x10, 0x4));
        assert!(om.stack_match(0x6, 0xe));
        // conflicts with the 0x4 -> 0xc binding
        assert!(!om.stack_match(0x3, 0xc));
        om.reset_stack();
        assert!(om.data_match(0x123, 0x456));
        // a second alternative is allowed with two data segments
        assert!(om.data_match(0x123, 0x567));
        // the third is not
        assert!(!om.data_match(0x123, 0x89a));
        // likewise in reverse: second source of 0x567 allowed
        assert!(om.data_match(0x456, 0x567));
        // third source fails
        assert!(!om.data_match(0x789, 0x567));
        assert!(om.code_match(Address::new(0x1000, 0xabc), Address::new(0x1000, 0xcde)));
        assert!(!om.code_match(Address::new(0x1000, 0xabc), Address::new(0x1000, 0xdef)));
        assert!(!om.code_match(Address::new(0x1000, 0x123), Address::new(0x1000, 0xcde)));
    }

    #[test]
    fn test_variant_map() {
        let text = "add sp, 0x2;pop cx;inc sp/inc sp\n\
                    add sp, 0x4;pop cx/pop cx\n\
                    sub ax, ax;xor ax, ax\n";
        let vm = VariantMap::from_reader(text.as_bytes()).unwrap();
        assert_eq!(vm.max_depth(), 2);
        let one = |s: &str| vec![s.to_string()];
        let m = vm.check_match(&one("sub ax, ax"), &one("xor ax, ax"));
        assert!(m.is_match());
        assert_eq!((m.left, m.right), (1, 1));
        let m = vm.check_match(&one("xor ax, ax"), &one("sub ax, ax"));
        assert!(m.is_match());
        let two = vec!["inc sp".to_string(), "inc sp".to_string()];
        let m = vm.check_match(&one("add sp, 0x2"), &two);
        assert!(m.is_match());
        assert_eq!((m.left, m.right), (1, 2));
        let m = vm.check_match(&two, &one("add sp, 0x2"));
        assert_eq!((m.left, m.right), (2, 1));
        assert!(!vm.check_match(&one("foobar"), &two).is_match());
        assert!(!vm.check_match(&two, &one("foobar")).is_match());
    }

    // A tiny program: the entry routine calls a helper and jumps over a
    // one-byte hole into its tail.
    //
    //   0: mov ax, 0x1234
    //   3: call 0x8
    //   6: jmp 0xb
    //   8: inc bx        ; helper
    //   9: ret
    //   a: nop           ; unclaimed
    //   b: dec ax
    //   c: ret
    fn sample_code() -> Vec<u8> {
        vec![
            0xb8, 0x34, 0x12, // mov ax, 0x1234
            0xe8, 0x02, 0x00, // call 0x8
            0xeb, 0x03, // jmp 0xb
            0x43, // inc bx
            0xc3, // ret
            0x90, // nop
            0x48, // dec ax
            0xc3, // ret
        ]
    }

    #[test]
    fn test_explore_code() {
        let mut exe = Executable::with_code(0x1000, &sample_code()).unwrap();
        let mut a = Analyzer::new(Options::default());
        let map = a.explore_code(&mut exe).unwrap();
        assert_eq!(map.routine_count(), 2);

        let start = map.get_routine_by_name("start").unwrap();
        assert_eq!(start.entrypoint(), Address::new(0x1000, 0));
        assert_eq!(start.reachable.len(), 2);
        assert_eq!(
            start.reachable[0],
            Block::new(Address::new(0x1000, 0), Address::new(0x1000, 7))
        );
        assert_eq!(
            start.reachable[1],
            Block::new(Address::new(0x1000, 0xb), Address::new(0x1000, 0xc))
        );

        let helper = map.get_routine_by_name("routine_2").unwrap();
        assert_eq!(helper.entrypoint(), Address::new(0x1000, 8));
        assert_eq!(
            helper.reachable[0],
            Block::new(Address::new(0x1000, 8), Address::new(0x1000, 9))
        );

        // the hole at 0xa is claimed by nobody
        assert_eq!(map.unclaimed().len(), 1);
        assert_eq!(
            map.unclaimed()[0],
            Block::new(Address::new(0x1000, 0xa), Address::new(0x1000, 0xa))
        );

        // everything adds up
        let sum = map.summary(false, false, false).unwrap();
        assert_eq!(sum.unaccounted_size, 0);
    }

    #[test]
    fn test_explore_rollback() {
        // a call into a valid helper, then fallthrough into an invalid
        // encoding: the start walk rolls back, the helper survives
        let code = vec![
            0xe8, 0x04, 0x00, // call 0x7
            0x0f, // invalid
            0x00, 0x00, 0x00, // junk
            0x90, // nop (helper)
            0xc3, // ret
        ];
        let mut exe = Executable::with_code(0x1000, &code).unwrap();
        let mut a = Analyzer::new(Options::default());
        let map = a.explore_code(&mut exe).unwrap();
        assert_eq!(map.routine_count(), 2);
        let helper = map.get_routine_by_name("routine_2").unwrap();
        assert_eq!(
            helper.reachable[0],
            Block::new(Address::new(0x1000, 7), Address::new(0x1000, 8))
        );
        // the rolled back walk left the first bytes unclaimed
        assert!(map
            .unclaimed()
            .iter()
            .any(|b| b.contains(&Address::new(0x1000, 0)) && b.contains(&Address::new(0x1000, 6))));
    }

    #[test]
    fn test_compare_identity() {
        let code = sample_code();
        let mut exe = Executable::with_code(0x1000, &code).unwrap();
        let mut a = Analyzer::new(Options::default());
        let map = a.explore_code(&mut exe).unwrap();

        let ref_exe = Executable::with_code(0x1000, &code).unwrap();
        let tgt_exe = Executable::with_code(0x1000, &code).unwrap();
        let mut cmp = Analyzer::new(Options::default());
        assert!(cmp.compare_code(&ref_exe, &tgt_exe, &map).unwrap());

        // the produced target map corresponds routine-for-routine
        let tgt_map = cmp.target_map().unwrap();
        assert_eq!(tgt_map.routine_count(), map.routine_count());
        for r in map.routines() {
            assert!(tgt_map.get_routine_by_name(&r.name).is_some());
        }
    }

    #[test]
    fn test_compare_skip() {
        let ref_code = vec![
            0x90, // nop
            0x07, // pop es
            0x0e, // push cs
            0x41, // inc cx
        ];
        let tgt_code = vec![
            0x58, // pop ax
            0x9c, // pushf
            0x41, // inc cx
        ];
        let e1 = Executable::with_code(0, &ref_code).unwrap();
        let e2 = Executable::with_code(0, &tgt_code).unwrap();
        let empty = CodeMap::new(0, 0);

        // not enough skip allowance fails
        let mut opt = Options::default();
        opt.ref_skip = 2;
        opt.tgt_skip = 2;
        let mut a1 = Analyzer::new(opt.clone());
        assert!(!a1.compare_code(&e1, &e2, &empty).unwrap());

        // three reference skips reach the common tail
        opt.ref_skip = 3;
        opt.tgt_skip = 2;
        let mut a2 = Analyzer::new(opt.clone());
        assert!(a2.compare_code(&e1, &e2, &empty).unwrap());

        // reference-only skip against a bare inc cx
        let e4 = Executable::with_code(0, &[0x41]).unwrap();
        opt.ref_skip = 3;
        opt.tgt_skip = 0;
        let mut a3 = Analyzer::new(opt.clone());
        assert!(a3.compare_code(&e1, &e4, &empty).unwrap());

        // target-only skip in the other direction
        let e3 = Executable::with_code(0, &[0x41]).unwrap();
        opt.ref_skip = 0;
        opt.tgt_skip = 2;
        let mut a4 = Analyzer::new(opt);
        assert!(a4.compare_code(&e3, &e2, &empty).unwrap());
    }

    fn unreachable_map(name: &str, blocks: (&[(Offset, Offset)], &[(Offset, Offset)]), extents: (Offset, Offset)) -> CodeMap {
        let mut map = CodeMap::new(0, 0);
        let mut r = Routine::new(
            name,
            Block::from_linear(extents.0, extents.1).unwrap(),
        );
        for (b, e) in blocks.0 {
            r.reachable.push(Block::from_linear(*b, *e).unwrap());
        }
        for (b, e) in blocks.1 {
            r.unreachable.push(Block::from_linear(*b, *e).unwrap());
        }
        map.add_routine(r);
        map
    }

    #[test]
    fn test_compare_unreachable_gap() {
        let mut opt = Options::default();
        opt.strict = false;

        // identical code around an undecodable unreachable byte
        let code = vec![0x07, 0x0e, 0x41, 0x60, 0x40, 0x06];
        let e1 = Executable::with_code(0, &code).unwrap();
        let e2 = Executable::with_code(0, &code).unwrap();
        let map = unreachable_map("test1", (&[(0, 2), (4, 5)], &[(3, 3)]), (0, 5));
        let mut a = Analyzer::new(opt.clone());
        assert!(a.compare_code(&e1, &e2, &map).unwrap());

        // differently sized gaps, bridged by the jump target binding
        let ref_code = vec![0x07, 0x0e, 0xeb, 0x01, 0x60, 0x40, 0x06];
        let tgt_code = vec![0x07, 0x0e, 0xeb, 0x03, 0x60, 0x61, 0x62, 0x40, 0x06];
        let e3 = Executable::with_code(0, &ref_code).unwrap();
        let e4 = Executable::with_code(0, &tgt_code).unwrap();
        let map2 = unreachable_map("test2", (&[(0, 3), (5, 6)], &[(4, 4)]), (0, 6));
        let mut a2 = Analyzer::new(opt.clone());
        assert!(a2.compare_code(&e3, &e4, &map2).unwrap());

        // same sized gap but diverging code after it
        let ref_code = vec![0x07, 0x0e, 0x90, 0x60, 0x40, 0x06];
        let tgt_code = vec![0x07, 0x0e, 0x90, 0x60, 0x41, 0x1e];
        let e5 = Executable::with_code(0, &ref_code).unwrap();
        let e6 = Executable::with_code(0, &tgt_code).unwrap();
        let map3 = unreachable_map("test3", (&[(0, 2), (4, 5)], &[(3, 3)]), (0, 5));
        let mut a3 = Analyzer::new(opt);
        assert!(!a3.compare_code(&e5, &e6, &map3).unwrap());
    }

    #[test]
    fn test_compare_loose_values() {
        let mut opt = Options::default();
        opt.strict = false;
        // mov word [bx+0x6], 0 vs mov word [bx+0xc], 0
        let ref_code = vec![0xc7, 0x47, 0x06, 0x00, 0x00];
        let tgt_code = vec![0xc7, 0x47, 0x0c, 0x00, 0x00];
        let e1 = Executable::with_code(0, &ref_code).unwrap();
        let e2 = Executable::with_code(0, &tgt_code).unwrap();
        let empty = CodeMap::new(0, 0);
        let mut a = Analyzer::new(opt.clone());
        assert!(a.compare_code(&e1, &e2, &empty).unwrap());
        // under strict matching the same pair fails
        let mut strict = Analyzer::new(Options::default());
        assert!(!strict.compare_code(&e1, &e2, &empty).unwrap());
    }

    #[test]
    fn test_compare_variant() {
        // sub ax, ax; ret vs xor ax, ax; ret
        let ref_code = vec![0x29, 0xc0, 0xc3];
        let tgt_code = vec![0x31, 0xc0, 0xc3];
        let e1 = Executable::with_code(0, &ref_code).unwrap();
        let e2 = Executable::with_code(0, &tgt_code).unwrap();
        let empty = CodeMap::new(0, 0);
        let mut opt = Options::default();
        opt.variant = true;
        let mut a = Analyzer::new(opt);
        assert!(a.compare_code(&e1, &e2, &empty).unwrap());
        // without the variant option the rewrite is a mismatch
        let mut plain = Analyzer::new(Options::default());
        assert!(!plain.compare_code(&e1, &e2, &empty).unwrap());
    }

    #[test]
    fn test_find_duplicates() {
        // two identical routines and one different
        let code = vec![
            // dup_a at 0: mov ax, 1; inc bx; ret
            0xb8, 0x01, 0x00, 0x43, 0xc3,
            // dup_b at 5: mov ax, 2; inc bx; ret
            0xb8, 0x02, 0x00, 0x43, 0xc3,
            // other at 10: push es; pop es; dec cx; ret
            0x06, 0x07, 0x49, 0xc3,
        ];
        let exe = Executable::with_code(0x100, &code).unwrap();
        let mut map = CodeMap::new(0x100, code.len());
        for (name, begin, end) in [("dup_a", 0u16, 4u16), ("dup_b", 5, 9), ("other", 10, 13)] {
            let b = Block::new(Address::new(0x100, begin), Address::new(0x100, end));
            let mut r = Routine::new(name, b);
            r.reachable.push(b);
            map.add_routine(r);
        }
        let mut opt = Options::default();
        opt.routine_size_thresh = 2;
        opt.routine_distance_thresh = 10;
        let a = Analyzer::new(opt.clone());

        let lib_map = {
            let mut m = CodeMap::new(0x100, code.len());
            let b = Block::new(Address::new(0x100, 0), Address::new(0x100, 4));
            let mut r = Routine::new("dup_a", b);
            r.reachable.push(b);
            m.add_routine(r);
            m
        };
        let lib = SignatureLibrary::from_map(&lib_map, &exe, 2, 0);
        assert_eq!(lib.len(), 1);

        assert!(a.find_duplicates(&lib, &exe, &mut map).unwrap());
        assert!(map.get_routine_by_name("dup_a").unwrap().duplicate);
        assert!(map.get_routine_by_name("dup_b").unwrap().duplicate);
        assert!(!map.get_routine_by_name("other").unwrap().duplicate);
    }
}
