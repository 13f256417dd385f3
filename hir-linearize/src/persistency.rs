//! PersistencyAnalysis: for each activating region, finds the instructions whose defined values
//! must survive the entire linearized traversal of the region because they feed an operand whose
//! value or access timing is observable outside it.
//!
//! Grounded in the same backward-slicing shape `hir-analysis`'s liveness solver uses for its
//! def-use walk, but bounded to a single region's blocks rather than a whole function: a value
//! that would otherwise die inside the region must instead live until the region's exit, so that
//! a later register allocator cannot reuse its storage in a way that differs across the two
//! original branch outcomes.

use alloc::vec::Vec;

use crate::{
    ActivatingRegion, Block, FxHashMap, FxHashSet, Instruction, MachineFunction, Register,
    TargetHooks,
};

/// The location of an instruction within a function: its block and position within that block's
/// instruction list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrLoc {
    pub block: Block,
    pub index: usize,
}

/// Per-region persistency result: §4.5's `persistent_instrs[R]`, `persistent_stores[R]`, and
/// `region_inputs[R]`.
#[derive(Debug, Clone, Default)]
pub struct RegionPersistency {
    /// Instructions inside the region whose defined registers must survive to the region's exit.
    pub persistent_instrs: FxHashSet<InstrLoc>,
    /// Persistent-store instructions inside the region (`TargetHooks::is_persistent_store`).
    pub persistent_stores: Vec<InstrLoc>,
    /// Registers a reaching-def search walked off the top of the region without resolving --
    /// live-in to the region, and therefore an input for any outer region's own analysis.
    pub region_inputs: FxHashSet<Register>,
}

/// The bundle of [`RegionPersistency`] results produced by [`PersistencyAnalysis::analyze`], keyed
/// by the [`ActivatingRegion::branch`] that owns each region.
#[derive(Debug, Clone, Default)]
pub struct PersistencyResult {
    by_branch: FxHashMap<Block, RegionPersistency>,
}

impl PersistencyResult {
    pub fn region(&self, branch: Block) -> Option<&RegionPersistency> {
        self.by_branch.get(&branch)
    }
}

/// The registers a persistent instruction defines, keyed by its defining instruction's location,
/// for a given region -- §4.5's backward worklist over def-use chains.
pub struct PersistencyAnalysis;

impl PersistencyAnalysis {
    /// Runs the backward def-use walk described in §4.5 over every region in `regions`, processed
    /// deepest-first (by descendant count ascending, so a leaf region with no regions nested
    /// inside it runs before any region that contains it).
    pub fn analyze(
        func: &MachineFunction,
        hooks: &dyn TargetHooks,
        regions: &[ActivatingRegion],
    ) -> PersistencyResult {
        log::trace!(target: "linearize::persistency", "analyzing {} region(s)", regions.len());

        let mut ordered: Vec<&ActivatingRegion> = regions.iter().collect();
        ordered.sort_by_key(|r| (region_depth(r, regions), r.branch));

        let mut by_branch = FxHashMap::default();
        for region in ordered {
            let result = analyze_region(func, hooks, region);
            log::debug!(
                target: "linearize::persistency",
                "region@{:?}: {} persistent instr(s), {} persistent store(s), {} input(s)",
                region.branch,
                result.persistent_instrs.len(),
                result.persistent_stores.len(),
                result.region_inputs.len(),
            );
            by_branch.insert(region.branch, result);
        }

        PersistencyResult { by_branch }
    }
}

/// A region's nesting depth, counted from the bottom: the number of *other* regions entirely
/// contained within this one. A region nesting nothing has depth 0; processing ascending by this
/// value visits innermost regions first, matching §4.5's "deepest-first" requirement.
fn region_depth(region: &ActivatingRegion, all: &[ActivatingRegion]) -> usize {
    all.iter()
        .filter(|other| other.branch != region.branch && region.blocks().contains(&other.entry()))
        .count()
}

fn analyze_region(
    func: &MachineFunction,
    hooks: &dyn TargetHooks,
    region: &ActivatingRegion,
) -> RegionPersistency {
    let mut result = RegionPersistency::default();

    let mut sorted_blocks: Vec<Block> = region.blocks().iter().copied().collect();
    sorted_blocks.sort_unstable();

    // Step 1/2: collect leaking operands and persistent stores, seeding the backward worklist.
    let mut worklist: Vec<(Register, InstrLoc)> = Vec::new();
    for &block in &sorted_blocks {
        for (index, instr) in func.instructions(block).iter().enumerate() {
            let loc = InstrLoc { block, index };
            for &pos in &hooks.constant_time_leakage(instr) {
                if let Some(op) = instr.operands.get(pos) {
                    if op.kind.is_use() {
                        worklist.push((op.register, loc));
                    }
                }
            }
            if hooks.is_persistent_store(instr) {
                result.persistent_stores.push(loc);
                for reg in instr.uses() {
                    worklist.push((reg, loc));
                }
            }
        }
    }
    result.persistent_stores.sort_unstable();

    // Step 3: backward worklist over def-use chains, bounded by the region's blocks.
    let mut visited: FxHashSet<(Register, InstrLoc)> = FxHashSet::default();
    while let Some((reg, from)) = worklist.pop() {
        if !visited.insert((reg, from)) {
            continue;
        }
        for def_loc in reaching_defs(func, region, reg, from, &mut result.region_inputs) {
            if result.persistent_instrs.insert(def_loc) {
                let def_instr: &Instruction = &func.instructions(def_loc.block)[def_loc.index];
                for reg in def_instr.uses() {
                    worklist.push((reg, def_loc));
                }
            }
        }
    }

    result
}

/// Walks backward from `from` (exclusive) through `region`'s blocks looking for instructions that
/// define `reg`. Every block reachable backward from `from` without crossing the region's entry is
/// explored at most once; a path that reaches the entry with no intervening def marks `reg` as a
/// region input instead.
fn reaching_defs(
    func: &MachineFunction,
    region: &ActivatingRegion,
    reg: Register,
    from: InstrLoc,
    region_inputs: &mut FxHashSet<Register>,
) -> Vec<InstrLoc> {
    let mut found = Vec::new();
    let mut stack: Vec<(Block, usize)> = alloc::vec![(from.block, from.index)];
    let mut visited_blocks: FxHashSet<Block> = FxHashSet::default();

    while let Some((block, before_index)) = stack.pop() {
        let instrs = func.instructions(block);
        let mut hit = false;
        for i in (0..before_index).rev() {
            if instrs[i].defs().any(|d| d == reg) {
                found.push(InstrLoc { block, index: i });
                hit = true;
                break;
            }
        }
        if hit {
            continue;
        }
        if !visited_blocks.insert(block) {
            continue;
        }
        if block == region.entry() {
            region_inputs.insert(reg);
            continue;
        }
        let mut any_pred_in_region = false;
        for &pred in func.preds(block) {
            if region.blocks().contains(&pred) {
                any_pred_in_region = true;
                stack.push((pred, func.instructions(pred).len()));
            }
        }
        if !any_pred_in_region {
            // Fell off the region without reaching its recorded entry (can only happen for a
            // region whose entry is unreachable from `block` within the region's own block set,
            // i.e. a malformed region) -- treat conservatively as an input rather than silently
            // dropping the register.
            region_inputs.insert(reg);
        }
    }

    found.sort_unstable();
    found.dedup();
    found
}
