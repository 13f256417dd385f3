//! ConstraintInsertion: emits the pseudo-instructions that encode mimicry constraints for the
//! register allocator and later codegen passes, per §4.6.
//!
//! Two variants, selected by [`ConstraintStyle`]: `Block` carves out a dedicated constraint block
//! straddling each activating region's surviving edge and anchors `PERSISTENT_DEF`/`EXTEND` pairs
//! there; `LiveRangeOnly` skips the new block and instead extends live ranges directly at each
//! region's exiting blocks. Both share the `GHOST_LOAD` insertion step for persistent stores.
//!
//! **Constraint-block placement.** §4.6's literal text splits the edge `(Branch, Exit)`. This
//! crate's linearization (see `linearize.rs`'s module docs) never leaves a direct `Branch -> Exit`
//! edge in place -- the branch's only surviving edge after classification is `Branch -> Entry`, the
//! region's own entry block -- so the constraint block is placed there instead: on `(Branch,
//! Entry)`. Every execution that reaches `Branch` now passes through the constraint block
//! regardless of which arm the original secret condition would have taken, which is the property
//! the literal placement was after; see `DESIGN.md` for the worked comparison.

use alloc::vec::Vec;

use crate::{
    ActivatingRegion, Block, FxHashMap, Instruction, InstructionKind, MachineFunction, Operand,
    PersistencyResult, PseudoOp, Register, TargetHooks,
};

/// Which shape [`ConstraintInsertion::run`] uses to encode mimicry constraints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConstraintStyle {
    /// Split the branch's surviving edge with a dedicated constraint block.
    Block,
    /// Extend live ranges at each region's exiting blocks; no new block is created.
    LiveRangeOnly,
}

/// What [`ConstraintInsertion::run`] did for a single region.
#[derive(Debug, Clone, Default)]
pub struct RegionConstraint {
    /// Registers made persistent for this region, ascending.
    pub persistent_registers: Vec<Register>,
    /// The constraint block created for this region, if [`ConstraintStyle::Block`] was used and
    /// `analysis_only` was not set.
    pub constraint_block: Option<Block>,
}

/// The bundle of [`RegionConstraint`]s produced by one [`ConstraintInsertion::run`] call, keyed by
/// the owning region's branch block.
#[derive(Debug, Clone, Default)]
pub struct ConstraintResult {
    by_branch: FxHashMap<Block, RegionConstraint>,
}

impl ConstraintResult {
    pub fn region(&self, branch: Block) -> Option<&RegionConstraint> {
        self.by_branch.get(&branch)
    }

    /// Every constraint block this run created, ascending by block index -- the set
    /// [`crate::PseudoCleanup`] considers for collapsing once the pseudos inside them are erased.
    pub fn constraint_blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> =
            self.by_branch.values().filter_map(|rc| rc.constraint_block).collect();
        blocks.sort_unstable();
        blocks.dedup();
        blocks
    }
}

pub struct ConstraintInsertion;

impl ConstraintInsertion {
    /// Runs constraint insertion over every region in `regions`, in ascending `Entry` block-index
    /// order (per §4.6's cross-region propagation note).
    pub fn run(
        func: &mut MachineFunction,
        hooks: &dyn TargetHooks,
        regions: &[ActivatingRegion],
        persistency: &PersistencyResult,
        style: ConstraintStyle,
        analysis_only: bool,
    ) -> ConstraintResult {
        log::trace!(
            target: "linearize::constraints",
            "inserting constraints for {} region(s), style={:?}, analysis_only={analysis_only}",
            regions.len(),
            style,
        );

        let mut ordered: Vec<&ActivatingRegion> = regions.iter().collect();
        ordered.sort_by_key(|r| (r.entry(), r.branch));

        let mut by_branch = FxHashMap::default();
        // Registers already made persistent for a given shared Exit block, accumulated across
        // sibling regions visited so far (the cross-region propagation §4.6 describes).
        let mut exit_persistent: FxHashMap<Block, Vec<Register>> = FxHashMap::default();

        for region in ordered {
            let Some(rp) = persistency.region(region.branch) else {
                by_branch.insert(region.branch, RegionConstraint::default());
                continue;
            };

            let mut own_registers: Vec<Register> = rp
                .persistent_instrs
                .iter()
                .flat_map(|loc| func.instructions(loc.block)[loc.index].defs().collect::<Vec<_>>())
                .collect();
            own_registers.sort_unstable();
            own_registers.dedup();

            let inherited = exit_persistent.entry(region.exit()).or_default();
            for &reg in &own_registers {
                if !inherited.contains(&reg) {
                    inherited.push(reg);
                }
            }
            inherited.sort_unstable();
            let mut persistent_registers = inherited.clone();
            persistent_registers.sort_unstable();
            persistent_registers.dedup();

            let constraint_block = if analysis_only {
                None
            } else {
                match style {
                    ConstraintStyle::Block => Some(create_constraint_block(
                        func,
                        hooks,
                        region,
                        &persistent_registers,
                    )),
                    ConstraintStyle::LiveRangeOnly => {
                        extend_live_ranges_at_exits(func, region, &persistent_registers);
                        None
                    }
                }
            };

            if !analysis_only {
                insert_ghost_loads(func, &rp.persistent_stores);
            }

            log::debug!(
                target: "linearize::constraints",
                "region@{:?}: {} persistent register(s), constraint_block={:?}",
                region.branch,
                persistent_registers.len(),
                constraint_block,
            );

            by_branch.insert(region.branch, RegionConstraint { persistent_registers, constraint_block });
        }

        ConstraintResult { by_branch }
    }
}

/// Splits `(region.branch, region.entry())` with a fresh block carrying `PERSISTENT_DEF`/`EXTEND`
/// pairs for every register in `registers`, then rewrites `region.branch`'s terminator to target
/// the new block. Returns the new block.
fn create_constraint_block(
    func: &mut MachineFunction,
    hooks: &dyn TargetHooks,
    region: &ActivatingRegion,
    registers: &[Register],
) -> Block {
    let mid = func.split_edge(region.branch, region.entry());

    hooks.remove_branch(func, region.branch);
    hooks.insert_branch(func, region.branch, mid, None, &[]);

    for &reg in registers {
        func.push_instruction(mid, Instruction::pseudo(PseudoOp::PersistentDef, [Operand::def(reg)]));
        func.push_instruction(mid, Instruction::pseudo(PseudoOp::Extend, [Operand::use_(reg)]));
    }
    hooks.insert_branch(func, mid, region.entry(), None, &[]);

    mid
}

/// `ConstraintStyle::LiveRangeOnly`: marks `registers` as extended at every exiting block of
/// `region`, without introducing a new block.
fn extend_live_ranges_at_exits(func: &mut MachineFunction, region: &ActivatingRegion, registers: &[Register]) {
    for exiting in region.region().exiting_blocks(func) {
        let terminator_index = func.instructions(exiting).len().saturating_sub(1);
        for &reg in registers {
            func.insert_instruction_before(
                exiting,
                terminator_index,
                Instruction::pseudo(PseudoOp::Extend, [Operand::use_(reg)]),
            );
        }
    }
}

/// Inserts a `GHOST_LOAD` immediately before every persistent store in `locs`, rewriting the
/// store's source operand to the ghost-loaded register; reuses an immediately preceding
/// `GHOST_LOAD` of the same source register instead of inserting a duplicate (§4.6, §8 property 9).
fn insert_ghost_loads(func: &mut MachineFunction, locs: &[crate::InstrLoc]) {
    let mut by_block: FxHashMap<Block, Vec<usize>> = FxHashMap::default();
    for loc in locs {
        by_block.entry(loc.block).or_default().push(loc.index);
    }
    let mut blocks: Vec<Block> = by_block.keys().copied().collect();
    blocks.sort_unstable();

    for block in blocks {
        let mut indices = by_block.remove(&block).unwrap_or_default();
        indices.sort_unstable();
        indices.dedup();
        // Process highest index first so earlier insertions in this block don't shift later
        // indices out from under the next iteration.
        for &index in indices.iter().rev() {
            let Some(src) = func.instructions(block)[index].uses().next() else { continue };

            let reuse_existing = index > 0
                && matches!(
                    func.instructions(block)[index - 1].kind,
                    InstructionKind::Pseudo(PseudoOp::GhostLoad)
                )
                && func.instructions(block)[index - 1].uses().next() == Some(src);

            let dst = if reuse_existing {
                func.instructions(block)[index - 1]
                    .defs()
                    .next()
                    .expect("a GHOST_LOAD always defines a register")
            } else {
                let dst = func.fresh_virtual_register();
                func.insert_instruction_before(
                    block,
                    index,
                    Instruction::pseudo(PseudoOp::GhostLoad, [Operand::def(dst), Operand::use_(src)]),
                );
                dst
            };

            let store_index = if reuse_existing { index } else { index + 1 };
            for op in func.block_mut(block).instructions[store_index].operands.iter_mut() {
                if op.kind.is_use() && op.register == src {
                    op.register = dst;
                }
            }
        }
    }
}
