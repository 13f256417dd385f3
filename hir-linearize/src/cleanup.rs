//! PseudoCleanup: the post-register-allocation erasure of every pseudo-instruction this crate
//! introduced, per §4.7.
//!
//! Grounded in the original's three discrete `MachineFunctionPass`es (`RemoveSecretPseudos`,
//! `RemoveBranchPseudos`, `RemovePersistentDefs`), kept here as three steps of one
//! [`PseudoCleanup::run`] rather than three driver-visible passes, since this crate has no
//! multi-pass `PassManager` of its own (see `SPEC_FULL.md` §4.0's "Ambient Stack").

use crate::{
    Block, ConstraintResult, InstructionKind, MachineFunction, PseudoOp, TargetHooks,
    target::BranchInfo,
};

/// Erases every pseudo-instruction this crate introduced and collapses constraint blocks the
/// register allocator has finished with.
pub struct PseudoCleanup;

impl PseudoCleanup {
    /// Runs all three cleanup steps over `func`. `constraints` is the result of the
    /// [`crate::ConstraintInsertion`] run that produced the constraint blocks this function may
    /// collapse; pass an empty [`ConstraintResult`] if [`crate::ConstraintStyle::LiveRangeOnly`]
    /// was used (no constraint blocks exist to collapse, only `EXTEND`s to erase).
    pub fn run(func: &mut MachineFunction, hooks: &dyn TargetHooks, constraints: &ConstraintResult) {
        log::trace!(target: "linearize::cleanup", "running pseudo cleanup over `{}`", func.name());

        let removed_secret = remove_matching(func, |op| {
            matches!(op, PseudoOp::Secret | PseudoOp::SecretDepBr)
        });
        let removed_branch_target = remove_matching(func, |op| matches!(op, PseudoOp::BranchTarget));
        let removed_persistent = remove_matching(func, |op| {
            matches!(op, PseudoOp::PersistentDef | PseudoOp::Extend | PseudoOp::GhostLoad)
        });

        log::debug!(
            target: "linearize::cleanup",
            "`{}`: erased {removed_secret} secret, {removed_branch_target} branch-target, \
             {removed_persistent} persistent-def/extend/ghost-load pseudo(s)",
            func.name(),
        );

        for block in constraints.constraint_blocks() {
            collapse_if_trivial(func, hooks, block);
        }
    }
}

/// Erases every instruction in `func` whose [`PseudoOp`] satisfies `matches`, returning how many
/// were removed. Blocks are never removed here -- only their instructions -- so block indices
/// remain stable for the caller to use afterward (e.g. to look up a constraint block to collapse).
fn remove_matching(func: &mut MachineFunction, matches: impl Fn(PseudoOp) -> bool) -> usize {
    let mut removed = 0;
    let blocks: alloc::vec::Vec<Block> = func.all_blocks().collect();
    for block in blocks {
        let before = func.block(block).instructions().len();
        func.block_mut(block).instructions.retain(|i| match i.kind {
            InstructionKind::Pseudo(op) => !matches(op),
            InstructionKind::Opaque(_) => true,
        });
        removed += before - func.block(block).instructions().len();
    }
    removed
}

/// Collapses `block` if, after pseudo erasure, it contains at most one instruction and that
/// instruction (if present) is an unconditional branch to its single successor -- §4.7's "now-
/// empty" test. Rewrites every predecessor's terminator to target the successor directly instead.
fn collapse_if_trivial(func: &mut MachineFunction, hooks: &dyn TargetHooks, block: Block) {
    let instrs = func.instructions(block);
    let collapsible = match instrs.len() {
        0 => true,
        1 => hooks.is_unconditional_branch(&instrs[0]),
        _ => false,
    };
    if !collapsible {
        return;
    }

    let succs = func.succs(block).to_vec();
    debug_assert_eq!(succs.len(), 1, "a collapsible constraint block must have one successor");
    let Some(&successor) = succs.first() else { return };

    let preds = func.preds(block).to_vec();
    debug_assert_eq!(preds.len(), 1, "a collapsible constraint block must have one predecessor");

    for pred in preds {
        redirect_terminator(func, hooks, pred, block, successor);
        func.remove_edge(pred, block);
        func.add_edge(pred, successor);
    }
    func.remove_edge(block, successor);

    log::trace!(
        target: "linearize::cleanup",
        "collapsed now-empty constraint {block} into {successor}",
    );
}

/// Rewrites `pred`'s terminator so that every target naming `from` instead names `to`, leaving
/// every other target (and the condition) untouched.
fn redirect_terminator(func: &mut MachineFunction, hooks: &dyn TargetHooks, pred: Block, from: Block, to: Block) {
    let Ok(info) = hooks.analyze_branch(func, pred) else {
        // A predecessor of a block this crate itself created is expected to always have a
        // decodable terminator; if it doesn't, that is this crate's own bug, not bad caller input
        // (see §7's "no panics ... reserved for invariants this crate itself is responsible for").
        debug_assert!(false, "predecessor of a constraint block has an undecodable terminator");
        return;
    };

    let BranchInfo { true_target, false_target, condition } = info;
    let new_true = true_target.map(|t| if t == from { to } else { t });
    let new_false = false_target.map(|t| if t == from { to } else { t });

    hooks.remove_branch(func, pred);
    if let Some(t) = new_true {
        hooks.insert_branch(func, pred, t, new_false, &condition);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        cfg::dominance::{DominatorTree, PostDominatorTree},
        cfg::loops::LoopInfo,
        compact_order::CompactOrder,
        constraints::{ConstraintInsertion, ConstraintStyle},
        linearize::{self, LinearizationMethod},
        persistency::PersistencyAnalysis,
        secrets::{SecretTracker, SensitiveBranchFinder},
        testing,
    };

    #[test]
    fn collapses_empty_constraint_block_and_erases_pseudos() {
        let (mut func, hooks, secret, blocks) = testing::diamond_with_secret_branch();
        let secrets = SecretTracker::analyze(&func, [secret]);
        let sensitive = SensitiveBranchFinder::analyze(&func, &hooks, &secrets);
        sensitive.annotate(&mut func);
        let domtree = DominatorTree::compute(&func);
        let pdomtree = PostDominatorTree::compute(&func);
        let loops = LoopInfo::compute(&func, &domtree);
        let compact_order = CompactOrder::compute(&func, &domtree, &loops);
        let result = linearize::run(
            &mut func,
            &hooks,
            &domtree,
            &pdomtree,
            &compact_order,
            &sensitive,
            LinearizationMethod::Pcfl,
            false,
        )
        .expect("s1 linearizes");
        let persistency = PersistencyAnalysis::analyze(&func, &hooks, result.regions());
        let constraints = ConstraintInsertion::run(
            &mut func,
            &hooks,
            result.regions(),
            &persistency,
            ConstraintStyle::Block,
            false,
        );

        let mid = constraints.region(blocks.a).unwrap().constraint_block.unwrap();
        assert!(func.has_edge(blocks.a, mid));

        PseudoCleanup::run(&mut func, &hooks, &constraints);

        // No persistent-def/extend/secret pseudos remain anywhere in the function.
        for block in [blocks.entry, blocks.a, mid, blocks.b, blocks.c, blocks.d] {
            assert!(
                func.instructions(block).iter().all(|i| !matches!(
                    i.kind,
                    InstructionKind::Pseudo(
                        PseudoOp::PersistentDef
                            | PseudoOp::Extend
                            | PseudoOp::Secret
                            | PseudoOp::SecretDepBr
                    )
                )),
                "block {block:?} still has a pseudo after cleanup",
            );
        }

        // The constraint block had no persistent registers (no leaking operand in this fixture),
        // so after erasure it is empty and collapses: A now branches directly to B.
        assert!(func.has_edge(blocks.a, blocks.b));
        assert!(!func.has_edge(blocks.a, mid));
    }

    #[test]
    fn ghost_loads_survive_cleanup_is_not_required_but_persistent_pseudos_are_erased() {
        let (mut func, hooks, secret, _reg_x, blocks) = testing::diamond_with_persistent_store();
        let secrets = SecretTracker::analyze(&func, [secret]);
        let sensitive = SensitiveBranchFinder::analyze(&func, &hooks, &secrets);
        let domtree = DominatorTree::compute(&func);
        let pdomtree = PostDominatorTree::compute(&func);
        let loops = LoopInfo::compute(&func, &domtree);
        let compact_order = CompactOrder::compute(&func, &domtree, &loops);
        let result = linearize::run(
            &mut func,
            &hooks,
            &domtree,
            &pdomtree,
            &compact_order,
            &sensitive,
            LinearizationMethod::Pcfl,
            false,
        )
        .expect("s1 linearizes");
        let persistency = PersistencyAnalysis::analyze(&func, &hooks, result.regions());
        let constraints = ConstraintInsertion::run(
            &mut func,
            &hooks,
            result.regions(),
            &persistency,
            ConstraintStyle::Block,
            false,
        );

        PseudoCleanup::run(&mut func, &hooks, &constraints);

        // GHOST_LOAD is erased too -- by cleanup's third step, same as PERSISTENT_DEF/EXTEND.
        let ghost_loads = func
            .instructions(blocks.b)
            .iter()
            .filter(|i| i.is_pseudo(PseudoOp::GhostLoad))
            .count();
        assert_eq!(ghost_loads, 0);
    }
}
