//! The structural (single-entry, single-exit) region queries the SESE strategy and the shared
//! linearization post-processing step both need.
//!
//! This crate has no standalone region-tree analysis of its own to consume (the upstream system
//! this is modeled on treats `RegionInfo` as an external collaborator, built by a separate
//! control-flow structurizer). Rather than require every caller to hand one in, a [`Region`] is
//! computed on demand from the dominator/post-dominator trees this crate already maintains,
//! which is sufficient for the If/IfElse region shapes a binary conditional branch produces (see
//! the SESE strategy's supplemental region-derivation note).

use crate::{
    Block, FxHashSet,
    cfg::dominance::{DominatorTree, PostDominatorTree},
};

/// A single-entry, single-exit region: `entry` dominates every block in `blocks`, and `exit` is
/// the nearest point at which control flow having entered through `entry` is guaranteed to
/// reconverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub entry: Block,
    pub exit: Block,
    pub blocks: FxHashSet<Block>,
}

impl Region {
    /// Computes the region rooted at `entry`, given `sibling` -- the other arm of the branch that
    /// created `entry` as a successor. `exit` is their nearest common post-dominator; `blocks` is
    /// exactly the set described in the data model: blocks `entry` dominates that `exit` does
    /// not, plus `entry` itself.
    pub fn rooted_at(
        domtree: &DominatorTree,
        pdomtree: &PostDominatorTree,
        entry: Block,
        sibling: Block,
    ) -> Self {
        let exit = pdomtree.nearest_common_post_dominator(entry, sibling);
        let blocks = domtree
            .subtree(entry)
            .into_iter()
            .filter(|&b| !domtree.dominates(exit, b))
            .collect();
        Self { entry, exit, blocks }
    }

    /// Computes a region with an already-known `exit` (e.g. the target of an activating edge,
    /// per the linearization post-processing step), rather than deriving it from a sibling arm.
    /// `blocks` follows the same formula as [`Self::rooted_at`]: forward-dominated by `entry`,
    /// not forward-dominated by `exit`.
    pub fn with_known_exit(domtree: &DominatorTree, entry: Block, exit: Block) -> Self {
        let blocks = domtree
            .subtree(entry)
            .into_iter()
            .filter(|&b| !domtree.dominates(exit, b))
            .collect();
        Self { entry, exit, blocks }
    }

    /// The exiting blocks of this region: members with at least one successor outside the region.
    pub fn exiting_blocks(&self, func: &crate::MachineFunction) -> alloc::vec::Vec<Block> {
        let mut out: alloc::vec::Vec<Block> = self
            .blocks
            .iter()
            .copied()
            .filter(|&b| func.succs(b).iter().any(|s| !self.blocks.contains(s)))
            .collect();
        out.sort_unstable();
        out
    }
}
