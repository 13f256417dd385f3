//! Linearization analysis: for every sensitive branch, derives the set of `GhostEdges` and
//! `ActivatingEdges` that make the branch's secret-dependent arm unconditional, then folds those
//! edges into [`ActivatingRegion`]s.
//!
//! Two strategies are provided: [`LinearizationMethod::Pcfl`], the `DeferralEdges` sweep of §4.3 --
//! a single linear pass over `CompactOrder` that resolves each block's competing successors by
//! forwarding a "deferral" to whichever successor is reached first -- and
//! [`LinearizationMethod::Sese`], §4.4's region-recursive strategy, which linearizes one branch at
//! a time by recursively pushing each activating edge's target past every exiting block of the
//! region it dominates. Both terminate in the same post-processing step (`build_regions`): ghost
//! edges are spliced into the CFG, activating edges are cut, and each surviving branch successor
//! becomes an [`ActivatingRegion`]'s entry.

use alloc::vec::Vec;

use cranelift_entity::EntityRef;

use crate::{
    Block, CompactOrder, DominatorTree, FxHashSet, LinearizeError, MachineFunction,
    PostDominatorTree, Region, SensitiveBranchFinder, TargetHooks,
};

/// A CFG edge, as a `(from, to)` pair.
pub(crate) type Edge = (Block, Block);

/// Sorts and dedups a list of edges -- the order every edge set in a [`LinearizationResult`] is
/// published in, so that two runs over the same function agree byte-for-byte regardless of the
/// order sensitive branches happened to be visited in.
pub(crate) fn sorted_edges(mut edges: Vec<Edge>) -> Vec<Edge> {
    edges.sort_unstable();
    edges.dedup();
    edges
}

/// Which strategy produced a [`LinearizationResult`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LinearizationMethod {
    /// Predicated Compact Flow Linearization: the `DeferralEdges` sweep over `CompactOrder`.
    Pcfl,
    /// Region-recursive linearization, driven by dominance/post-dominance.
    Sese,
}

/// A single-entry, single-exit [`Region`] created around a sensitive branch's activating
/// successor, tupled with the branch block that produced it: `Branch` is the sensitive-branch
/// block that originally chose between entering and skipping; `Entry` is the first block executed
/// on the "taken" path; `Exit` is the post-dominating merge; `Blocks` is the set of blocks
/// dominated by `Entry` and strictly before `Exit` ([`Region`]'s own fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatingRegion {
    pub branch: Block,
    region: Region,
}

impl ActivatingRegion {
    pub fn entry(&self) -> Block {
        self.region.entry
    }

    pub fn exit(&self) -> Block {
        self.region.exit
    }

    pub fn blocks(&self) -> &FxHashSet<Block> {
        &self.region.blocks
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}

/// The outcome of running a [`LinearizationMethod`] over a [`MachineFunction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearizationResult {
    method: LinearizationMethod,
    sensitive_blocks: Vec<Block>,
    ghost_edges: Vec<Edge>,
    activating_edges: Vec<Edge>,
    regions: Vec<ActivatingRegion>,
}

impl LinearizationResult {
    pub fn method(&self) -> LinearizationMethod {
        self.method
    }

    /// The sensitive-branch blocks this result was computed over, in ascending order.
    pub fn sensitive_blocks(&self) -> &[Block] {
        &self.sensitive_blocks
    }

    /// Edges spliced into the CFG to carry flow past a block whose own successor set does not
    /// reach the deferred target in time -- §4.3/§4.4's `GhostEdges`.
    pub fn ghost_edges(&self) -> &[Edge] {
        &self.ghost_edges
    }

    /// Edges classified as activating, sorted ascending by `(branch, target)`.
    pub fn activating_edges(&self) -> &[Edge] {
        &self.activating_edges
    }

    pub fn is_activating(&self, from: Block, to: Block) -> bool {
        self.activating_edges.binary_search(&(from, to)).is_ok()
    }

    /// The regions produced by this result, sorted ascending by branch block.
    pub fn regions(&self) -> &[ActivatingRegion] {
        &self.regions
    }

    pub fn region_for_branch(&self, branch: Block) -> Option<&ActivatingRegion> {
        self.regions.iter().find(|r| r.branch == branch)
    }

    /// Every region containing `block`, the reverse of the branch-keyed `Block -> region`
    /// direction; derived on demand rather than cached, since this crate's functions are not
    /// expected to carry enough sensitive branches for a linear scan to matter.
    pub fn containing_regions(&self, block: Block) -> Vec<&ActivatingRegion> {
        self.regions.iter().filter(|r| r.blocks().contains(&block)).collect()
    }
}

/// `(CompactOrder position, block index)` -- a strict total order over every block, `CompactOrder`
/// position first and a block's own (unique) index as the tie-break. A block with no `CompactOrder`
/// position (unreachable) sorts last.
fn rank(compact_order: &CompactOrder, block: Block) -> (usize, usize) {
    (compact_order.index_of(block).map(|i| i.as_usize()).unwrap_or(usize::MAX), block.index())
}

/// The `DeferralEdges` sweep of §4.3: a single pass over `func`'s reachable blocks in `CompactOrder`
/// order, resolving each block's forward successors into `GhostEdges`/`ActivatingEdges` by
/// forwarding unresolved deferrals onto whichever successor is visited first.
fn pcfl_sweep(
    func: &MachineFunction,
    compact_order: &CompactOrder,
    sensitive: &SensitiveBranchFinder,
    fname: &str,
) -> Result<(Vec<Edge>, Vec<Edge>), LinearizeError> {
    let mut blocks = func.reachable_blocks();
    blocks.sort_by_key(|&b| rank(compact_order, b));

    let mut ghost_edges: FxHashSet<Edge> = FxHashSet::default();
    let mut activating_edges: FxHashSet<Edge> = FxHashSet::default();
    let mut deferral_edges: FxHashSet<Edge> = FxHashSet::default();

    for &mbb in &blocks {
        let mbb_rank = rank(compact_order, mbb);
        let forward_succs: Vec<Block> =
            func.succs(mbb).iter().copied().filter(|&s| rank(compact_order, s) > mbb_rank).collect();

        let nearest_deferral = |deferral_edges: &FxHashSet<Edge>| {
            deferral_edges
                .iter()
                .filter(|&&(src, _)| src == mbb)
                .map(|&(_, tgt)| tgt)
                .min_by_key(|&t| rank(compact_order, t))
        };

        if sensitive.is_sensitive(mbb) {
            let mut next = forward_succs.iter().copied().min_by_key(|&b| rank(compact_order, b));
            if let (Some(candidate), Some(deferral)) = (next, nearest_deferral(&deferral_edges)) {
                if rank(compact_order, deferral) < rank(compact_order, candidate) {
                    next = Some(deferral);
                    ghost_edges.insert((mbb, deferral));
                }
            }
            let Some(next) = next else {
                // A sensitive branch with no forward successor at all (every successor is a
                // backedge) has nothing left to defer to; this only happens for malformed input
                // this crate's own `TargetHooks` contract rules out for a branch terminator.
                return Err(LinearizeError::NoUnconditionalSuccessor {
                    function: alloc::string::String::from(fname),
                    block: mbb,
                });
            };

            for &succ in &forward_succs {
                if succ != next {
                    activating_edges.insert((mbb, succ));
                    deferral_edges.insert((next, succ));
                }
            }
            let to_move: Vec<Edge> = deferral_edges
                .iter()
                .copied()
                .filter(|&(src, tgt)| src == mbb && tgt != next)
                .collect();
            for (_, tgt) in to_move {
                deferral_edges.insert((next, tgt));
            }
        } else {
            for &succ in &forward_succs {
                let mut next = succ;
                if let Some(deferral) = nearest_deferral(&deferral_edges) {
                    if rank(compact_order, deferral) < rank(compact_order, next) {
                        next = deferral;
                        ghost_edges.insert((mbb, next));
                        activating_edges.insert((mbb, succ));
                    }
                }
                if succ != next {
                    deferral_edges.insert((next, succ));
                }
                let to_move: Vec<Edge> = deferral_edges
                    .iter()
                    .copied()
                    .filter(|&(src, tgt)| src == mbb && tgt != next)
                    .collect();
                for (_, tgt) in to_move {
                    deferral_edges.insert((next, tgt));
                }
            }
        }

        deferral_edges.retain(|&(src, _)| src != mbb);
    }

    if !deferral_edges.is_empty() {
        return Err(LinearizeError::UnresolvableDeferral {
            function: alloc::string::String::from(fname),
            remaining: deferral_edges.len(),
        });
    }

    Ok((ghost_edges.into_iter().collect(), activating_edges.into_iter().collect()))
}

/// §4.4's `chooseUnconditionalSuccessor`: prefers a successor already reached by a ghost edge,
/// then filters out any successor that post-dominates `mbb` (a degenerate arm that reconverges
/// immediately), then the fall-through successor, then the lowest block index.
fn choose_unconditional_sese(
    func: &MachineFunction,
    hooks: &dyn TargetHooks,
    pdomtree: &PostDominatorTree,
    ghost_edges: &FxHashSet<Edge>,
    mbb: Block,
    succs: &[Block],
) -> Option<Block> {
    for &s in succs {
        if ghost_edges.contains(&(mbb, s)) {
            return Some(s);
        }
    }

    let filtered: Vec<Block> = succs
        .iter()
        .copied()
        .filter(|&s| !(pdomtree.post_dominates(s, mbb) && succs.len() > 1))
        .collect();
    if filtered.is_empty() {
        return None;
    }
    if let [only] = filtered.as_slice() {
        return Some(*only);
    }

    if hooks.can_fall_through(func, mbb) {
        if let Some(fallthrough) = hooks.get_fall_through(func, mbb) {
            if filtered.contains(&fallthrough) {
                return Some(fallthrough);
            }
        }
    }

    filtered.into_iter().min_by_key(Block::index)
}

/// §4.4's recursive `linearizeBranch`: pushes `target` past every exiting block of the region
/// rooted at `uncond_succ` (the region `mbb`'s activating edge to `target` skips over), recursing
/// into each exiting block's own region until `target` is reached directly.
fn linearize_branch(
    func: &mut MachineFunction,
    mbb: Block,
    uncond_succ: Block,
    target: Block,
    ghost_edges: &mut FxHashSet<Edge>,
    activating_edges: &mut FxHashSet<Edge>,
    fname: &str,
) -> Result<(), LinearizeError> {
    activating_edges.insert((mbb, target));

    let domtree = DominatorTree::compute(func);
    let pdomtree = PostDominatorTree::compute(func);
    let region = Region::rooted_at(&domtree, &pdomtree, uncond_succ, target);

    for exiting in region.exiting_blocks(func) {
        let succs = func.succs(exiting).to_vec();
        let new_succ = match succs.len() {
            0 => None,
            1 => {
                if !func.has_edge(exiting, target) {
                    ghost_edges.insert((exiting, target));
                    func.add_edge(exiting, target);
                }
                if func.has_edge(mbb, target) {
                    func.remove_edge(mbb, target);
                }
                Some(target)
            }
            _ => {
                // §4.4 only supports simple SESE regions; a region member that itself still
                // branches out of the region has no single successor to redirect.
                return Err(LinearizeError::UnsupportedExitingBlock {
                    function: alloc::string::String::from(fname),
                    block: exiting,
                });
            }
        };

        if let Some(new_succ) = new_succ {
            if new_succ != region.exit {
                linearize_branch(
                    func,
                    exiting,
                    new_succ,
                    region.exit,
                    ghost_edges,
                    activating_edges,
                    fname,
                )?;
            }
        }
    }

    if func.has_edge(mbb, target) {
        func.remove_edge(mbb, target);
    }
    Ok(())
}

/// §4.4's top-level driver: visits every sensitive block in a dominator-tree preorder fixed up
/// front, choosing each one's unconditional successor and recursively linearizing every other
/// successor past it.
fn sese_sweep(
    func: &mut MachineFunction,
    hooks: &dyn TargetHooks,
    sensitive: &SensitiveBranchFinder,
    fname: &str,
) -> Result<(Vec<Edge>, Vec<Edge>), LinearizeError> {
    let mut ghost_edges: FxHashSet<Edge> = FxHashSet::default();
    let mut activating_edges: FxHashSet<Edge> = FxHashSet::default();

    let domtree = DominatorTree::compute(func);
    let to_linearize: Vec<Block> =
        domtree.rpo().iter().copied().filter(|&b| sensitive.is_sensitive(b)).collect();

    for mbb in to_linearize {
        let pdomtree = PostDominatorTree::compute(func);
        let succs: Vec<Block> = func.succs(mbb).to_vec();
        let uncond = choose_unconditional_sese(func, hooks, &pdomtree, &ghost_edges, mbb, &succs)
            .ok_or_else(|| LinearizeError::NoUnconditionalSuccessor {
                function: alloc::string::String::from(fname),
                block: mbb,
            })?;

        for &succ in &succs {
            if succ != uncond {
                linearize_branch(func, mbb, uncond, succ, &mut ghost_edges, &mut activating_edges, fname)?;
            }
        }
    }

    Ok((ghost_edges.into_iter().collect(), activating_edges.into_iter().collect()))
}

/// Shared post-processing (§4.2's `createActivatingRegions`): splices ghost edges in, cuts
/// activating edges, then builds one [`ActivatingRegion`] per activating edge from the branch's
/// surviving (non-activating) successor.
fn build_regions(
    func: &mut MachineFunction,
    ghost_edges: &[Edge],
    activating_edges: &[Edge],
) -> Result<Vec<ActivatingRegion>, LinearizeError> {
    for &(from, to) in ghost_edges {
        if !func.has_edge(from, to) {
            func.add_edge(from, to);
        }
    }
    for &(from, to) in activating_edges {
        if func.has_edge(from, to) {
            func.remove_edge(from, to);
        }
    }

    let domtree = DominatorTree::compute(func);
    let pdomtree = PostDominatorTree::compute(func);

    let mut regions = Vec::with_capacity(activating_edges.len());
    for &(branch, exit) in activating_edges {
        let entry = func
            .succs(branch)
            .iter()
            .copied()
            .find(|&s| !activating_edges.contains(&(branch, s)))
            .expect("an activating edge's branch must retain exactly one non-activating successor");
        let region = Region::with_known_exit(&domtree, entry, exit);

        let needs_sese_check = func.preds(exit).iter().any(|&p| domtree.dominates(entry, p));
        if needs_sese_check && !pdomtree.post_dominates(exit, entry) {
            return Err(LinearizeError::NonStructurableRegion {
                function: alloc::string::String::from(func.name()),
                entry,
                exit,
            });
        }

        regions.push(ActivatingRegion { branch, region });
    }
    regions.sort_by_key(|r| r.branch);
    Ok(regions)
}

/// Runs `method` over every sensitive branch block in `sensitive`, producing the `GhostEdges`/
/// `ActivatingEdges` classification and the [`ActivatingRegion`]s built from it, and (unless
/// `analysis_only`) leaving the resulting edge deltas applied to `func`.
///
/// `domtree`/`pdomtree` are accepted for API stability but are not reused across the sweep: both
/// strategies mutate `func` incrementally (PCFL only in `build_regions`'s post-processing, SESE
/// throughout `linearize_branch`'s recursion) and recompute dominance/post-dominance from scratch
/// whenever a choice depends on it, per §4.3/§4.4's own incremental-recomputation requirement.
pub(crate) fn run(
    func: &mut MachineFunction,
    hooks: &dyn TargetHooks,
    _domtree: &DominatorTree,
    _pdomtree: &PostDominatorTree,
    compact_order: &CompactOrder,
    sensitive: &SensitiveBranchFinder,
    method: LinearizationMethod,
    analysis_only: bool,
) -> Result<LinearizationResult, LinearizeError> {
    let fname = alloc::string::String::from(func.name());
    let sensitive_blocks = sensitive.blocks();

    let (ghost_edges, activating_edges) = match method {
        LinearizationMethod::Pcfl => pcfl_sweep(func, compact_order, sensitive, &fname)?,
        LinearizationMethod::Sese => sese_sweep(func, hooks, sensitive, &fname)?,
    };
    let ghost_edges = sorted_edges(ghost_edges);
    let activating_edges = sorted_edges(activating_edges);

    let regions = build_regions(func, &ghost_edges, &activating_edges)?;

    if analysis_only {
        // `build_regions` applied the edge deltas to compute dominance against the linearized
        // shape; undo them now that the regions are built, per §4.2's `undoCFGChanges`.
        for &(from, to) in &ghost_edges {
            if func.has_edge(from, to) {
                func.remove_edge(from, to);
            }
        }
        for &(from, to) in &activating_edges {
            if !func.has_edge(from, to) {
                func.add_edge(from, to);
            }
        }
    }

    Ok(LinearizationResult { method, sensitive_blocks, ghost_edges, activating_edges, regions })
}
