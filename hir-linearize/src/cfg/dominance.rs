//! Dominator and post-dominator trees over a [`MachineFunction`]'s CFG.
//!
//! Built with the iterative, worklist-free algorithm of Cooper, Harvey & Kennedy ("A Simple, Fast
//! Dominance Algorithm"), which converges in a handful of reverse-postorder passes and avoids the
//! bookkeeping of Lengauer-Tarjan for the block counts this crate expects to see. Dominance and
//! post-dominance share the same fixpoint loop, parameterized only by which edge direction
//! ("predecessors" vs "successors") and which synthetic root ("entry" vs a synthetic "exit" over
//! all blocks with no successors) it runs over -- mirroring how this workspace's own
//! `DominanceInfoBase<const IS_POST_DOM: bool>` shares one implementation between the two queries
//! rather than duplicating the fixpoint loop.

use alloc::vec::Vec;

use cranelift_entity::{EntityRef, SecondaryMap};

use super::{Block, MachineFunction};

#[derive(Debug, Clone)]
struct DomTreeData {
    /// Reverse postorder position of each block that participates in the tree; `None` for
    /// unreachable blocks, which have no dominance relationship to anything.
    rpo_number: SecondaryMap<Block, Option<u32>>,
    rpo: Vec<Block>,
    idom: SecondaryMap<Block, Option<Block>>,
}

fn intersect(idom: &SecondaryMap<Block, Option<Block>>, rpo_number: &SecondaryMap<Block, Option<u32>>, mut a: Block, mut b: Block) -> Block {
    loop {
        let na = rpo_number[a].expect("block must be reachable");
        let nb = rpo_number[b].expect("block must be reachable");
        match na.cmp(&nb) {
            core::cmp::Ordering::Greater => {
                a = idom[a].expect("non-root block must have an idom by this point");
            }
            core::cmp::Ordering::Less => {
                b = idom[b].expect("non-root block must have an idom by this point");
            }
            core::cmp::Ordering::Equal => return a,
        }
    }
}

fn build<P>(root: Block, postorder: &[Block], preds_of: P) -> DomTreeData
where
    P: Fn(Block) -> Vec<Block>,
{
    let mut rpo: Vec<Block> = postorder.iter().rev().copied().collect();
    // root must lead; if it appears later (shouldn't, given a DFS from root), rotate it to front.
    if let Some(pos) = rpo.iter().position(|&b| b == root) {
        rpo.remove(pos);
        rpo.insert(0, root);
    }

    let mut rpo_number: SecondaryMap<Block, Option<u32>> = SecondaryMap::new();
    for (i, &b) in rpo.iter().enumerate() {
        rpo_number[b] = Some(i as u32);
    }

    let mut idom: SecondaryMap<Block, Option<Block>> = SecondaryMap::new();
    idom[root] = Some(root);

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let preds = preds_of(b);
            let mut new_idom: Option<Block> = None;
            for p in preds {
                if rpo_number[p].is_none() {
                    continue; // predecessor unreachable from root in this direction
                }
                if idom[p].is_none() {
                    continue; // not yet processed this round
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, &rpo_number, cur, p),
                });
            }
            if idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }
    idom[root] = None; // the root has no strict dominator

    DomTreeData { rpo_number, rpo, idom }
}

/// The dominator tree of a [`MachineFunction`], rooted at its entry block.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    data: DomTreeData,
}

impl DominatorTree {
    pub fn compute(func: &MachineFunction) -> Self {
        let postorder = post_order(func.entry(), |b| func.succs(b).to_vec());
        let data = build(func.entry(), &postorder, |b| func.preds(b).to_vec());
        Self { data }
    }

    /// The immediate dominator of `block`, or `None` if `block` is the entry or unreachable.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.data.idom[block]
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.data.rpo_number[block].is_some()
    }

    /// Returns true iff `a` dominates `b` (reflexively: a block dominates itself).
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        if !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        while let Some(idom) = self.idom(cur) {
            if idom == a {
                return true;
            }
            cur = idom;
        }
        false
    }

    /// Returns true iff `a` strictly dominates `b`.
    pub fn strictly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Reverse-postorder over the reachable blocks, with the root first.
    pub fn rpo(&self) -> &[Block] {
        &self.data.rpo
    }

    /// All blocks in the dominator subtree rooted at `root` (including `root` itself).
    pub fn subtree(&self, root: Block) -> Vec<Block> {
        self.data.rpo.iter().copied().filter(|&b| self.dominates(root, b)).collect()
    }
}

/// The post-dominator tree of a [`MachineFunction`], rooted at a synthetic exit node that is
/// implicitly predecessor to every block with no successors (every return/unreachable-terminator
/// block).
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    data: DomTreeData,
    virtual_exit: Block,
}

impl PostDominatorTree {
    pub fn compute(func: &MachineFunction) -> Self {
        // The virtual exit is modeled with the next unused block index; it never appears in the
        // function's own block arena, and is only ever consulted through this tree's API.
        let virtual_exit = Block::new(func_block_count(func));
        let exits: Vec<Block> =
            func.reachable_blocks().into_iter().filter(|&b| func.succs(b).is_empty()).collect();

        let succs_of = |b: Block| -> Vec<Block> {
            if b == virtual_exit {
                Vec::new()
            } else if func.succs(b).is_empty() {
                alloc::vec![virtual_exit]
            } else {
                func.succs(b).to_vec()
            }
        };
        let preds_of = |b: Block| -> Vec<Block> {
            if b == virtual_exit {
                exits.clone()
            } else {
                func.preds(b).to_vec()
            }
        };

        let postorder = post_order(virtual_exit, preds_of);
        let data = build(virtual_exit, &postorder, succs_of);
        Self { data, virtual_exit }
    }

    pub fn virtual_exit(&self) -> Block {
        self.virtual_exit
    }

    pub fn post_dominates(&self, a: Block, b: Block) -> bool {
        if a == b {
            return true;
        }
        if self.data.rpo_number[b].is_none() {
            return false;
        }
        let mut cur = b;
        while let Some(idom) = self.data.idom[cur] {
            if idom == a {
                return true;
            }
            cur = idom;
        }
        false
    }

    pub fn strictly_post_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.post_dominates(a, b)
    }

    /// The nearest common post-dominator of `a` and `b`.
    pub fn nearest_common_post_dominator(&self, a: Block, b: Block) -> Block {
        if self.data.rpo_number[a].is_none() {
            return b;
        }
        if self.data.rpo_number[b].is_none() {
            return a;
        }
        intersect(&self.data.idom, &self.data.rpo_number, a, b)
    }
}

fn func_block_count(func: &MachineFunction) -> usize {
    func.reachable_blocks().iter().map(|b| b.index()).max().map(|m| m + 1).unwrap_or(0) + 1
}

fn post_order<S>(root: Block, succs_of: S) -> Vec<Block>
where
    S: Fn(Block) -> Vec<Block>,
{
    let mut seen = crate::FxHashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<(Block, usize)> = alloc::vec![(root, 0)];
    seen.insert(root);
    while let Some((b, i)) = stack.pop() {
        let succs = succs_of(b);
        if i < succs.len() {
            stack.push((b, i + 1));
            let next = succs[i];
            if seen.insert(next) {
                stack.push((next, 0));
            }
        } else {
            order.push(b);
        }
    }
    order
}
