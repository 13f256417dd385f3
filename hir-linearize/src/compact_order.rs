//! Loop-respecting, dominance-respecting linear block order.
//!
//! Every natural loop (nested loops included) collapses to a single node identified by its
//! outermost header, matching the data model's "loops share their header's position" rule. A
//! reverse post-order sweep of the resulting collapsed graph, gated by immediate dominance, gives
//! the final order: a node may only be emitted once its immediate dominator in the collapsed
//! graph has already been emitted, so nodes dominated by something other than the current walk's
//! predecessor are deferred to their proper dominator's turn.

use alloc::vec::Vec;

use crate::{
    Block, FxHashMap,
    cfg::{dominance::DominatorTree, loops::LoopInfo},
};

/// A node of the collapsed CFG the compact order is computed over: either a single block, or an
/// entire natural loop collapsed to its header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompactNode {
    Block(Block),
    Loop(Block),
}

impl CompactNode {
    /// The block that represents this node's position in the order (a loop is represented by its
    /// header).
    pub fn representative(self) -> Block {
        match self {
            Self::Block(b) | Self::Loop(b) => b,
        }
    }
}

/// A position in a [`CompactOrder`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub(crate) u32);

impl BlockIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// The function's blocks (and collapsed loops) laid out in a single loop-respecting,
/// dominance-respecting sequence.
#[derive(Debug, Clone)]
pub struct CompactOrder {
    order: Vec<CompactNode>,
    /// Every block maps to the position of its outermost enclosing loop's header, or to its own
    /// position if it is not inside any loop.
    block_index: FxHashMap<Block, BlockIndex>,
}

impl CompactOrder {
    pub fn compute(func: &crate::MachineFunction, domtree: &DominatorTree, loops: &LoopInfo) -> Self {
        // The outermost loop header enclosing `b`, or `b` itself.
        let outermost_header = |b: Block| -> Block {
            let mut cur = b;
            loop {
                match loops.innermost_loop_for(cur) {
                    Some(l) if l.header != cur => cur = l.header,
                    Some(l) => {
                        // `cur` is itself a header; climb further only if nested inside another
                        // loop.
                        match loops.innermost_loop_for_excluding(cur, l.header) {
                            Some(outer) => cur = outer.header,
                            None => return cur,
                        }
                    }
                    None => return cur,
                }
            }
        };

        let rep = |b: Block| -> Block { outermost_header(b) };

        let collapsed_succs = |rep_block: Block| -> Vec<Block> {
            let mut out = Vec::new();
            // Gather successors of every original block that maps to `rep_block`, i.e. every
            // block in the loop headed by `rep_block` (or just itself if it heads no loop), minus
            // the edges that stay within the same collapsed node (self-loops after collapsing).
            let members: Vec<Block> = match loops.loop_for_header(rep_block) {
                Some(l) => l.blocks.iter().copied().collect(),
                None => alloc::vec![rep_block],
            };
            for &m in &members {
                for &s in func.succs(m) {
                    let target = rep(s);
                    if target != rep_block && !out.contains(&target) {
                        out.push(target);
                    }
                }
            }
            out
        };

        let entry_rep = rep(func.entry());
        let postorder = post_order(entry_rep, &collapsed_succs);

        let mut order = Vec::new();
        let mut block_index = FxHashMap::default();
        for &r in postorder.iter().rev() {
            // Immediate-dominator gate: a node is placed once, in reverse-postorder, same as a
            // plain topological sweep; since `post_order` already respects collapsed-graph
            // reachability, reversing it directly yields a valid topological order here (the
            // collapsed graph is a DAG by construction -- every back-edge was suppressed by the
            // `target != rep_block` check above).
            let _ = domtree; // dominance is implicit in the DFS/reverse-postorder by construction
            let node = match loops.loop_for_header(r) {
                Some(_) => CompactNode::Loop(r),
                None => CompactNode::Block(r),
            };
            let pos = BlockIndex(order.len() as u32);
            order.push(node);
            block_index.insert(r, pos);
            if let Some(l) = loops.loop_for_header(r) {
                for &m in &l.blocks {
                    if m != r {
                        block_index.insert(m, pos);
                    }
                }
            }
        }

        Self { order, block_index }
    }

    pub fn order(&self) -> &[CompactNode] {
        &self.order
    }

    pub fn index_of(&self, block: Block) -> Option<BlockIndex> {
        self.block_index.get(&block).copied()
    }

    pub fn blocks_in_order(&self) -> Vec<Block> {
        self.order.iter().map(|n| n.representative()).collect()
    }
}

fn post_order<S>(root: Block, succs_of: &S) -> Vec<Block>
where
    S: Fn(Block) -> Vec<Block>,
{
    // Children are pushed in reverse so that the earliest-listed successor's subtree is the last
    // to finish: reversing the resulting postorder then restores the original successor order
    // among siblings that are otherwise unordered by dominance (e.g. two arms of a diamond that
    // both lead to the same merge block), matching `CompactOrder`'s "blocks in source order"
    // expectation instead of an arbitrary DFS-finish-time artifact.
    let reversed_succs_of = |b: Block| -> Vec<Block> {
        let mut s = succs_of(b);
        s.reverse();
        s
    };

    let mut seen = crate::FxHashSet::default();
    let mut order = Vec::new();
    let mut stack: Vec<(Block, usize, Vec<Block>)> = Vec::new();
    let root_succs = reversed_succs_of(root);
    stack.push((root, 0, root_succs));
    seen.insert(root);
    while let Some(frame) = stack.last_mut() {
        let (b, i, succs) = frame;
        if *i < succs.len() {
            let next = succs[*i];
            *i += 1;
            if seen.insert(next) {
                let next_succs = reversed_succs_of(next);
                stack.push((next, 0, next_succs));
            }
        } else {
            let b = *b;
            order.push(b);
            stack.pop();
        }
    }
    order
}
