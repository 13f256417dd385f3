use alloc::{string::String, vec::Vec};

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use super::{Block, BlockSmallVec, Instruction};

/// The per-block data owned by a [`MachineFunction`].
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) preds: BlockSmallVec,
    pub(crate) succs: BlockSmallVec,
}

impl BlockData {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn preds(&self) -> &[Block] {
        &self.preds
    }

    pub fn succs(&self) -> &[Block] {
        &self.succs
    }
}

/// A single machine-level function: an arena of [`Block`]s plus their CFG edges.
///
/// This is the unit of work the whole pipeline (`Pipeline::run`) operates on. Blocks are never
/// physically removed from the arena (their index would otherwise become reusable and violate the
/// "stable index" invariant); instead an unreachable/dead block is simply left with no
/// predecessors and excluded by any traversal rooted at `entry`.
#[derive(Debug, Clone)]
pub struct MachineFunction {
    pub(crate) name: String,
    pub(crate) entry: Block,
    pub(crate) blocks: PrimaryMap<Block, BlockData>,
    pub(crate) next_vreg: u32,
}

impl MachineFunction {
    /// Creates a new function with a single entry block.
    pub fn new(name: impl Into<String>) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData::default());
        Self { name: name.into(), entry, blocks, next_vreg: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    /// Appends a new, initially unreachable block to the function and returns its index.
    pub fn create_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    pub fn block_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }

    pub fn instructions(&self, block: Block) -> &[Instruction] {
        &self.blocks[block].instructions
    }

    pub fn push_instruction(&mut self, block: Block, instr: Instruction) {
        self.blocks[block].instructions.push(instr);
    }

    /// Inserts `instr` at the front of `block`'s instruction list.
    pub fn prepend_instruction(&mut self, block: Block, instr: Instruction) {
        self.blocks[block].instructions.insert(0, instr);
    }

    /// Inserts `instr` immediately before the instruction at `index`.
    pub fn insert_instruction_before(&mut self, block: Block, index: usize, instr: Instruction) {
        self.blocks[block].instructions.insert(index, instr);
    }

    pub fn preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    pub fn succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    /// Adds a CFG edge `from -> to`, if it does not already exist.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
        }
        if !self.blocks[to].preds.contains(&from) {
            self.blocks[to].preds.push(from);
        }
    }

    /// Removes the CFG edge `from -> to`, if present.
    pub fn remove_edge(&mut self, from: Block, to: Block) {
        self.blocks[from].succs.retain(|&b| b != to);
        self.blocks[to].preds.retain(|&b| b != from);
    }

    pub fn has_edge(&self, from: Block, to: Block) -> bool {
        self.blocks[from].succs.contains(&to)
    }

    /// Allocates a fresh virtual register, independent of any [`crate::TargetHooks`] register
    /// class -- used internally where this crate needs a scratch register (e.g. ghost loads) and
    /// the caller's `create_virtual_register` is threaded through instead whenever a target-class
    /// distinction matters.
    pub fn fresh_virtual_register(&mut self) -> super::Register {
        let id = self.next_vreg;
        self.next_vreg += 1;
        super::Register::Virtual(id)
    }

    /// Every block index ever allocated in this function, reachable or not, in creation order.
    /// Blocks are append-only (see this type's docs), so this is exactly the arena's key set --
    /// used by [`crate::PseudoCleanup`], which must erase pseudo-instructions from a block even
    /// after an earlier stage made it unreachable.
    pub fn all_blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.keys()
    }

    /// All blocks reachable from `entry` via a depth-first pre-order walk.
    pub fn reachable_blocks(&self) -> Vec<Block> {
        let mut seen = crate::FxHashSet::default();
        let mut order = Vec::new();
        let mut stack = SmallVec::<[Block; 16]>::new();
        stack.push(self.entry);
        seen.insert(self.entry);
        while let Some(b) = stack.pop() {
            order.push(b);
            for &s in self.succs(b).iter().rev() {
                if seen.insert(s) {
                    stack.push(s);
                }
            }
        }
        order
    }

    /// Splits the edge `from -> to` by inserting a fresh block `mid` such that
    /// `from -> mid -> to` replaces it. Returns `mid`. Any instructions are left in `from`/`to`
    /// untouched; the caller is responsible for rewriting `from`'s terminator (via
    /// [`crate::TargetHooks::insert_branch`]) to target `mid` instead of `to`.
    pub fn split_edge(&mut self, from: Block, to: Block) -> Block {
        let mid = self.create_block();
        self.remove_edge(from, to);
        self.add_edge(from, mid);
        self.add_edge(mid, to);
        mid
    }
}
