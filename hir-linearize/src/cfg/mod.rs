//! The machine-level CFG model this crate operates on.
//!
//! Blocks and instructions are arena-allocated inside a single [`MachineFunction`] and referenced
//! by stable, dense indices (`Block`), following the same `cranelift_entity`-backed indexing
//! convention this workspace uses for SSA values in `midenc-hir`. Instructions carry only the
//! information the linearization pipeline itself needs (register def/use classification); the
//! concrete encoding of "real" instructions is opaque to this crate and is interpreted entirely
//! through [`TargetHooks`](crate::TargetHooks).

pub mod dominance;
pub mod function;
pub mod loops;

pub use self::function::MachineFunction;

use alloc::vec::Vec;

use cranelift_entity::entity_impl;
use smallvec::SmallVec;

/// A basic block of a [`MachineFunction`].
///
/// Indices are dense and assigned in creation order; a block's index never changes once the
/// block is created. Removing a block does not renumber its siblings, it merely leaves a hole
/// that is skipped by iteration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// The class of a [`Register`], opaque beyond what `TargetHooks::create_virtual_register` needs
/// to pick an appropriate backing storage class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterClass(pub u16);

/// A register operand, either virtual (introduced by this crate or its caller, pre-allocation)
/// or physical (assigned by a target's register allocator, not expected to appear before
/// [`PseudoCleanup`](crate::PseudoCleanup) runs except for pre-colored operands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    Virtual(u32),
    Physical(u16),
}

/// How an [`Operand`] relates to its owning [`Instruction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Def,
    Use,
    ImplicitDef,
    ImplicitUse,
}

impl OperandKind {
    pub fn is_def(self) -> bool {
        matches!(self, Self::Def | Self::ImplicitDef)
    }

    pub fn is_use(self) -> bool {
        matches!(self, Self::Use | Self::ImplicitUse)
    }
}

/// A single register operand of an [`Instruction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Operand {
    pub register: Register,
    pub kind: OperandKind,
}

impl Operand {
    pub fn def(register: Register) -> Self {
        Self { register, kind: OperandKind::Def }
    }

    pub fn use_(register: Register) -> Self {
        Self { register, kind: OperandKind::Use }
    }
}

/// The pseudo-instructions this crate introduces over the course of the pipeline.
///
/// Every variant is target-independent; a target's final lowering pass is expected to erase
/// every pseudo other than what survives to [`PseudoCleanup`](crate::PseudoCleanup), which erases
/// the rest unconditionally.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PseudoOp {
    /// Marks a register as needing a materialized definition at this point, emitted at the head
    /// of a constraint block (see `ConstraintInsertion`).
    PersistentDef,
    /// Marks the live range of a register as extended through this point.
    Extend,
    /// Forces a register's value to be loaded/materialized, used to suppress the observable
    /// absence of a store on paths where the original store was not taken.
    GhostLoad,
    /// An anchor instruction marking a stable target for ghost/activating edges during analysis.
    BranchTarget,
    /// Marks a branch terminator as secret-dependent; consumed by `PersistencyAnalysis` and
    /// erased by `PseudoCleanup`.
    SecretDepBr,
    /// Marks an instruction's operand(s) as secret-tainted; carries no executable semantics.
    Secret,
}

/// The instruction-level payload of an [`Instruction`] that is not a pseudo-instruction.
///
/// Real instructions are opaque to this crate; `code` is a target-assigned value with no meaning
/// here beyond equality, and all classification (branch/leakage/persistence) is delegated to
/// [`TargetHooks`](crate::TargetHooks).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Opaque {
    pub code: u32,
}

/// What kind of payload an [`Instruction`] carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Opaque(Opaque),
    Pseudo(PseudoOp),
}

/// A single instruction within a [`Block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub operands: SmallVec<[Operand; 4]>,
}

impl Instruction {
    pub fn opaque(code: u32, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            kind: InstructionKind::Opaque(Opaque { code }),
            operands: operands.into_iter().collect(),
        }
    }

    pub fn pseudo(op: PseudoOp, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self { kind: InstructionKind::Pseudo(op), operands: operands.into_iter().collect() }
    }

    pub fn is_pseudo(&self, op: PseudoOp) -> bool {
        matches!(self.kind, InstructionKind::Pseudo(k) if k == op)
    }

    /// Registers defined by this instruction, in operand order.
    pub fn defs(&self) -> impl Iterator<Item = Register> + '_ {
        self.operands.iter().filter(|o| o.kind.is_def()).map(|o| o.register)
    }

    /// Registers used by this instruction, in operand order.
    pub fn uses(&self) -> impl Iterator<Item = Register> + '_ {
        self.operands.iter().filter(|o| o.kind.is_use()).map(|o| o.register)
    }
}

pub(crate) type BlockSmallVec = SmallVec<[Block; 4]>;

pub(crate) fn sorted_blocks(mut blocks: Vec<Block>) -> Vec<Block> {
    blocks.sort_unstable();
    blocks
}
