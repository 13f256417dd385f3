#![no_std]
#![deny(warnings)]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod cfg;
mod cleanup;
mod compact_order;
mod constraints;
mod errors;
mod linearize;
mod persistency;
mod pipeline;
mod region;
mod secrets;
mod target;
#[cfg(test)]
mod testing;

pub use self::{
    cfg::{
        Block, Instruction, InstructionKind, MachineFunction, Operand, OperandKind, PseudoOp,
        Register, RegisterClass,
        dominance::{DominatorTree, PostDominatorTree},
        loops::{Loop, LoopInfo},
    },
    cleanup::PseudoCleanup,
    compact_order::{BlockIndex, CompactNode, CompactOrder},
    constraints::{ConstraintInsertion, ConstraintResult, ConstraintStyle, RegionConstraint},
    errors::LinearizeError,
    linearize::{ActivatingRegion, LinearizationMethod, LinearizationResult},
    persistency::{InstrLoc, PersistencyAnalysis, PersistencyResult, RegionPersistency},
    pipeline::{Pipeline, PipelineConfig, PipelineResult},
    region::Region,
    secrets::{SecretTracker, SensitiveBranchFinder},
    target::{BranchInfo, TargetHooks},
};

/// Deterministic hash map/set aliases used throughout this crate.
///
/// Mirrors the workspace convention (see `midenc_hir::FxHashMap`) of pairing `hashbrown`'s
/// collections with `rustc_hash`'s non-randomized hasher, so that iteration order is a pure
/// function of insertion history rather than of a per-process random seed. This crate promises
/// deterministic output across runs (see the pipeline's ordering guarantees), which rules out
/// `std::collections::HashMap`'s default hasher outright.
pub(crate) type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FxHashSet<K> = hashbrown::HashSet<K, rustc_hash::FxBuildHasher>;
