//! Default, in-crate secret tracking.
//!
//! Identifying *source* secrets (which IR-level values are secret to begin with) is an external
//! collaborator's job -- a caller supplies the seed set, the same way the original system's
//! `SecretSource`/`FindSecrets` front-end pass feeds its own `TrackSecrets` machine-level tracker.
//! What this module owns is the machine-level propagation of that taint through def-use chains
//! (`SecretTracker`) and the resulting classification of branch blocks as sensitive
//! (`SensitiveBranchFinder`), so that the rest of the pipeline can run against this crate's own
//! CFG model without requiring a caller to reimplement taint propagation themselves.

use alloc::vec::Vec;

use crate::{Block, FxHashSet, MachineFunction, PseudoOp, Register, TargetHooks};

/// Tracks which [`Register`]s carry a secret-derived value.
///
/// Propagation is a simple forward fixpoint over def-use: a register is secret if any
/// instruction defining it reads a secret operand, or the instruction is itself marked with the
/// [`PseudoOp::Secret`] taint pseudo. Blocks are visited repeatedly until no new register is
/// marked, which converges in a bounded number of iterations for the loop structures this crate
/// is expected to see (no unbounded recursive taint amplification).
#[derive(Debug, Clone, Default)]
pub struct SecretTracker {
    secret: FxHashSet<Register>,
}

impl SecretTracker {
    /// Runs taint propagation seeded by `initial_secrets`.
    pub fn analyze(func: &MachineFunction, initial_secrets: impl IntoIterator<Item = Register>) -> Self {
        let mut secret: FxHashSet<Register> = initial_secrets.into_iter().collect();

        let mut changed = true;
        while changed {
            changed = false;
            for block in func.reachable_blocks() {
                for instr in func.instructions(block) {
                    let tainted = instr.is_pseudo(PseudoOp::Secret)
                        || instr.uses().any(|r| secret.contains(&r));
                    if !tainted {
                        continue;
                    }
                    for def in instr.defs() {
                        if secret.insert(def) {
                            changed = true;
                        }
                    }
                }
            }
        }

        Self { secret }
    }

    pub fn is_secret(&self, reg: Register) -> bool {
        self.secret.contains(&reg)
    }

    pub fn secrets(&self) -> impl Iterator<Item = Register> + '_ {
        self.secret.iter().copied()
    }
}

/// Derives the set of *sensitive branch blocks*: blocks whose terminator is a conditional or
/// indirect branch whose condition reads a secret register.
#[derive(Debug, Clone, Default)]
pub struct SensitiveBranchFinder {
    sensitive: FxHashSet<Block>,
}

impl SensitiveBranchFinder {
    pub fn analyze(
        func: &MachineFunction,
        hooks: &dyn TargetHooks,
        secrets: &SecretTracker,
    ) -> Self {
        let mut sensitive = FxHashSet::default();
        for block in func.reachable_blocks() {
            let Ok(branch) = hooks.analyze_branch(func, block) else {
                continue;
            };
            if !branch.is_conditional() {
                continue;
            }
            if branch.condition.iter().any(|op| secrets.is_secret(op.register)) {
                sensitive.insert(block);
            }
        }
        Self { sensitive }
    }

    pub fn is_sensitive(&self, block: Block) -> bool {
        self.sensitive.contains(&block)
    }

    pub fn blocks(&self) -> Vec<Block> {
        let mut v: Vec<_> = self.sensitive.iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Marks every instruction's `SECRET_DEP_BR`/`SECRET` pseudo, the way `FindSecrets`'s
    /// original IR-level annotation is mirrored at the machine level: a visible, erasable record
    /// of what this analysis concluded, consumed by `PersistencyAnalysis` and erased by
    /// [`crate::PseudoCleanup`].
    pub fn annotate(&self, func: &mut MachineFunction) {
        for &block in &self.blocks() {
            let terminator_index = func.instructions(block).len().saturating_sub(1);
            func.insert_instruction_before(
                block,
                terminator_index,
                crate::Instruction::pseudo(PseudoOp::SecretDepBr, []),
            );
        }
    }
}
