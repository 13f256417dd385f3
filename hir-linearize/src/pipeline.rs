//! The top-level entry point wiring every stage together in the fixed order §2's diagram
//! describes, mirroring how the original `CFLPass` drives `FindSecrets` -> `TrackSecrets` ->
//! `AMiLinearizationAnalysis` -> `PersistencyAnalysis` -> `AddMimicryConstraints` as one sequential
//! per-function pipeline rather than a generic `PassManager` schedule (this crate has none of its
//! own -- a host compiler's pass manager is expected to invoke [`Pipeline::run`] as a single step).

use crate::{
    ConstraintInsertion, ConstraintResult, ConstraintStyle, DominatorTree, LinearizeError,
    LinearizationMethod, LinearizationResult, LoopInfo, MachineFunction, PersistencyAnalysis,
    PersistencyResult, PostDominatorTree, Register, SecretTracker, SensitiveBranchFinder,
    TargetHooks, compact_order::CompactOrder, linearize,
};

/// The configuration surface for one [`Pipeline::run`] call: two booleans and an enum, per §6 --
/// no files, environment variables, or persisted state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// When set, every analysis stage still runs to completion, but any CFG mutation it would
    /// have applied is undone before `run` returns (§3's "Lifecycle", §4.2's "Post" step 4).
    pub analysis_only: bool,
    /// Which [`LinearizationMethod`] to run: `Pcfl` (the default) or `Sese`.
    pub method: LinearizationMethod,
    /// Which shape [`ConstraintInsertion`] uses to encode mimicry constraints.
    pub constraint_style: ConstraintStyle,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_only: false,
            method: LinearizationMethod::Pcfl,
            constraint_style: ConstraintStyle::Block,
        }
    }
}

/// Everything [`Pipeline::run`] hands back to its caller: the edge/region classification, the
/// per-region persistency result, and what [`ConstraintInsertion`] did with them. Each is kept by
/// the analysis manager a real driver would own; this crate just returns the bundle directly since
/// it has no analysis-manager of its own to cache it in.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub linearization: LinearizationResult,
    pub persistency: PersistencyResult,
    pub constraints: ConstraintResult,
}

/// The pipeline itself. Stateless between calls -- every field a single run needs is local to
/// [`Pipeline::run`], matching §5's "holds no data that outlives one function's processing".
#[derive(Debug, Default, Copy, Clone)]
pub struct Pipeline;

impl Pipeline {
    /// Runs every stage of §2's pipeline over `func`, seeded by `initial_secrets` (this crate's
    /// stand-in for an IR-level `SecretSource`), using `hooks` for every target-specific query and
    /// mutation.
    ///
    /// Order matches the diagram exactly: secret tracking and sensitive-branch discovery, then the
    /// ambient dominance/loop/compact-order analyses those later stages are built on, then
    /// linearization, then persistency, then constraint insertion. `PseudoCleanup` is not run here
    /// -- it belongs to the register-allocation boundary, a later stage of the host compiler's own
    /// pipeline, not this function's (see [`crate::PseudoCleanup`]'s docs).
    pub fn run(
        func: &mut MachineFunction,
        hooks: &dyn TargetHooks,
        initial_secrets: impl IntoIterator<Item = Register>,
        config: PipelineConfig,
    ) -> Result<PipelineResult, LinearizeError> {
        log::trace!(
            target: "linearize::pipeline",
            "running pipeline over `{}`, method={:?}, analysis_only={}",
            func.name(),
            config.method,
            config.analysis_only,
        );

        let secrets = SecretTracker::analyze(func, initial_secrets);
        let sensitive = SensitiveBranchFinder::analyze(func, hooks, &secrets);
        // §4.6: SECRET_DEP_BR is emitted here, during secret tracking, not by linearization itself
        // -- it is a taint marker later stages (and ultimately PseudoCleanup) consume, not an
        // input to the classification below.
        sensitive.annotate(func);

        log::debug!(
            target: "linearize::pipeline",
            "`{}`: {} sensitive branch block(s)",
            func.name(),
            sensitive.blocks().len(),
        );

        let domtree = DominatorTree::compute(func);
        let pdomtree = PostDominatorTree::compute(func);
        let loops = LoopInfo::compute(func, &domtree);
        let compact_order = CompactOrder::compute(func, &domtree, &loops);

        let linearization = linearize::run(
            func,
            hooks,
            &domtree,
            &pdomtree,
            &compact_order,
            &sensitive,
            config.method,
            config.analysis_only,
        )?;

        let persistency = PersistencyAnalysis::analyze(func, hooks, linearization.regions());

        let constraints = ConstraintInsertion::run(
            func,
            hooks,
            linearization.regions(),
            &persistency,
            config.constraint_style,
            config.analysis_only,
        );

        log::trace!(
            target: "linearize::pipeline",
            "`{}`: pipeline complete, {} region(s)",
            func.name(),
            linearization.regions().len(),
        );

        Ok(PipelineResult { linearization, persistency, constraints })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{PseudoOp, testing};

    #[test]
    fn runs_end_to_end_on_diamond() {
        let (mut func, hooks, secret, blocks) = testing::diamond_with_secret_branch();

        let result = Pipeline::run(&mut func, &hooks, [secret], PipelineConfig::default())
            .expect("pipeline should succeed on a simple diamond");

        assert_eq!(
            result.linearization.activating_edges(),
            &[(blocks.a, blocks.c), (blocks.b, blocks.d)]
        );
        assert!(!func.has_edge(blocks.a, blocks.c));

        // The branch block carries a SECRET_DEP_BR marker left for PseudoCleanup.
        assert!(
            func.instructions(blocks.a).iter().any(|i| i.is_pseudo(PseudoOp::SecretDepBr))
        );
    }

    #[test]
    fn analysis_only_leaves_cfg_untouched() {
        let (mut func, hooks, secret, blocks) = testing::diamond_with_secret_branch();
        let before = func.clone();

        let config = PipelineConfig { analysis_only: true, ..PipelineConfig::default() };
        let result =
            Pipeline::run(&mut func, &hooks, [secret], config).expect("analysis-only succeeds");

        assert_eq!(func.succs(blocks.a), before.succs(blocks.a));
        assert_eq!(func.succs(blocks.a).len(), 2);
        assert_eq!(
            result.linearization.activating_edges(),
            &[(blocks.a, blocks.c), (blocks.b, blocks.d)]
        );
        assert!(result.constraints.region(blocks.a).is_some());
        assert!(result.constraints.region(blocks.a).unwrap().constraint_block.is_none());
    }

    #[test]
    fn persistent_store_gets_ghost_load_through_full_pipeline() {
        let (mut func, hooks, secret, reg_x, blocks) = testing::diamond_with_persistent_store();

        Pipeline::run(&mut func, &hooks, [secret], PipelineConfig::default())
            .expect("pipeline should succeed");

        let ghost_loads = func
            .instructions(blocks.b)
            .iter()
            .filter(|i| i.is_pseudo(PseudoOp::GhostLoad))
            .count();
        assert_eq!(ghost_loads, 1);
        let _ = reg_x;
    }
}
