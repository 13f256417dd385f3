use alloc::string::String;

use crate::Block;

/// The error taxonomy for this crate's pipeline.
///
/// Every variant is fatal: a function that produces one of these is rejected outright and is not
/// expected to be retried or partially processed. See the module docs on [`crate::Pipeline`] for
/// how these surface to a caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinearizeError {
    #[error(
        "function `{function}`: activating region rooted at {entry} fails the SESE invariant \
         (exit {exit} does not post-dominate the region entry)"
    )]
    NonStructurableRegion { function: String, entry: Block, exit: Block },

    #[error(
        "function `{function}`: PCFL linearization terminated with {remaining} unresolved \
         deferral edge(s) still pending"
    )]
    UnresolvableDeferral { function: String, remaining: usize },

    #[error(
        "function `{function}`: {block} exits a sensitive region with more than one successor, \
         which the SESE strategy cannot linearize"
    )]
    UnsupportedExitingBlock { function: String, block: Block },

    #[error(
        "function `{function}`: {block} has no valid unconditional successor (every successor \
         post-dominates it)"
    )]
    NoUnconditionalSuccessor { function: String, block: Block },

    #[error("function `{function}`: {block} has a terminator the target could not decode")]
    MalformedTerminator { function: String, block: Block },
}
