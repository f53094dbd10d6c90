//! Composition and invocation.
//!
//! This module provides:
//! - [`Sequence`]: stages applied in order (flattened, hence associative)
//! - [`ParallelGroup`]: named branches over one input, merged into an object
//! - [`Assign`]: a parallel group merged into its own input object
//! - [`Branch`]: predicate routing between alternatives
//! - [`Pipeline`]: a validated graph with `invoke` and `invoke_many`

mod assign;
mod branch;
mod builder;
mod describe;
mod failure;
mod invoker;
mod parallel;
mod sequence;
mod validation;

#[cfg(test)]
mod integration_tests;

pub use assign::Assign;
pub use branch::{Branch, BranchBuilder, Predicate};
pub use builder::PipelineBuilder;
pub use describe::StageDescriptor;
pub use failure::{BatchSummary, BranchFailure, MergePolicy};
pub use invoker::{BatchOutcome, InvocationResult, Pipeline};
pub use parallel::{ExecutionMode, ParallelGroup, ParallelGroupBuilder};
pub use sequence::Sequence;
pub use validation::detect_cycles;
