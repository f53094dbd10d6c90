//! Core types for stagechain.
//!
//! This module contains the fundamental vocabulary shared by stages,
//! composers and the invoker.

mod kind;

pub use kind::StageKind;
