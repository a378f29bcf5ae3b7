//! Incremental keyed evaluation for the skein build tool.
//!
//! The engine memoizes computations addressed by typed keys and re-evaluates
//! only what a change can have reached. Callers register one [`Handler`] that
//! dispatches on the key's function name; handlers declare their dependencies
//! by requesting further keys through the [`Context`] handle and are restarted
//! once missing deps land.
//!
//! Versioning follows two stamps per node: `changed_at` (last version at
//! which the value differed from its predecessor) and `evaluated_at` (last
//! version at which the node was confirmed current). A node whose deps all
//! have `changed_at <= evaluated_at` is declared clean without running its
//! function; a node whose rerun produces an equal value advances only
//! `evaluated_at`, cutting change propagation off early.

#![warn(rust_2018_idioms)]

mod engine;
mod error;
mod node;

pub use crate::engine::{
    CancelHandleRef, Context, Engine, EvalOptions, EvalResult, EvalStats, GraphError, GraphKey,
    GraphValue, Handler, Step,
};
pub use crate::error::{FailureKind, NodeError, NodeFailure};
pub use crate::node::Version;
