//! Node failures.
//!
//! A failing node stores an `Arc`'d failure record as its result. The record
//! remembers where the failure originated and the chain of requesting keys it
//! bubbled through, so diagnostics can print a path from the failing node up
//! to a build root.

use std::fmt;
use std::sync::Arc;

/// Shared handle to a failure; cloned into every transitive rdep.
pub type NodeError<K, E> = Arc<NodeFailure<K, E>>;

#[derive(Debug, Clone)]
pub struct NodeFailure<K, E> {
    /// Key of the node the failure originated at.
    pub origin: K,
    /// Requesting keys the failure bubbled through, innermost first. Does not
    /// include `origin`.
    pub chain: Vec<K>,
    pub kind: FailureKind<K, E>,
}

#[derive(Debug, Clone)]
pub enum FailureKind<K, E> {
    /// The function for the origin key failed.
    Function(E),
    /// A `request` chain would have waited on an ancestor. The path lists the
    /// participating keys in request order, first repeated last.
    Cycle(Vec<K>),
    /// The evaluation was cancelled before this node produced a value.
    Cancelled,
    /// The scheduler wedged: work remained but nothing was runnable. Always a
    /// bug in the engine or a handler.
    Internal(&'static str),
}

impl<K: Clone, E> NodeFailure<K, E> {
    pub fn new(origin: K, kind: FailureKind<K, E>) -> NodeError<K, E> {
        Arc::new(NodeFailure { origin, chain: Vec::new(), kind })
    }

    /// Extends the requesting chain with the key of a forwarding node.
    pub fn forwarded(self: &Arc<Self>, via: K) -> NodeError<K, E>
    where
        E: Clone,
    {
        let mut chain = self.chain.clone();
        chain.push(via);
        Arc::new(NodeFailure { origin: self.origin.clone(), chain, kind: self.kind.clone() })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, FailureKind::Cancelled)
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self.kind, FailureKind::Cycle(_))
    }

    /// The function error at the origin, when the failure is one.
    pub fn function_error(&self) -> Option<&E> {
        match &self.kind {
            FailureKind::Function(e) => Some(e),
            _ => None,
        }
    }
}

// Equality is used for change pruning: a node that fails the same way twice
// does not re-dirty its rdeps.
impl<K: PartialEq, E: PartialEq> PartialEq for NodeFailure<K, E> {
    fn eq(&self, other: &Self) -> bool {
        if self.origin != other.origin {
            return false;
        }
        match (&self.kind, &other.kind) {
            (FailureKind::Function(a), FailureKind::Function(b)) => a == b,
            (FailureKind::Cycle(a), FailureKind::Cycle(b)) => a == b,
            (FailureKind::Cancelled, FailureKind::Cancelled) => false,
            (FailureKind::Internal(a), FailureKind::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl<K: fmt::Debug, E: fmt::Display> fmt::Display for NodeFailure<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Function(e) => write!(f, "{:?}: {}", self.origin, e)?,
            FailureKind::Cycle(path) => {
                write!(f, "cycle detected: ")?;
                for (i, k) in path.iter().enumerate() {
                    if i > 0 {
                        write!(f, " -> ")?;
                    }
                    write!(f, "{:?}", k)?;
                }
            }
            FailureKind::Cancelled => write!(f, "{:?}: cancelled", self.origin)?,
            FailureKind::Internal(msg) => write!(f, "{:?}: internal error: {}", self.origin, msg)?,
        }
        if !self.chain.is_empty() {
            write!(f, " (required by")?;
            for k in &self.chain {
                write!(f, " {:?}", k)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
