use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_core::types::{ExecutorId, MessageEnvelope};

/// Predicate gating delivery along an edge, evaluated against the routed
/// envelope (for internal signaling this is the sender's prior result).
pub type EdgePredicate = Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

/// One fan-out leg: a target plus its own optional predicate.
#[derive(Clone)]
pub struct FanOutTarget {
    pub target: ExecutorId,
    pub predicate: Option<EdgePredicate>,
}

impl FanOutTarget {
    pub fn new(target: impl Into<ExecutorId>) -> Self {
        Self {
            target: target.into(),
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: EdgePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

impl std::fmt::Debug for FanOutTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutTarget")
            .field("target", &self.target)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

/// A directed connection in the workflow graph.
///
/// The discriminant is fixed at construction; the runtime dispatches on it
/// without inspecting message types.
#[derive(Clone)]
pub enum Edge {
    /// One source, one target, optional delivery predicate.
    Direct {
        source: ExecutorId,
        target: ExecutorId,
        predicate: Option<EdgePredicate>,
    },
    /// One source replicated to every target whose predicate passes.
    FanOut {
        source: ExecutorId,
        targets: Vec<FanOutTarget>,
    },
    /// Synchronization barrier: fires once every named source has
    /// contributed a value since the last firing.
    FanIn {
        sources: Vec<ExecutorId>,
        target: ExecutorId,
    },
}

impl Edge {
    pub fn direct(source: impl Into<ExecutorId>, target: impl Into<ExecutorId>) -> Self {
        Self::Direct {
            source: source.into(),
            target: target.into(),
            predicate: None,
        }
    }

    pub fn direct_when(
        source: impl Into<ExecutorId>,
        target: impl Into<ExecutorId>,
        predicate: EdgePredicate,
    ) -> Self {
        Self::Direct {
            source: source.into(),
            target: target.into(),
            predicate: Some(predicate),
        }
    }

    pub fn fan_out(source: impl Into<ExecutorId>, targets: Vec<FanOutTarget>) -> Self {
        Self::FanOut {
            source: source.into(),
            targets,
        }
    }

    pub fn fan_in(sources: Vec<ExecutorId>, target: impl Into<ExecutorId>) -> Self {
        Self::FanIn {
            sources,
            target: target.into(),
        }
    }

    /// The source ids this edge listens on.
    pub fn sources(&self) -> Vec<&ExecutorId> {
        match self {
            Self::Direct { source, .. } | Self::FanOut { source, .. } => vec![source],
            Self::FanIn { sources, .. } => sources.iter().collect(),
        }
    }

    /// The sink ids this edge can deliver to.
    pub fn sinks(&self) -> Vec<&ExecutorId> {
        match self {
            Self::Direct { target, .. } | Self::FanIn { target, .. } => vec![target],
            Self::FanOut { targets, .. } => targets.iter().map(|t| &t.target).collect(),
        }
    }

    /// Stable identity of this edge, used to index runtime state.
    pub fn connection(&self) -> Connection {
        Connection {
            sources: self.sources().into_iter().cloned().collect(),
            sinks: self.sinks().into_iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { source, target, predicate } => f
                .debug_struct("Direct")
                .field("source", source)
                .field("target", target)
                .field("predicate", &predicate.as_ref().map(|_| ".."))
                .finish(),
            Self::FanOut { source, targets } => f
                .debug_struct("FanOut")
                .field("source", source)
                .field("targets", targets)
                .finish(),
            Self::FanIn { sources, target } => f
                .debug_struct("FanIn")
                .field("sources", sources)
                .field("target", target)
                .finish(),
        }
    }
}

/// Ordered source-set × sink-set identity of an edge.
///
/// Two edges with the same connection resolve to the same stored fan-in
/// state after a checkpoint restore.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Connection {
    pub sources: Vec<ExecutorId>,
    pub sinks: Vec<ExecutorId>,
}

impl Connection {
    /// Stable string form, usable as a map key in portable snapshots.
    pub fn encode(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().map(|s| s.as_str()).collect();
        let sinks: Vec<&str> = self.sinks.iter().map(|s| s.as_str()).collect();
        format!("{}->{}", sources.join("+"), sinks.join("+"))
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}
