//! Choosing which ready connection carries the next message.

use std::{fmt, sync::Arc};

use super::url::PeerAddr;

/// Picks a connection for each outgoing message.
///
/// `ready` lists ready connections in stable address order and is never
/// empty. Returning an out-of-range index selects the first connection.
pub trait SelectionStrategy: Send {
    fn select(&mut self, ready: &[PeerAddr]) -> usize;
}

/// Cycle through ready connections.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl SelectionStrategy for RoundRobin {
    fn select(&mut self, ready: &[PeerAddr]) -> usize {
        let index = self.next % ready.len().max(1);
        self.next = self.next.wrapping_add(1);
        index
    }
}

/// Always use the first ready connection.
#[derive(Debug, Default)]
pub struct Failover;

impl SelectionStrategy for Failover {
    fn select(&mut self, _ready: &[PeerAddr]) -> usize {
        0
    }
}

type StrategyFactory = Arc<dyn Fn() -> Box<dyn SelectionStrategy> + Send + Sync>;

/// Strategy selection carried in configuration.
#[derive(Clone, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    Failover,
    /// A caller supplied strategy.
    Custom(StrategyFactory),
}

impl Strategy {
    /// Wrap a factory for a caller supplied strategy.
    pub fn custom<S, F>(factory: F) -> Self
    where
        S: SelectionStrategy + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Strategy::Custom(Arc::new(move || Box::new(factory()) as Box<dyn SelectionStrategy>))
    }

    pub(crate) fn build(&self) -> Box<dyn SelectionStrategy> {
        match self {
            Strategy::RoundRobin => Box::new(RoundRobin::default()),
            Strategy::Failover => Box::new(Failover),
            Strategy::Custom(factory) => factory(),
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => f.write_str("RoundRobin"),
            Strategy::Failover => f.write_str("Failover"),
            Strategy::Custom(_) => f.write_str("Custom"),
        }
    }
}
