//! Runtime context shared by every transport object.

use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, MonotonicClock};

/// Explicit replacement for process-wide engine state.
///
/// Holds the time source and is cloned into every packet manager,
/// connection and discovery endpoint. Two contexts never share state, so
/// independent transports can live in one process.
#[derive(Debug, Clone)]
pub struct TransportContext {
    clock: Arc<dyn Clock>,
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportContext {
    /// Create a context backed by a monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create a context with a caller-supplied clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// The context's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the context's clock.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}
