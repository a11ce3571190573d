//! Core constants, errors, traits and runtime context.

mod clock;
pub mod constants;
mod context;
mod error;
mod traits;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::TransportContext;
pub use error::*;
pub use traits::PacketListener;
