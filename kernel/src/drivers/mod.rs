//! Device Drivers
//!
//! Minimal drivers for kernel operation:
//! - Clock sources (host monotonic clock, manual test clock)
//! - Timer hook (timeslice expiry, CPU-time accounting)

pub mod clock;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
