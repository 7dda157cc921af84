//! # sidetone
//!
//! Bounded tone queue and playback pump for Morse-code audio generation.
//!
//! ## Architecture
//!
//! ```text
//! Producers (keyer, text sender, ...) → ToneQueue → pump thread
//!                                          │            │
//!                                    low water      ToneRenderer
//!                                    callback       (PCM, sink)
//!                                          │            │
//!                                       refill       KeySink
//! ```
//!
//! Producers enqueue logical Morse elements (marks, spaces, arbitrary
//! tones); one consumer thread pulls them and drives a renderer. The queue
//! preserves strict FIFO order, wakes the consumer the instant work
//! appears, invites refills through a low water callback, republishes a
//! "forever" tone until its successor arrives, and can atomically
//! backspace the trailing character while it is still wholly queued.
//!
//! Rendering PCM and timing tones are the renderer's job; the queue never
//! touches the wall clock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod error;
pub mod key;
pub mod pump;
pub mod queue;
pub mod tone;

// Convenience re-exports for downstream crates
pub use error::{Result, SidetoneError};
pub use key::{KeyLevel, KeySink};
pub use pump::{Pump, PumpContext, PumpSnapshot, PumpStats, ToneRenderer};
pub use queue::{ConsumerHandle, DequeueOutcome, ToneQueue};
pub use tone::{
    SlopeMode, Tone, CAPACITY_MAX, FREQUENCY_MAX, FREQUENCY_MIN, HIGH_WATER_MARK_MAX,
};
