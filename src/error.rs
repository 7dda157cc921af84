use thiserror::Error;

use crate::tone::{CAPACITY_MAX, FREQUENCY_MAX, FREQUENCY_MIN, HIGH_WATER_MARK_MAX};

/// All errors produced by sidetone.
#[derive(Debug, Error)]
pub enum SidetoneError {
    #[error("tone frequency {0} Hz is outside {FREQUENCY_MIN}..={FREQUENCY_MAX}")]
    FrequencyOutOfRange(i32),

    #[error("tone duration must be non-negative, got {0} us")]
    NegativeDuration(i64),

    #[error("queue capacity must be in 1..={CAPACITY_MAX}, got {0}")]
    CapacityOutOfRange(usize),

    #[error("high water mark must be in 1..={HIGH_WATER_MARK_MAX} and no larger than capacity, got {0}")]
    HighWaterMarkOutOfRange(usize),

    #[error("low water level {level} must be below queue capacity {capacity}")]
    LowWaterLevelOutOfRange { level: usize, capacity: usize },

    /// The "try again" kind: the tone itself was well-formed.
    #[error("tone queue is full, retry after the consumer dequeues")]
    QueueFull,

    #[error("no consumer is attached to wake this thread, waiting would deadlock")]
    WouldDeadlock,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Opaque failure from a renderer backend (audio driver, file sink, ...).
    #[error(transparent)]
    Render(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SidetoneError>;
