//! The tone record carried through the queue.
//!
//! A tone is duration + frequency + slope shape. Frequency zero is a
//! "space" (key open, silence of the given length); non-zero is a "mark".
//! Two flags ride along for queue-level features: `is_forever` keeps the
//! tone at the head of the queue until a successor arrives, and `is_first`
//! marks the first tone of a logical character so that backspace can find
//! character boundaries.

/// Maximum number of tones a queue can be configured to hold.
/// Roughly five minutes of Morse at 12 WPM.
pub const CAPACITY_MAX: usize = 3000;

/// Maximum configurable high water mark.
pub const HIGH_WATER_MARK_MAX: usize = 2900;

/// Lowest accepted tone frequency, in Hz. Zero is a silent tone (space).
pub const FREQUENCY_MIN: i32 = 0;

/// Highest accepted tone frequency, in Hz.
pub const FREQUENCY_MAX: i32 = 4000;

/// How the renderer should shape the amplitude envelope of a tone.
///
/// Slopes (ramps) at tone boundaries avoid audible clicks; the queue only
/// transports the choice, the renderer applies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlopeMode {
    /// Rising slope in, falling slope out. The usual shape for marks.
    #[default]
    StandardSlopes,
    /// Constant amplitude for the whole duration (also used for spaces).
    NoSlopes,
    /// Rising slope only, constant amplitude to the end. Used for the
    /// opening fragment of a tone continued by a forever tone.
    RisingSlope,
    /// Constant amplitude, falling slope at the end. Closes a held tone.
    FallingSlope,
}

/// A single queued tone. Immutable once enqueued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    /// Duration in microseconds. Zero-duration tones are accepted by
    /// `enqueue` but dropped; negative durations are rejected.
    pub duration_us: i64,
    /// Frequency in Hz, within `FREQUENCY_MIN..=FREQUENCY_MAX`.
    pub frequency: i32,
    /// Amplitude envelope shape, passed through to the renderer.
    pub slope_mode: SlopeMode,
    /// Relative amplitude override in [0.0, 1.0], if the producer wants
    /// something other than the renderer's configured volume.
    pub amplitude: Option<f32>,
    /// Keep this tone at the head of the queue, republishing it on every
    /// dequeue, until a successor tone is enqueued.
    pub is_forever: bool,
    /// First tone of a logical character. Consumed by backspace.
    pub is_first: bool,
}

impl Tone {
    /// A tone with the given duration, frequency and slope shape.
    pub fn new(duration_us: i64, frequency: i32, slope_mode: SlopeMode) -> Self {
        Self {
            duration_us,
            frequency,
            slope_mode,
            amplitude: None,
            is_forever: false,
            is_first: false,
        }
    }

    /// A silent tone (space) of the given duration.
    pub fn silence(duration_us: i64) -> Self {
        Self::new(duration_us, 0, SlopeMode::NoSlopes)
    }

    /// Mark this tone as the first of a logical character.
    pub fn first(mut self) -> Self {
        self.is_first = true;
        self
    }

    /// Mark this tone as a forever tone. Its duration becomes nominal:
    /// the queue republishes it until a successor is enqueued.
    pub fn forever(mut self) -> Self {
        self.is_forever = true;
        self
    }

    /// Override the renderer's amplitude for this tone.
    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = Some(amplitude);
        self
    }

    /// True for spaces (frequency zero), i.e. key open.
    pub fn is_silent(&self) -> bool {
        self.frequency == 0
    }
}

impl Default for Tone {
    fn default() -> Self {
        Self::silence(0)
    }
}
