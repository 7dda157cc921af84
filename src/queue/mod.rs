//! The bounded tone queue between producers and the audio generator.
//!
//! ## State automaton
//!
//! ```text
//!                    (tone enqueued, consumer woken)
//!        ┌──► Idle ────────────────────────────────► Busy ◄──┐
//!        │                                            │  │   │
//!        │        (dequeue finds the queue empty)     │  └───┘
//!        └────────────────────────────────────────────┘ (tones remain)
//! ```
//!
//! The automaton has two states but [`ToneQueue::dequeue`] reports three
//! outcomes: `Dequeued` (here is a tone, render it), `Emptied` (the last
//! tone just finished, flush the synthesiser tail once) and `Idle` (nothing
//! has been queued since the drain, block until work arrives). Collapsing
//! `Emptied` into `Idle` would force the consumer to run its own edge
//! detector and reopen a race against concurrent enqueues, so the
//! distinction lives here.
//!
//! ## Locking
//!
//! One mutex guards all queue state; one condvar is both the consumer wake
//! (raised by `enqueue` on the Idle to Busy edge, while the mutex is held)
//! and the waiter signal (raised after every dequeue cycle, flush and
//! reset). Waiters re-check their predicate after every wake, so spurious
//! wakeups are harmless. The critical section never does I/O and never runs
//! the low water callback; that callback is invoked after unlock, on the
//! consumer thread, with the decision to fire computed under the lock so a
//! downward crossing fires it exactly once.

mod ring;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SidetoneError};
use crate::key::{KeyLevel, KeySink};
use crate::tone::{Tone, CAPACITY_MAX, FREQUENCY_MAX, FREQUENCY_MIN, HIGH_WATER_MARK_MAX};

use ring::RingBuffer;

/// Upper bound on how long the consumer sleeps between re-checks of its
/// stop flag while the queue is idle. Wakes from `enqueue` arrive
/// immediately; this only bounds shutdown latency.
const WORK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Idle,
    Busy,
}

/// Outcome of one [`ToneQueue::dequeue`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub enum DequeueOutcome {
    /// A tone to render. A forever tone at the head of an otherwise empty
    /// queue is returned here on every call without being removed.
    Dequeued(Tone),
    /// The queue has just drained: the previous call returned the last
    /// tone. Render silence and flush any synthesiser tail state, once.
    Emptied,
    /// The queue was already drained before this call. Sleep until woken.
    Idle,
}

type LowWaterCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    ring: RingBuffer,
    state: QueueState,
    high_water_mark: usize,
    low_water_mark: usize,
    low_water_callback: Option<LowWaterCallback>,
    key_sink: Option<Box<dyn KeySink>>,
    /// The cancellation gate: true while a consumer that can wake blocked
    /// waiters is attached. Read under the mutex by every wait primitive.
    consumer_attached: bool,
}

impl Inner {
    fn notify_key_sink(&mut self, level: KeyLevel) {
        if let Some(sink) = self.key_sink.as_mut() {
            sink.key_level(level);
        }
    }
}

/// Fixed-capacity FIFO of [`Tone`]s serving any number of producer threads
/// and a single consumer.
///
/// `ToneQueue` is `Send + Sync`; wrap it in an `Arc` to share it between
/// producers and the consumer thread. All operations are non-blocking
/// except the `wait_for_*` primitives and the conditional drain wait inside
/// [`flush`](Self::flush).
pub struct ToneQueue {
    inner: Mutex<Inner>,
    /// Consumer wake and waiter signal, see the module docs.
    cycle: Condvar,
}

impl ToneQueue {
    /// An empty queue with the default capacity ([`CAPACITY_MAX`]) and high
    /// water mark ([`HIGH_WATER_MARK_MAX`]).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: RingBuffer::new(),
                state: QueueState::Idle,
                high_water_mark: HIGH_WATER_MARK_MAX,
                low_water_mark: 0,
                low_water_callback: None,
                key_sink: None,
                consumer_attached: false,
            }),
            cycle: Condvar::new(),
        }
    }

    // ── Configuration ────────────────────────────────────────────────────

    /// Set the queue capacity and high water mark.
    ///
    /// Indices and queued tones are left untouched; resizing a non-empty
    /// queue is not supported, configure before first use.
    ///
    /// # Errors
    /// `CapacityOutOfRange` / `HighWaterMarkOutOfRange` when either value
    /// is zero, exceeds its maximum, or `high_water_mark > capacity`.
    pub fn set_capacity(&self, capacity: usize, high_water_mark: usize) -> Result<()> {
        if high_water_mark == 0 || high_water_mark > HIGH_WATER_MARK_MAX {
            // A zero high water mark would declare the queue permanently
            // full to capacity-aware producers.
            return Err(SidetoneError::HighWaterMarkOutOfRange(high_water_mark));
        }
        if capacity == 0 || capacity > CAPACITY_MAX {
            return Err(SidetoneError::CapacityOutOfRange(capacity));
        }
        if high_water_mark > capacity {
            return Err(SidetoneError::HighWaterMarkOutOfRange(high_water_mark));
        }

        let mut inner = self.inner.lock();
        inner.ring.set_capacity(capacity);
        inner.high_water_mark = high_water_mark;
        Ok(())
    }

    /// Register a callback invoked when a dequeue takes the queue length
    /// from above `level` to at or below it. The callback runs on the
    /// consumer thread, outside the queue lock, and may call back into the
    /// queue (typically to enqueue more tones).
    ///
    /// # Errors
    /// `LowWaterLevelOutOfRange` when `level >= capacity`.
    pub fn set_low_water_callback(
        &self,
        level: usize,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if level >= inner.ring.capacity() {
            return Err(SidetoneError::LowWaterLevelOutOfRange {
                level,
                capacity: inner.ring.capacity(),
            });
        }
        inner.low_water_mark = level;
        inner.low_water_callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Disable low water notification.
    pub fn clear_low_water_callback(&self) {
        let mut inner = self.inner.lock();
        inner.low_water_mark = 0;
        inner.low_water_callback = None;
    }

    /// Attach a key-state observer; it sees the key level implied by every
    /// dequeued tone (closed for a mark, open for a space or a drain).
    pub fn set_key_sink(&self, sink: impl KeySink + 'static) {
        self.inner.lock().key_sink = Some(Box::new(sink));
    }

    /// Detach the key-state observer.
    pub fn clear_key_sink(&self) {
        self.inner.lock().key_sink = None;
    }

    // ── Producer side ────────────────────────────────────────────────────

    /// Append a tone to the queue.
    ///
    /// A zero-duration tone is accepted and silently dropped: it would not
    /// be audible and enqueueing it would only burn a slot. When the queue
    /// was idle, the consumer is woken before the lock is released.
    ///
    /// # Errors
    /// - `FrequencyOutOfRange` / `NegativeDuration` for malformed tones.
    /// - `QueueFull` when the queue is at capacity; the tone is well formed
    ///   and the producer should retry after the consumer catches up.
    pub fn enqueue(&self, tone: Tone) -> Result<()> {
        if tone.frequency < FREQUENCY_MIN || tone.frequency > FREQUENCY_MAX {
            return Err(SidetoneError::FrequencyOutOfRange(tone.frequency));
        }
        if tone.duration_us < 0 {
            return Err(SidetoneError::NegativeDuration(tone.duration_us));
        }
        if tone.duration_us == 0 {
            debug!(frequency = tone.frequency, "dropping zero-duration tone");
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if inner.ring.is_full() {
            warn!(len = inner.ring.len(), "enqueue on full tone queue");
            return Err(SidetoneError::QueueFull);
        }

        inner.ring.push(tone);

        if inner.state == QueueState::Idle {
            inner.state = QueueState::Busy;
            // Wake the consumer while still holding the mutex: it must not
            // be able to observe Busy with tones queued and miss the wake.
            self.cycle.notify_all();
        }

        Ok(())
    }

    /// Remove every queued tone and go idle, then wait for the consumer to
    /// observe the drain when a consumer is attached (the wait is skipped,
    /// not failed, when the cancellation gate is closed).
    pub fn flush(&self) {
        {
            let mut inner = self.inner.lock();
            inner.ring.clear();
            inner.state = QueueState::Idle;
        }
        self.cycle.notify_all();

        // WouldDeadlock here means no consumer can be woken; the queue is
        // already empty and idle, so there is nothing to wait for.
        let _ = self.wait_for_empty();
    }

    /// As [`flush`](Self::flush), but also drops the low water
    /// registration and never waits.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.ring.clear();
            inner.state = QueueState::Idle;
            inner.low_water_mark = 0;
            inner.low_water_callback = None;
        }
        self.cycle.notify_all();
    }

    /// Remove the most recently enqueued character, if it is still wholly
    /// resident.
    ///
    /// Walks back from the tail to the nearest tone flagged `is_first` and
    /// truncates the queue there. If the consumer has already dequeued the
    /// character's first tone the walk finds nothing and the queue is left
    /// unchanged; a partially played character is not revocable.
    pub fn backspace(&self) {
        let mut inner = self.inner.lock();
        if !inner.ring.drop_last_character() {
            debug!("backspace found no whole character to remove");
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Number of tones currently queued.
    pub fn length(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().ring.capacity()
    }

    /// Configured high water mark.
    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().high_water_mark
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.ring.is_full()
    }

    /// True from the first enqueue until the consumer observes the drain.
    pub fn is_busy(&self) -> bool {
        self.inner.lock().state != QueueState::Idle
    }

    // ── Consumer side ────────────────────────────────────────────────────

    /// Open the cancellation gate: announce that a consumer is attached
    /// and able to wake blocked waiters. Exactly one consumer may be
    /// attached at a time; dropping the handle closes the gate and fails
    /// any thread still blocked in a `wait_for_*` primitive.
    pub fn attach_consumer(self: &Arc<Self>) -> ConsumerHandle {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.consumer_attached, "tone queue already has a consumer");
        inner.consumer_attached = true;
        drop(inner);
        ConsumerHandle {
            queue: Arc::clone(self),
        }
    }

    /// Take the next tone, or report why there is none.
    ///
    /// See [`DequeueOutcome`] for the three-valued contract. A forever tone
    /// that is alone in the queue is returned without being removed, and
    /// without evaluating the low water mark, on every call until a
    /// successor is enqueued; enqueueing the successor retires it on the
    /// following dequeue.
    pub fn dequeue(&self) -> DequeueOutcome {
        let mut inner = self.inner.lock();

        if inner.state == QueueState::Idle {
            return DequeueOutcome::Idle;
        }

        match inner.ring.front().copied() {
            Some(front) if front.is_forever && inner.ring.len() == 1 => {
                // Sticky head: republish without advancing. No low water
                // check, or a refill callback would fire on every repeat.
                inner.notify_key_sink(KeyLevel::from_frequency(front.frequency));
                drop(inner);
                self.cycle.notify_all();
                DequeueOutcome::Dequeued(front)
            }
            Some(_) => {
                let len_before = inner.ring.len();
                let tone = inner.ring.pop();

                let callback = match &inner.low_water_callback {
                    Some(cb)
                        if len_before > inner.low_water_mark
                            && inner.ring.len() <= inner.low_water_mark =>
                    {
                        Some(Arc::clone(cb))
                    }
                    _ => None,
                };

                inner.notify_key_sink(KeyLevel::from_frequency(tone.frequency));
                drop(inner);
                self.cycle.notify_all();

                // Outside the lock: the callback is free to re-enter the
                // queue, typically to top it up.
                if let Some(callback) = callback {
                    callback();
                }

                DequeueOutcome::Dequeued(tone)
            }
            None => {
                // Busy but drained: this dequeue is the one that notices.
                inner.state = QueueState::Idle;
                inner.notify_key_sink(KeyLevel::Open);
                drop(inner);
                self.cycle.notify_all();
                DequeueOutcome::Emptied
            }
        }
    }

    /// Block the consumer thread until the queue leaves `Idle` or
    /// `running` is cleared. Wakes from `enqueue` arrive immediately; the
    /// poll interval only bounds reaction to a cleared `running` flag.
    pub(crate) fn wait_for_work(&self, running: &AtomicBool) {
        let mut inner = self.inner.lock();
        while running.load(Ordering::Relaxed) && inner.state == QueueState::Idle {
            let _ = self.cycle.wait_for(&mut inner, WORK_POLL_INTERVAL);
        }
    }

    // ── Wait primitives ──────────────────────────────────────────────────

    /// Block until the tone at the head when this call was made has
    /// completed (the head advanced) or the queue went idle.
    ///
    /// # Errors
    /// `WouldDeadlock` when no consumer is attached, on entry or while
    /// waiting; the wait never sleeps behind a closed gate.
    pub fn wait_for_tone(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.consumer_attached {
            return Err(SidetoneError::WouldDeadlock);
        }

        let head_at_entry = inner.ring.head();
        while inner.ring.head() == head_at_entry && inner.state == QueueState::Busy {
            self.cycle.wait(&mut inner);
            if !inner.consumer_attached {
                return Err(SidetoneError::WouldDeadlock);
            }
        }
        Ok(())
    }

    /// Block until the queue has drained and gone idle.
    ///
    /// # Errors
    /// `WouldDeadlock` as for [`wait_for_tone`](Self::wait_for_tone).
    pub fn wait_for_empty(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.consumer_attached {
            return Err(SidetoneError::WouldDeadlock);
        }

        while inner.state == QueueState::Busy {
            self.cycle.wait(&mut inner);
            if !inner.consumer_attached {
                return Err(SidetoneError::WouldDeadlock);
            }
        }
        Ok(())
    }

    /// Block until at most `level` tones remain queued. Returns
    /// immediately when already at or below `level`.
    ///
    /// # Errors
    /// `WouldDeadlock` as for [`wait_for_tone`](Self::wait_for_tone); the
    /// gate is consulted before the level, so a closed gate fails even
    /// when no wait would have been needed.
    pub fn wait_for_level(&self, level: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.consumer_attached {
            return Err(SidetoneError::WouldDeadlock);
        }

        while inner.ring.len() > level {
            self.cycle.wait(&mut inner);
            if !inner.consumer_attached {
                return Err(SidetoneError::WouldDeadlock);
            }
        }
        Ok(())
    }
}

impl Default for ToneQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII token for the attached consumer. While it lives, `wait_for_*`
/// callers may block; dropping it closes the cancellation gate and wakes
/// them with `WouldDeadlock`.
pub struct ConsumerHandle {
    queue: Arc<ToneQueue>,
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        inner.consumer_attached = false;
        drop(inner);
        // Blocked waiters must notice the gate closed rather than sleep on.
        self.queue.cycle.notify_all();
    }
}
