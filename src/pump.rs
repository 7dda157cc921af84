//! The consumer loop: dequeue tones and hand them to a renderer.
//!
//! ## Loop shape (per iteration)
//!
//! ```text
//! 1. Check the running flag
//! 2. dequeue()
//!      Dequeued(tone) -> renderer.render(&tone)   (renderer owns the clock)
//!      Emptied        -> renderer.finish()        (flush tail state, once)
//!      Idle           -> block until enqueue wakes us or running clears
//! ```
//!
//! The loop runs on a dedicated OS thread because `render` blocks for the
//! audible duration of each tone. Renderer failures are counted and logged
//! but never tear the loop down mid-stream; a stuck audio device should
//! not silently discard the producer's queued Morse.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::error::Result;
use crate::queue::{DequeueOutcome, ToneQueue};
use crate::tone::Tone;

/// Sample-producing backend driven by the pump.
///
/// The queue does no timing: `render` is expected to block for the
/// audible duration of the tone (writing PCM to a sink, toggling a GPIO
/// line, or just sleeping in tests). A forever tone is delivered to
/// `render` once per republication.
pub trait ToneRenderer: Send + 'static {
    /// Produce one tone's worth of output.
    ///
    /// # Errors
    /// Backend failures are opaque to the pump; report them as `anyhow`
    /// errors and they will be logged and counted.
    fn render(&mut self, tone: &Tone) -> anyhow::Result<()>;

    /// The queue has just drained. Flush ramp-down and buffered samples so
    /// the sink falls silent cleanly. Called exactly once per drain.
    ///
    /// # Errors
    /// As for [`render`](Self::render).
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Shared counters for observing pump behaviour.
#[derive(Default)]
pub struct PumpStats {
    pub tones_rendered: AtomicUsize,
    pub drains: AtomicUsize,
    pub idle_waits: AtomicUsize,
    pub render_errors: AtomicUsize,
}

impl PumpStats {
    pub fn snapshot(&self) -> PumpSnapshot {
        PumpSnapshot {
            tones_rendered: self.tones_rendered.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            idle_waits: self.idle_waits.load(Ordering::Relaxed),
            render_errors: self.render_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PumpSnapshot {
    pub tones_rendered: usize,
    pub drains: usize,
    pub idle_waits: usize,
    pub render_errors: usize,
}

/// Everything the pump loop needs, passed as one struct so the spawn
/// closure stays tidy.
pub struct PumpContext {
    pub queue: Arc<ToneQueue>,
    pub renderer: Box<dyn ToneRenderer>,
    pub running: Arc<AtomicBool>,
    pub stats: Arc<PumpStats>,
}

/// Run the blocking consumer loop until `ctx.running` becomes false.
///
/// Attaches to the queue as its consumer for the duration of the call, so
/// producer-side `wait_for_*` primitives are live while the loop runs and
/// fail with `WouldDeadlock` once it returns.
pub fn run(mut ctx: PumpContext) {
    info!("tone pump started");

    // Gate open from here until the loop exits, even on an early return.
    let _consumer = ctx.queue.attach_consumer();

    while ctx.running.load(Ordering::Relaxed) {
        match ctx.queue.dequeue() {
            DequeueOutcome::Dequeued(tone) => {
                ctx.stats.tones_rendered.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = ctx.renderer.render(&tone) {
                    ctx.stats.render_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("renderer failed on tone: {e:#}");
                }
            }
            DequeueOutcome::Emptied => {
                ctx.stats.drains.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = ctx.renderer.finish() {
                    ctx.stats.render_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("renderer failed to finish drain: {e:#}");
                }
            }
            DequeueOutcome::Idle => {
                ctx.stats.idle_waits.fetch_add(1, Ordering::Relaxed);
                ctx.queue.wait_for_work(&ctx.running);
            }
        }
    }

    info!("tone pump stopped");
}

/// Handle to a pump running on its own thread.
pub struct Pump {
    running: Arc<AtomicBool>,
    stats: Arc<PumpStats>,
    thread: Option<JoinHandle<()>>,
}

impl Pump {
    /// Spawn the consumer thread for `queue`.
    ///
    /// # Errors
    /// `Io` when the OS refuses to spawn the thread.
    pub fn spawn(queue: Arc<ToneQueue>, renderer: impl ToneRenderer) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PumpStats::default());

        let ctx = PumpContext {
            queue,
            renderer: Box::new(renderer),
            running: Arc::clone(&running),
            stats: Arc::clone(&stats),
        };

        let thread = thread::Builder::new()
            .name("sidetone-pump".into())
            .spawn(move || run(ctx))?;

        Ok(Self {
            running,
            stats,
            thread: Some(thread),
        })
    }

    /// Counter snapshot for observability.
    pub fn stats(&self) -> PumpSnapshot {
        self.stats.snapshot()
    }

    /// Ask the loop to stop and wait for the thread to exit. Any tone the
    /// renderer is in the middle of is completed, not cut.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("tone pump thread panicked");
            }
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
