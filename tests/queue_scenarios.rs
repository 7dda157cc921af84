use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sidetone::{
    DequeueOutcome, Pump, SidetoneError, SlopeMode, Tone, ToneQueue, ToneRenderer,
};

fn tone(duration_us: i64, frequency: i32) -> Tone {
    Tone::new(duration_us, frequency, SlopeMode::NoSlopes)
}

/// Renderer that sleeps for each tone's nominal duration and records what
/// it played. Sleeping stands in for writing PCM: the renderer owns the
/// clock, the queue does not.
struct SleepRenderer {
    played: Arc<Mutex<Vec<i32>>>,
    finishes: Arc<AtomicUsize>,
}

impl SleepRenderer {
    fn new() -> (Self, Arc<Mutex<Vec<i32>>>, Arc<AtomicUsize>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        let finishes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                played: Arc::clone(&played),
                finishes: Arc::clone(&finishes),
            },
            played,
            finishes,
        )
    }
}

impl ToneRenderer for SleepRenderer {
    fn render(&mut self, tone: &Tone) -> anyhow::Result<()> {
        self.played.lock().push(tone.frequency);
        thread::sleep(Duration::from_micros(tone.duration_us as u64));
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Retry a wait primitive until the pump's consumer registration is live.
/// The pump attaches on its own thread, so the first few calls can lose
/// the race and fail with `WouldDeadlock`.
fn wait_with_consumer_retry<T>(
    timeout: Duration,
    mut op: impl FnMut() -> sidetone::Result<T>,
) -> T {
    let start = Instant::now();
    loop {
        match op() {
            Ok(value) => return value,
            Err(SidetoneError::WouldDeadlock) => {
                if start.elapsed() >= timeout {
                    panic!("consumer never attached within {timeout:?}");
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => panic!("unexpected wait error: {e}"),
        }
    }
}

#[test]
fn fill_and_drain_fires_low_water_exactly_once() {
    let queue = Arc::new(ToneQueue::new());
    queue.set_capacity(30, 26).unwrap();

    let observations = Arc::new(Mutex::new(Vec::new()));
    let queue_in_callback = Arc::clone(&queue);
    let observations_in_callback = Arc::clone(&observations);
    queue
        .set_low_water_callback(4, move || {
            observations_in_callback
                .lock()
                .push(queue_in_callback.length());
        })
        .unwrap();

    for duration in 1..=30 {
        queue.enqueue(tone(duration, 1000)).unwrap();
    }
    assert!(queue.is_full());

    let mut durations = Vec::new();
    for _ in 0..30 {
        match queue.dequeue() {
            DequeueOutcome::Dequeued(t) => durations.push(t.duration_us),
            other => panic!("expected a tone, got {other:?}"),
        }
    }
    let expected: Vec<i64> = (1..=30).collect();
    assert_eq!(durations, expected);

    assert_eq!(queue.dequeue(), DequeueOutcome::Emptied);
    assert_eq!(queue.dequeue(), DequeueOutcome::Idle);

    // One crossing, one invocation, observed at the moment len hit 4.
    let observed = observations.lock().clone();
    assert_eq!(observed, vec![4]);
}

#[test]
fn forever_tone_republishes_until_a_successor_arrives() {
    let queue = ToneQueue::new();

    queue.enqueue(tone(1000, 440).forever()).unwrap();

    for _ in 0..5 {
        match queue.dequeue() {
            DequeueOutcome::Dequeued(t) => {
                assert_eq!(t.frequency, 440);
                assert_eq!(t.duration_us, 1000);
                assert!(t.is_forever);
            }
            other => panic!("expected the forever tone again, got {other:?}"),
        }
        assert_eq!(queue.length(), 1);
    }

    queue.enqueue(tone(500, 880)).unwrap();

    // The successor retires the forever tone: returned once more, removed.
    match queue.dequeue() {
        DequeueOutcome::Dequeued(t) => assert_eq!((t.frequency, t.duration_us), (440, 1000)),
        other => panic!("expected the retiring forever tone, got {other:?}"),
    }
    assert_eq!(queue.length(), 1);

    match queue.dequeue() {
        DequeueOutcome::Dequeued(t) => assert_eq!((t.frequency, t.duration_us), (880, 500)),
        other => panic!("expected the successor tone, got {other:?}"),
    }
    assert_eq!(queue.length(), 0);
    assert_eq!(queue.dequeue(), DequeueOutcome::Emptied);
}

#[test]
fn enqueue_on_a_full_queue_is_the_retry_kind() {
    let queue = ToneQueue::new();
    queue.set_capacity(4, 4).unwrap();

    for i in 0..4 {
        queue.enqueue(tone(10, 100 + i)).unwrap();
    }

    let err = queue.enqueue(tone(10, 999)).unwrap_err();
    assert!(matches!(err, SidetoneError::QueueFull));
    assert_eq!(queue.length(), 4);
}

#[test]
fn backspace_removes_one_whole_character_at_a_time() {
    let queue = ToneQueue::new();

    queue.enqueue(tone(10, 1).first()).unwrap();
    queue.enqueue(tone(10, 2)).unwrap();
    queue.enqueue(tone(10, 3)).unwrap();
    queue.enqueue(tone(10, 4).first()).unwrap();
    queue.enqueue(tone(10, 5)).unwrap();
    queue.enqueue(tone(10, 6)).unwrap();

    queue.backspace();
    assert_eq!(queue.length(), 3);

    let mut remaining = Vec::new();
    while let DequeueOutcome::Dequeued(t) = queue.dequeue() {
        remaining.push(t.frequency);
    }
    assert_eq!(remaining, vec![1, 2, 3]);
}

#[test]
fn two_backspaces_remove_two_resident_characters() {
    let queue = ToneQueue::new();

    queue.enqueue(tone(10, 1).first()).unwrap();
    queue.enqueue(tone(10, 2)).unwrap();
    queue.enqueue(tone(10, 3)).unwrap();
    queue.enqueue(tone(10, 4).first()).unwrap();
    queue.enqueue(tone(10, 5)).unwrap();
    queue.enqueue(tone(10, 6)).unwrap();

    queue.backspace();
    queue.backspace();
    assert_eq!(queue.length(), 0);
}

#[test]
fn backspace_is_a_noop_once_the_character_started_playing() {
    let queue = ToneQueue::new();

    queue.enqueue(tone(10, 1).first()).unwrap();
    queue.enqueue(tone(10, 2)).unwrap();
    queue.enqueue(tone(10, 3)).unwrap();

    // The first tone, carrying the is_first marker, leaves the queue.
    match queue.dequeue() {
        DequeueOutcome::Dequeued(t) => assert_eq!(t.frequency, 1),
        other => panic!("expected first tone, got {other:?}"),
    }

    queue.backspace();
    assert_eq!(queue.length(), 2);
}

#[test]
fn low_water_sweep_with_background_consumer() {
    for level in [1usize, 2, 3, 4, 5, 50] {
        let queue = Arc::new(ToneQueue::new());

        let observations = Arc::new(Mutex::new(Vec::new()));
        let queue_in_callback = Arc::clone(&queue);
        let observations_in_callback = Arc::clone(&observations);
        queue
            .set_low_water_callback(level, move || {
                observations_in_callback
                    .lock()
                    .push(queue_in_callback.length());
            })
            .unwrap();

        for i in 0..(3 * level) {
            queue.enqueue(tone(100, (i % 100) as i32 + 1)).unwrap();
        }

        let (renderer, _played, _finishes) = SleepRenderer::new();
        let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

        wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_empty());
        pump.stop();

        let observed = observations.lock().clone();
        assert_eq!(observed.len(), 1, "level {level}: one crossing, one call");
        let len_at_callback = observed[0];
        assert!(
            len_at_callback + 1 >= level && len_at_callback <= level + 1,
            "level {level}: callback observed length {len_at_callback}"
        );
    }
}

#[test]
fn pump_renders_in_order_and_finishes_once_per_drain() {
    let queue = Arc::new(ToneQueue::new());
    let (renderer, played, finishes) = SleepRenderer::new();
    let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

    for i in 0..10 {
        queue.enqueue(tone(100, 200 + i)).unwrap();
    }
    wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_empty());

    // Second burst after the drain: finish must fire once per drain, not
    // once per tone.
    for i in 0..5 {
        queue.enqueue(tone(100, 300 + i)).unwrap();
    }
    wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_empty());

    // The drain is observed by the pump's next dequeue, which can trail
    // wait_for_empty by one cycle.
    let deadline = Instant::now() + Duration::from_secs(5);
    while finishes.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    let snapshot = pump.stats();
    pump.stop();

    let expected: Vec<i32> = (200..210).chain(300..305).collect();
    assert_eq!(*played.lock(), expected);
    assert_eq!(finishes.load(Ordering::SeqCst), 2);
    assert_eq!(snapshot.tones_rendered, 15);
    assert_eq!(snapshot.render_errors, 0);
}

#[test]
fn waits_fail_fast_when_no_consumer_is_attached() {
    let queue = ToneQueue::new();
    queue.enqueue(tone(10, 700)).unwrap();

    let start = Instant::now();
    assert!(matches!(
        queue.wait_for_tone(),
        Err(SidetoneError::WouldDeadlock)
    ));
    assert!(matches!(
        queue.wait_for_empty(),
        Err(SidetoneError::WouldDeadlock)
    ));
    // Gate first, even though the level condition already holds.
    assert!(matches!(
        queue.wait_for_level(100),
        Err(SidetoneError::WouldDeadlock)
    ));
    assert!(
        start.elapsed() < Duration::from_millis(100),
        "closed-gate waits must not sleep"
    );
}

#[test]
fn waits_fail_after_the_pump_stops() {
    let queue = Arc::new(ToneQueue::new());
    let (renderer, _played, _finishes) = SleepRenderer::new();
    let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

    queue.enqueue(tone(100, 700)).unwrap();
    wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_empty());

    pump.stop();

    queue.enqueue(tone(100, 700)).unwrap();
    assert!(matches!(
        queue.wait_for_empty(),
        Err(SidetoneError::WouldDeadlock)
    ));
}

#[test]
fn consumer_teardown_wakes_a_blocked_waiter() {
    let queue = Arc::new(ToneQueue::new());
    let consumer = queue.attach_consumer();

    // Busy queue, gate open, nothing dequeuing: the waiter will block.
    queue.enqueue(tone(10, 700)).unwrap();

    let waiter_queue = Arc::clone(&queue);
    let waiter = thread::spawn(move || waiter_queue.wait_for_empty());

    thread::sleep(Duration::from_millis(20));
    drop(consumer);

    let result = waiter.join().expect("waiter thread panicked");
    assert!(matches!(result, Err(SidetoneError::WouldDeadlock)));
}

#[test]
fn wait_for_level_returns_at_or_below_the_level() {
    let queue = Arc::new(ToneQueue::new());
    let (renderer, _played, _finishes) = SleepRenderer::new();
    let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

    for i in 0..20 {
        queue.enqueue(tone(1000, 100 + i)).unwrap();
    }

    wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_level(10));
    // No producer is refilling, so the length can only have fallen further.
    assert!(queue.length() <= 10);

    pump.stop();
}

#[test]
fn wait_for_tone_returns_once_the_head_tone_completes() {
    let queue = Arc::new(ToneQueue::new());
    let (renderer, _played, _finishes) = SleepRenderer::new();
    let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

    for i in 0..5 {
        queue.enqueue(tone(2000, 100 + i)).unwrap();
    }
    let len_before = queue.length();

    wait_with_consumer_retry(Duration::from_secs(5), || queue.wait_for_tone());
    assert!(queue.length() < len_before || !queue.is_busy());

    pump.stop();
}

#[test]
fn flush_during_playback_empties_and_goes_idle() {
    let queue = Arc::new(ToneQueue::new());
    let (renderer, _played, _finishes) = SleepRenderer::new();
    let pump = Pump::spawn(Arc::clone(&queue), renderer).unwrap();

    for i in 0..50 {
        queue.enqueue(tone(2000, 100 + i)).unwrap();
    }
    thread::sleep(Duration::from_millis(5));

    queue.flush();
    assert_eq!(queue.length(), 0);
    assert!(!queue.is_busy());

    pump.stop();
}

#[test]
fn concurrent_producers_each_keep_program_order() {
    let queue = Arc::new(ToneQueue::new());
    queue.set_capacity(16, 16).unwrap();

    let mut producers = Vec::new();
    for base in [1000i32, 2000] {
        let producer_queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for i in 0..50 {
                loop {
                    match producer_queue.enqueue(tone(1, base + i)) {
                        Ok(()) => break,
                        Err(SidetoneError::QueueFull) => thread::yield_now(),
                        Err(e) => panic!("unexpected enqueue error: {e}"),
                    }
                }
            }
        }));
    }

    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while collected.len() < 100 {
        assert!(Instant::now() < deadline, "drain timed out");
        match queue.dequeue() {
            DequeueOutcome::Dequeued(t) => collected.push(t.frequency),
            _ => thread::sleep(Duration::from_micros(100)),
        }
    }

    for producer in producers {
        producer.join().expect("producer thread panicked");
    }

    for base in [1000i32, 2000] {
        let from_producer: Vec<i32> = collected
            .iter()
            .copied()
            .filter(|f| *f >= base && *f < base + 100)
            .collect();
        let expected: Vec<i32> = (base..base + 50).collect();
        assert_eq!(from_producer, expected, "producer {base} lost its order");
    }
}
