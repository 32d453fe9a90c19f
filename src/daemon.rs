/*! Daemon scheduler: a drift-corrected polling loop around the device
façade, with graceful cancellation and reconnect-on-failure.

One thread per worker, a shared [`crate::cancel::Cancel`] flag checked
at every suspension point, and the main thread joining workers after
requesting a stop. The device itself is additionally guarded by a
`parking_lot::ReentrantMutex`, since the reconnect path in step (b) below
calls `disconnect`/`connect` from inside an already-locked `update_volatile`
call — an ordinary mutex would deadlock there.
*/

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;

use crate::cancel::Cancel;
use crate::device::Device;
use crate::sink::TimeSeriesSink;

/// The device façade, guarded for shared access from the main thread and
/// worker threads. Reentrant so the reconnect sequence in
/// [`poll_once`] can call `disconnect`/`connect` while already holding
/// the lock taken for `update_volatile`.
pub type SharedDevice = Arc<ReentrantMutex<RefCell<Device>>>;

/// Configuration for one polling worker.
pub struct PollConfig {
    /// How often to sample, in seconds.
    pub period: Duration,
    /// Zero-indexed channels to record, in ascending order.
    pub channels: Vec<usize>,
}

/// The long-running process: one shared device, one polling worker, a
/// cancel flag observed by both.
pub struct Daemon {
    device: SharedDevice,
    cancel: Cancel,
    poll_config: PollConfig,
}

impl Daemon {
    /// Build a daemon around an already-constructed device. The device is
    /// not connected yet; [`Daemon::run`] connects it.
    pub fn new(device: Device, poll_config: PollConfig) -> Self {
        Self {
            device: Arc::new(ReentrantMutex::new(RefCell::new(device))),
            cancel: Cancel::new(),
            poll_config,
        }
    }

    /// A clone of this daemon's cancellation flag, for callers (the
    /// signal-waiting main thread, tests) that need to trigger shutdown
    /// without going through [`Daemon::run`]'s blocking wait.
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Connect the device, spawn the polling worker, wait for `wait_for_stop`
    /// to return (normally: blocking on a termination signal), then stop the
    /// worker and disconnect. `wait_for_stop` is a parameter rather than a
    /// hardcoded call to [`crate::signals::wait_for_termination`] so tests can
    /// drive shutdown deterministically.
    pub fn run(&self, sink: Arc<dyn TimeSeriesSink>, wait_for_stop: impl FnOnce()) -> crate::error::Result<()> {
        {
            let guard = self.device.lock();
            guard.borrow_mut().connect()?;
        }

        let worker = {
            let device = Arc::clone(&self.device);
            let cancel = self.cancel.clone();
            let period = self.poll_config.period;
            let channels = self.poll_config.channels.clone();
            std::thread::Builder::new()
                .name("poll-worker".to_string())
                .spawn(move || poll_loop(device, cancel, period, channels, sink))
                .expect("spawning poll worker")
        };

        wait_for_stop();

        info!("termination requested, stopping workers");
        self.cancel.cancel();
        worker.join().expect("joining poll worker");

        let guard = self.device.lock();
        guard.borrow_mut().disconnect();
        Ok(())
    }
}

/// Compute the first beat strictly after `now`, given a period.
fn initial_beat(now: Duration, period: Duration) -> Duration {
    let period_secs = period.as_secs().max(1);
    let now_secs = now.as_secs();
    let mut beat_secs = (now_secs / period_secs) * period_secs;
    beat_secs += period_secs;
    Duration::from_secs(beat_secs)
}

fn now_since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO)
}

/// Round a point in time to a whole second per §4.E: round up at or past
/// the half-second mark.
fn round_to_second(ts: SystemTime) -> u64 {
    let since_epoch = ts.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    if since_epoch.subsec_nanos() < 500_000_000 {
        since_epoch.as_secs()
    } else {
        since_epoch.as_secs() + 1
    }
}

fn poll_loop(device: SharedDevice, cancel: Cancel, period: Duration, channels: Vec<usize>, sink: Arc<dyn TimeSeriesSink>) {
    let mut beat = initial_beat(now_since_epoch(), period);

    while !cancel.is_cancelled() {
        let deadline_instant = instant_for_epoch_duration(beat);
        cancel.wait_until(deadline_instant);
        if cancel.is_cancelled() {
            break;
        }

        match poll_once(&device, &cancel, &channels) {
            BeatOutcome::Sample(timestamp, values) => {
                if let Err(e) = sink.append(timestamp, &values) {
                    warn!("time-series sink append failed: {e}");
                }
            }
            BeatOutcome::Skipped => {
                debug!("beat skipped, worker stays alive");
            }
            BeatOutcome::Cancelled => {
                debug!("beat interrupted by cancellation");
                break;
            }
        }

        let mut next = beat + period;
        let now = now_since_epoch();
        while next <= now {
            warn!("skipped a beat at {next:?}, now is {now:?}");
            next += period;
        }
        beat = next;
    }
    debug!("poll worker exiting");
}

/// Outcome of one beat. A [`BeatOutcome::Skipped`] beat is not fatal: the
/// worker stays alive and tries again at the next beat. Only
/// [`BeatOutcome::Cancelled`] tells `poll_loop` to stop.
enum BeatOutcome {
    Sample(u64, Vec<u32>),
    Skipped,
    Cancelled,
}

/// One beat's worth of work: acquire the lock, call `update_volatile`,
/// recover from transport loss if needed, copy out the requested channels,
/// release the lock. A non-transport-loss error (a `Protocol` error such as
/// desync, truncation, or an exception reply) just skips this beat; the
/// worker is only told to stop if cancellation interrupted recovery.
fn poll_once(device: &SharedDevice, cancel: &Cancel, channels: &[usize]) -> BeatOutcome {
    let guard = device.lock();
    let mut dev = guard.borrow_mut();

    if let Err(e) = dev.update_volatile() {
        if !e.is_transport_loss() {
            warn!("update_volatile failed: {e}, skipping this beat");
            return BeatOutcome::Skipped;
        }
        if cancel.is_cancelled() {
            return BeatOutcome::Cancelled;
        }
        warn!("transport lost ({e}), reconnecting");
        dev.disconnect();
        loop {
            if cancel.is_cancelled() {
                return BeatOutcome::Cancelled;
            }
            match dev.connect() {
                Ok(()) => break,
                Err(e) => {
                    debug!("reconnect attempt failed: {e}");
                }
            }
        }
        if let Err(e) = dev.update_volatile() {
            warn!("update_volatile failed after reconnect: {e}, skipping this beat");
            return BeatOutcome::Skipped;
        }
    }

    let Some(last_update) = dev.last_update() else {
        warn!("update_volatile succeeded but left no timestamp, skipping this beat");
        return BeatOutcome::Skipped;
    };
    let timestamp = round_to_second(last_update);
    let values: Vec<u32> = channels
        .iter()
        .map(|&i| dev.channel(i).unwrap_or(0))
        .collect();
    BeatOutcome::Sample(timestamp, values)
}

fn instant_for_epoch_duration(target: Duration) -> std::time::Instant {
    let now_epoch = now_since_epoch();
    let now_instant = std::time::Instant::now();
    if target > now_epoch {
        now_instant + (target - now_epoch)
    } else {
        now_instant
    }
}
