//! Detection throttling, loop pacing and cooperative cancellation.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use surface_track_core::MarkerDetection;

/// True when detection should run at `now`.
///
/// Detection always runs when it never ran before.
#[inline]
pub fn should_run_detection(now: Instant, last_run: Option<Instant>, min_interval: Duration) -> bool {
    match last_run {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= min_interval,
    }
}

/// Detection result of one cycle: camera-frame markers and, when the pose
/// space requires it, markers found on the rectified frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSet {
    pub camera: Vec<MarkerDetection>,
    pub rectified: Vec<MarkerDetection>,
}

/// Gate in front of the expensive detection step.
#[derive(Clone, Debug, Default)]
pub struct DetectionScheduler {
    min_interval: Option<Duration>,
    last_run: Option<Instant>,
    cached: DetectionSet,
}

impl DetectionScheduler {
    /// `None` runs detection on every cycle.
    pub fn new(min_interval: Option<Duration>) -> Self {
        Self {
            min_interval,
            last_run: None,
            cached: DetectionSet::default(),
        }
    }

    #[inline]
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    pub fn should_run(&self, now: Instant) -> bool {
        match self.min_interval {
            None => true,
            Some(interval) => should_run_detection(now, self.last_run, interval),
        }
    }

    /// Record a fresh detection run.
    pub fn record(&mut self, now: Instant, detections: DetectionSet) {
        self.last_run = Some(now);
        self.cached = detections;
    }

    /// Result of the most recent detection run, reused on skipped cycles.
    #[inline]
    pub fn cached(&self) -> &DetectionSet {
        &self.cached
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cloneable cancellation flag that can be fired from any thread.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `deadline` or until the token fires. Returns `true` if cancelled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Outcome of a pacing step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pace {
    Continue,
    Cancelled,
}

/// Paces the loop to a fixed cycle duration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopPacer {
    period: Option<Duration>,
}

impl LoopPacer {
    /// `None` or a non-positive rate disables pacing.
    pub fn from_rate_hz(rate_hz: Option<f64>) -> Self {
        let period = rate_hz
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(|r| Duration::from_secs_f64(1.0 / r));
        Self { period }
    }

    #[inline]
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Wait for the remainder of the cycle that started at `cycle_start`.
    pub fn pace(&self, cycle_start: Instant, cancel: &CancelToken) -> Pace {
        let cancelled = match self.period {
            Some(period) => cancel.wait_until(cycle_start + period),
            None => cancel.is_cancelled(),
        };
        if cancelled {
            Pace::Cancelled
        } else {
            Pace::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_run_is_always_due() {
        let now = Instant::now();
        assert!(should_run_detection(now, None, Duration::from_secs(60)));
    }

    #[test]
    fn interval_gates_detection() {
        let t0 = Instant::now();
        let interval = Duration::from_millis(30);
        assert!(!should_run_detection(t0 + Duration::from_millis(29), Some(t0), interval));
        assert!(should_run_detection(t0 + Duration::from_millis(30), Some(t0), interval));
    }

    #[test]
    fn scheduler_without_interval_always_runs() {
        let mut sched = DetectionScheduler::new(None);
        let t0 = Instant::now();
        sched.record(t0, DetectionSet::default());
        assert!(sched.should_run(t0));
    }

    #[test]
    fn scheduler_caches_last_run() {
        let mut sched = DetectionScheduler::new(Some(Duration::from_millis(100)));
        let t0 = Instant::now();
        assert!(sched.should_run(t0));

        let det = MarkerDetection::new(5, [nalgebra::Point2::new(0.0, 0.0); 4]);
        sched.record(
            t0,
            DetectionSet {
                camera: vec![det],
                rectified: Vec::new(),
            },
        );
        assert!(!sched.should_run(t0 + Duration::from_millis(50)));
        assert_eq!(sched.cached().camera, vec![det]);
    }

    #[test]
    fn pacer_waits_for_period() {
        let pacer = LoopPacer::from_rate_hz(Some(50.0));
        let token = CancelToken::new();
        let start = Instant::now();
        assert_eq!(pacer.pace(start, &token), Pace::Continue);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancellation_wakes_a_waiting_pacer() {
        let pacer = LoopPacer::from_rate_hz(Some(0.1));
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let start = Instant::now();
        assert_eq!(pacer.pace(start, &token), Pace::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn invalid_rates_disable_pacing() {
        assert_eq!(LoopPacer::from_rate_hz(None).period(), None);
        assert_eq!(LoopPacer::from_rate_hz(Some(0.0)).period(), None);
        assert_eq!(LoopPacer::from_rate_hz(Some(-3.0)).period(), None);
    }
}
