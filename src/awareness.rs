// Node health awareness
//
// Tracks how healthy the local node believes itself to be. Missed acks and
// nacks from indirect probes raise the score; successful probes lower it.
// Probe deadlines are stretched by the score so a degraded node (GC pause,
// CPU starvation, lossy link) does not flood the cluster with false
// suspicions.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::time::Duration;

pub struct Awareness {
    /// Exclusive upper bound for the health score
    max: isize,
    /// 0 means healthy; higher values stretch timeouts
    score: AtomicIsize,
}

impl Awareness {
    pub fn new(max: u8) -> Self {
        Self {
            max: max.max(1) as isize,
            score: AtomicIsize::new(0),
        }
    }

    /// Apply a delta to the health score, clamped to `[0, max)`.
    pub fn apply_delta(&self, delta: isize) {
        let mut current = self.score.load(Ordering::Relaxed);
        loop {
            let next = (current + delta).clamp(0, self.max - 1);
            match self.score.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn score(&self) -> isize {
        self.score.load(Ordering::Relaxed)
    }

    /// Scale a probe deadline by the current health score.
    pub fn scale(&self, timeout: Duration) -> Duration {
        timeout * (self.score() as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_clamping() {
        let awareness = Awareness::new(8);
        assert_eq!(awareness.score(), 0);

        awareness.apply_delta(-5);
        assert_eq!(awareness.score(), 0);

        awareness.apply_delta(100);
        assert_eq!(awareness.score(), 7);

        awareness.apply_delta(-1);
        assert_eq!(awareness.score(), 6);
    }

    #[test]
    fn test_timeout_scaling() {
        let awareness = Awareness::new(8);
        let base = Duration::from_millis(500);
        assert_eq!(awareness.scale(base), base);

        awareness.apply_delta(2);
        assert_eq!(awareness.scale(base), Duration::from_millis(1500));
    }
}
