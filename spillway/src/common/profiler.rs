//! CPU profiler

use std::time::Duration;

#[cfg(miri)]
pub use std::time::Instant;

#[cfg(not(miri))]
pub use quanta::Instant;

/// Guard for profiling. When the guard goes out of scope, its elapsed time is added
/// into the `accumulation`
#[derive(Debug)]
pub struct ScopedTimerGuard<'a> {
    now: Instant,
    accumulation: &'a mut Duration,
}

impl<'a> ScopedTimerGuard<'a> {
    /// Create a new guard
    #[inline]
    pub fn new(accumulation: &'a mut Duration) -> Self {
        Self {
            now: Instant::now(),
            accumulation,
        }
    }
}

impl Drop for ScopedTimerGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        *self.accumulation += self.now.elapsed();
    }
}

/// Run the closure and return its output with the time it takes
#[inline]
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let mut elapsed = Duration::ZERO;
    let output = {
        let _guard = ScopedTimerGuard::new(&mut elapsed);
        f()
    };
    (output, elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_timer_accumulates() {
        let mut total = Duration::from_nanos(5);
        {
            let _guard = ScopedTimerGuard::new(&mut total);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(total >= Duration::from_millis(1));

        let (value, elapsed) = timed(|| 42);
        assert_eq!(value, 42);
        assert!(elapsed < Duration::from_secs(1));
    }
}
