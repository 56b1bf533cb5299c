//! Latency tracing for dials, frame decoding and switch steps.
//!
//! Compiled to plain pass-throughs unless the `timings` feature is on.
//! Durations come from tokio's clock so they agree with paused-time tests.

use std::future::Future;

#[cfg(feature = "timings")]
mod stopwatch {
    use tokio::time::Instant;

    /// Emits one `timings` event when dropped, including on early exit.
    pub(super) struct Stopwatch {
        label: &'static str,
        started: Instant,
    }

    impl Stopwatch {
        pub(super) fn start(label: &'static str) -> Self {
            Self {
                label,
                started: Instant::now(),
            }
        }
    }

    impl Drop for Stopwatch {
        fn drop(&mut self) {
            let elapsed = self.started.elapsed();
            tracing::info!(
                target: "timings",
                label = self.label,
                elapsed_us = elapsed.as_micros() as u64,
                "elapsed"
            );
        }
    }
}

#[cfg(feature = "timings")]
pub(crate) fn time_block<T, F>(label: &'static str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _watch = stopwatch::Stopwatch::start(label);
    f()
}

#[cfg(not(feature = "timings"))]
pub(crate) fn time_block<T, F>(_label: &'static str, f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}

#[cfg(feature = "timings")]
pub(crate) async fn time_async_block<T, Fut>(label: &'static str, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let _watch = stopwatch::Stopwatch::start(label);
    fut.await
}

#[cfg(not(feature = "timings"))]
pub(crate) async fn time_async_block<T, Fut>(_label: &'static str, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    fut.await
}
