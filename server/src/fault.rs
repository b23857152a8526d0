//! Fault Governor: a process-wide failure counter.
//!
//! Any subsystem records failures here; any success resets the count. Once the
//! count exceeds the threshold the fatal action runs and, in production, the
//! process exits. There is no way back from that point.

use std::fmt::Display;
use std::sync::Mutex;

type FatalAction = Box<dyn Fn(u32) + Send + Sync>;

pub struct FaultGovernor {
    threshold: u32,
    count: Mutex<u32>,
    on_fatal: FatalAction,
}

impl FaultGovernor {
    /// Governor whose fatal action logs a final line and exits with status 1.
    pub fn new(threshold: u32) -> Self {
        Self::with_fatal_action(
            threshold,
            Box::new(|count| {
                tracing::error!(count, "Fault threshold exceeded, shutting down");
                std::process::exit(1);
            }),
        )
    }

    /// Governor with a custom fatal action (used by tests).
    pub fn with_fatal_action(threshold: u32, on_fatal: FatalAction) -> Self {
        Self {
            threshold,
            count: Mutex::new(0),
            on_fatal,
        }
    }

    /// Record one failure. Runs the fatal action when the count passes the threshold.
    pub fn record_failure(&self, err: &dyn Display) {
        let count = {
            let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
            *count += 1;
            *count
        };

        tracing::error!(count, threshold = self.threshold, "Recorded failure: {}", err);

        if count > self.threshold {
            (self.on_fatal)(count);
        }
    }

    /// Reset the count after a successful operation.
    pub fn reset(&self) {
        let mut count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        if *count > 0 {
            tracing::info!("Resetting fault count: {} -> 0", *count);
            *count = 0;
        }
    }

    pub fn count(&self) -> u32 {
        *self.count.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl std::fmt::Debug for FaultGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultGovernor")
            .field("threshold", &self.threshold)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
