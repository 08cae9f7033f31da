//! Platform-wide default values.
//!
//! These mirror the knobs a user can override in the config file. Keeping
//! them in one module avoids re-declaring the same constants in every
//! crate that needs a fallback.

/// Default values shared across the platform.
pub mod defaults {
    /// Seconds a full `open` operation is expected to take. The
    /// optimistic-completion timer uses this; closing never does.
    pub const OPERATION_TIME_SECS: u64 = 15;

    /// Poll interval for locally connected devices, in seconds.
    pub const REFRESH_RATE_SECS: u64 = 5;

    /// Poll interval for cloud connected devices, in seconds. Polling the
    /// cloud aggressively gets accounts rate limited, so this is long and
    /// push notifications carry the slack.
    pub const CLOUD_REFRESH_RATE_SECS: u64 = 300;

    /// Minimum spacing between command-queue unit starts, in milliseconds.
    pub const QUEUE_INTERVAL_MS: u64 = 250;

    /// Hard bound on a single command-queue unit, in milliseconds.
    pub const QUEUE_TIMEOUT_MS: u64 = 10_000;

    /// Quiet window after a self-issued push command during which push
    /// notifications are ignored, in milliseconds.
    pub const IGNORE_WINDOW_MS: u64 = 3_000;

    /// Delay before reverting the user-visible target after a failed
    /// command, in milliseconds.
    pub const REVERT_DELAY_MS: u64 = 2_000;

    /// Backoff between retries of transient cloud HTTP failures, in seconds.
    pub const HTTP_RETRY_BACKOFF_SECS: u64 = 30;
}

#[cfg(test)]
mod tests {
    use super::defaults;

    #[test]
    fn test_queue_defaults_sane() {
        // The interval gate must be far below the unit timeout or the
        // queue could never make progress.
        assert!(defaults::QUEUE_INTERVAL_MS < defaults::QUEUE_TIMEOUT_MS);
    }
}
