//! Run-wide policy consulted by step bodies before they touch the network or
//! do real work.
//!
//! The flags are fixed when the [`ExecutionMode`] is built and only read
//! afterwards; the graph executor itself never looks at them.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ModeError;

#[derive(Debug, Default)]
pub struct ExecutionMode {
    offline: bool,
    cache_only: bool,
    /// Set by the first cache-only violation.
    reported: AtomicBool,
}

impl ExecutionMode {
    pub fn new(offline: bool, cache_only: bool) -> Self {
        Self {
            offline,
            cache_only,
            reported: AtomicBool::new(false),
        }
    }

    pub fn offline(&self) -> bool {
        self.offline
    }

    pub fn cache_only(&self) -> bool {
        self.cache_only
    }

    /// Fails if network access is forbidden. `action` describes what the
    /// caller was about to do, e.g. `"download https://..."`.
    pub fn assert_online(&self, action: impl Into<String>) -> Result<(), ModeError> {
        if self.offline {
            let action = action.into();
            tracing::error!("offline mode forbids: {action}");
            return Err(ModeError::Offline { action });
        }

        Ok(())
    }

    /// Fails if only cached results may be used. The first violation of a run
    /// flushes the standard streams so that whatever was logged up to this
    /// point is visible before the run aborts.
    pub fn assert_not_cache_only(&self, task: impl Into<String>) -> Result<(), ModeError> {
        if self.cache_only {
            let task = task.into();
            tracing::error!("cache-only mode, but '{task}' needs to be rebuilt");

            if !self.reported.swap(true, Ordering::SeqCst) {
                let _ = std::io::stdout().flush();
                let _ = std::io::stderr().flush();
            }

            return Err(ModeError::CacheOnly { task });
        }

        Ok(())
    }
}

impl Clone for ExecutionMode {
    fn clone(&self) -> Self {
        Self::new(self.offline, self.cache_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_everything() {
        let mode = ExecutionMode::default();
        assert!(mode.assert_online("download x").is_ok());
        assert!(mode.assert_not_cache_only("strip").is_ok());
    }

    #[test]
    fn test_offline_blocks_network_only() {
        let mode = ExecutionMode::new(true, false);
        assert_eq!(
            mode.assert_online("download x"),
            Err(ModeError::Offline {
                action: "download x".into()
            })
        );
        assert!(mode.assert_not_cache_only("strip").is_ok());
    }

    #[test]
    fn test_cache_only_blocks_work_repeatedly() {
        let mode = ExecutionMode::new(false, true);
        assert!(mode.assert_online("download x").is_ok());

        for _ in 0..2 {
            assert_eq!(
                mode.assert_not_cache_only("strip"),
                Err(ModeError::CacheOnly {
                    task: "strip".into()
                })
            );
        }
        assert!(mode.reported.load(Ordering::SeqCst));
    }
}
