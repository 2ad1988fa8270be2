use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, UpgradeError};

/// Cooperative cancellation flag shared between the dispatcher and workers.
///
/// Workers observe the flag at I/O chunk boundaries; the dispatcher stops
/// handing out new tasks once it is set. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `Cancelled` once the flag is set. Call at chunk boundaries.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UpgradeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wall-clock budget for a single codec operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.limit
    }

    /// Returns `DeltaTimeout` once the budget is spent.
    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(UpgradeError::DeltaTimeout {
                limit_secs: self.limit.as_secs(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_clear() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(t.checkpoint().is_ok());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let t = CancelToken::new();
        let c = t.clone();
        t.cancel();
        assert!(c.is_cancelled());
        assert!(matches!(c.checkpoint(), Err(UpgradeError::Cancelled)));
    }

    #[test]
    fn deadline_expires() {
        let d = Deadline::after(Duration::from_millis(0));
        assert!(d.expired());
        assert!(matches!(
            d.check(),
            Err(UpgradeError::DeltaTimeout { .. })
        ));
    }

    #[test]
    fn deadline_with_headroom_passes() {
        let d = Deadline::after(Duration::from_secs(3600));
        assert!(d.check().is_ok());
    }
}
