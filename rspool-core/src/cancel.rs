//! Cooperative cancellation for long-running integrations and samplers.

use crate::errors::{PoolError, PoolResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable flag checked between solver steps and sampler iterations.
///
/// Clones share the same flag, so one clone can cancel work running on
/// another thread. An optional deadline cancels automatically once passed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that reports cancellation once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Return [`PoolError::Cancelled`] if cancellation has been requested.
    pub fn check(&self, context: &str) -> PoolResult<()> {
        if self.is_cancelled() {
            log::debug!("Cancellation observed during {}", context);
            return Err(PoolError::Cancelled(context.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(token.check("test").is_ok());

        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(
            token.check("integration"),
            Err(PoolError::Cancelled("integration".to_string()))
        );
    }

    #[test]
    fn expired_deadline_cancels() {
        let token = CancellationToken::with_timeout(Duration::from_secs(0));
        assert!(token.is_cancelled());

        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }
}
