use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadlines shared by every stage of one pass. Shutdown is handled
/// between passes, a started pass runs to completion or to its deadline.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pass_deadline: Instant,
    stage_timeout: Duration,
}

impl ReconcileContext {
    pub fn new(pass_timeout: Duration, stage_timeout: Duration) -> Self {
        ReconcileContext {
            pass_deadline: Instant::now() + pass_timeout,
            stage_timeout,
        }
    }

    pub fn pass_deadline(&self) -> Instant {
        self.pass_deadline
    }

    /// Deadline of a stage starting now, never later than the pass.
    pub fn stage_deadline(&self) -> Instant {
        (Instant::now() + self.stage_timeout).min(self.pass_deadline)
    }

    pub fn pass_expired(&self) -> bool {
        Instant::now() >= self.pass_deadline
    }
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self::new(DEFAULT_PASS_TIMEOUT, DEFAULT_STAGE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stage_deadline_is_capped_by_pass() {
        let ctx = ReconcileContext::new(Duration::from_secs(7), Duration::from_secs(5));
        let start = Instant::now();
        assert_eq!(start + Duration::from_secs(5), ctx.stage_deadline());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(ctx.pass_deadline(), ctx.stage_deadline());
        assert!(!ctx.pass_expired());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(ctx.pass_expired());
    }
}
