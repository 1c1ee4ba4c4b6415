use std::sync::{Arc, Mutex, PoisonError};

use futures::{stream::BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Coalescing wakeup notifier.
///
/// Any number of `event()` calls made while a wakeup is pending collapse
/// into that single wakeup.
#[derive(Debug, Clone)]
pub struct Signaler {
    tx: mpsc::Sender<()>,
    rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
    closed: CancellationToken,
}

impl Default for Signaler {
    fn default() -> Self {
        Self::new()
    }
}

impl Signaler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Signaler {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            closed: CancellationToken::new(),
        }
    }

    pub fn event(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        // A full slot means a wakeup is already pending.
        let _ = self.tx.try_send(());
    }

    /// The wakeup stream. Only the first caller gets it.
    pub fn events(&self) -> Option<BoxStream<'static, ()>> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let closed = self.closed.clone();
        Some(
            ReceiverStream::new(rx)
                .take_until(async move { closed.cancelled().await })
                .boxed(),
        )
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_coalesce() {
        let s = Signaler::new();
        let mut events = s.events().unwrap();
        for _ in 0..1000 {
            s.event();
        }
        assert_eq!(Some(()), events.next().await);
        let next = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let s = Signaler::new();
        assert!(s.events().is_some());
        assert!(s.clone().events().is_none());
    }

    #[tokio::test]
    async fn test_close_terminates() {
        let s = Signaler::new();
        let mut events = s.events().unwrap();
        s.close();
        s.event();
        assert_eq!(None, events.next().await);
    }
}
