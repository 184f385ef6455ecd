//! Outbound message sending and global pacing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ChannelError;

/// Provider confirmation for one sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub provider_message_id: String,
}

/// Sends a text message to a phone number.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, identity: &str, text: &str) -> Result<SendReceipt, ChannelError>;
}

/// Wraps a sender with a global minimum interval between sends and a
/// per-send timeout. Shared by every campaign and by inbound replies.
pub struct PacedSender {
    inner: Arc<dyn MessageSender>,
    min_interval: Duration,
    send_timeout: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PacedSender {
    pub fn new(inner: Arc<dyn MessageSender>, min_interval: Duration, send_timeout: Duration) -> Self {
        Self {
            inner,
            min_interval,
            send_timeout,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller owns the next send slot.
    async fn wait_for_slot(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_slot = Some(start + self.min_interval);
        drop(next_slot);

        if start > now {
            debug!(wait_ms = (start - now).as_millis() as u64, "Pacing outbound send");
            tokio::time::sleep_until(start).await;
        }
    }
}

#[async_trait]
impl MessageSender for PacedSender {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, identity: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        self.wait_for_slot().await;
        match tokio::time::timeout(self.send_timeout, self.inner.send(identity, text)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                name: self.inner.name().to_string(),
                timeout: self.send_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender {
        sent: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl MessageSender for CountingSender {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _identity: &str, _text: &str) -> Result<SendReceipt, ChannelError> {
            tokio::time::sleep(self.delay).await;
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(SendReceipt {
                provider_message_id: format!("msg-{n}"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_min_interval_across_callers() {
        let inner = Arc::new(CountingSender {
            sent: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let paced = Arc::new(PacedSender::new(
            inner.clone(),
            Duration::from_millis(100),
            Duration::from_secs(5),
        ));

        let start = Instant::now();
        let mut handles = Vec::new();
        for i in 0..5 {
            let paced = Arc::clone(&paced);
            handles.push(tokio::spawn(async move {
                paced.send(&format!("55119999900{i:02}"), "hi").await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        assert_eq!(inner.sent.load(Ordering::SeqCst), 5);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_send() {
        let inner = Arc::new(CountingSender {
            sent: AtomicUsize::new(0),
            delay: Duration::from_secs(60),
        });
        let paced = PacedSender::new(inner, Duration::ZERO, Duration::from_secs(2));
        let err = paced.send("5511999990000", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }
}
