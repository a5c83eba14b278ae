//! Outbound alert delivery.
//!
//! The downstream channel (push/WebSocket gateway) is an external
//! collaborator; this module only defines the seam and the bounded
//! retry-then-drop delivery policy. There is no persistent alert queue: a
//! fire that exhausts its retries is logged as failed and dropped.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Error;
use crate::model::AlertFire;

/// Delivery channel for fired alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, fire: &AlertFire) -> anyhow::Result<()>;
}

/// Delivers fires as JSON POSTs to a downstream webhook, with a per-attempt
/// request timeout.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, fire: &AlertFire) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(fire)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Fallback channel when no webhook is configured: fires are logged only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, fire: &AlertFire) -> anyhow::Result<()> {
        info!(
            subscription_id = fire.subscription_id,
            unit_id = %fire.unit_id,
            fired_at = fire.fired_at,
            "Alert fired (no webhook configured)"
        );
        Ok(())
    }
}

/// Attempt delivery up to `attempts` times with exponential backoff.
///
/// On exhaustion the fire is dropped and surfaced as
/// [`Error::DeliveryFailed`] for the caller to log.
pub async fn deliver_with_retry(
    notifier: &dyn Notifier,
    fire: &AlertFire,
    attempts: u32,
) -> Result<(), Error> {
    for attempt in 0..attempts.max(1) {
        match notifier.deliver(fire).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    subscription_id = fire.subscription_id,
                    attempt,
                    error = %e,
                    "Alert delivery attempt failed"
                );
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(100u64 << attempt.min(6))).await;
                }
            }
        }
    }

    Err(Error::DeliveryFailed {
        subscription_id: fire.subscription_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyNotifier {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, _fire: &AlertFire) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    fn fire() -> AlertFire {
        AlertFire {
            subscription_id: 7,
            unit_id: "u1".to_string(),
            fired_at: 1000,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let notifier = FlakyNotifier {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };

        deliver_with_retry(&notifier, &fire(), 3).await.unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_delivery_failed() {
        let notifier = FlakyNotifier {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };

        let result = deliver_with_retry(&notifier, &fire(), 3).await;
        assert!(matches!(
            result,
            Err(Error::DeliveryFailed { subscription_id: 7 })
        ));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_success() {
        let notifier = FlakyNotifier {
            calls: AtomicU32::new(0),
            fail_first: 0,
        };

        deliver_with_retry(&notifier, &fire(), 1).await.unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }
}
