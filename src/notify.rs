use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::types::{EarlyExit, ExitReason, ExitStage};
use crate::market::Timeframe;

const MAX_ATTEMPTS: u32 = 3;

/// Early-exit payload delivered to the webhook transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyExitNotification {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub execution_id: String,
    pub stage: ExitStage,
    pub reason: ExitReason,
    pub user_message: String,
    pub detailed_message: String,
    pub suggestions: Vec<String>,
}

impl EarlyExitNotification {
    pub fn from_exit(
        exit: &EarlyExit,
        symbol: &str,
        timeframe: Timeframe,
        strategy: &str,
        execution_id: &str,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            strategy: strategy.to_string(),
            execution_id: execution_id.to_string(),
            stage: exit.stage,
            reason: exit.reason,
            user_message: exit.user_message.clone(),
            detailed_message: exit.detailed_message.clone(),
            suggestions: exit.suggestions.clone(),
        }
    }
}

/// Best-effort notification capability. Delivery failures are the
/// transport's problem: they are logged and dropped, never surfaced to
/// backtest logic.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_early_exit(&self, notification: &EarlyExitNotification);
}

/// Transport that discards everything; the default when no webhook is
/// configured.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_early_exit(&self, notification: &EarlyExitNotification) {
        debug!(symbol = %notification.symbol, "notification transport disabled");
    }
}

/// Webhook transport with bounded retries.
///
/// Retries use exponential backoff with a little jitter; a 429 honors the
/// server's Retry-After. The jitter lives here and only here; the backtest
/// loop itself observes no randomness.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
        }
    }

    /// Build from `NOTIFY_WEBHOOK_URL`; `None` when unset.
    pub fn from_env() -> Option<Self> {
        std::env::var("NOTIFY_WEBHOOK_URL").ok().map(Self::new)
    }

    async fn attempt(&self, notification: &EarlyExitNotification) -> Result<(), RetryAfter> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(notification)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RetryAfter::Backoff(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(RetryAfter::RateLimited(wait));
        }
        Err(RetryAfter::Backoff(format!("status {status}")))
    }
}

enum RetryAfter {
    RateLimited(u64),
    Backoff(String),
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_early_exit(&self, notification: &EarlyExitNotification) {
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(notification).await {
                Ok(()) => {
                    info!(
                        symbol = %notification.symbol,
                        stage = notification.stage.as_str(),
                        "early-exit notification delivered"
                    );
                    return;
                }
                Err(RetryAfter::RateLimited(wait)) => {
                    warn!(wait, "webhook rate-limited");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                Err(RetryAfter::Backoff(error)) => {
                    if attempt + 1 == MAX_ATTEMPTS {
                        warn!(%error, "webhook delivery failed; dropping notification");
                        return;
                    }
                    let jitter_ms = rand::rng().random_range(0..250);
                    let backoff =
                        Duration::from_secs(1 << attempt) + Duration::from_millis(jitter_ms);
                    warn!(%error, attempt, "webhook delivery failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::EarlyExit;

    #[test]
    fn notification_payload_serializes_with_snake_case_tags() {
        let exit = EarlyExit::new(ExitStage::SupportResistance, ExitReason::NoSupportResistance);
        let n = EarlyExitNotification::from_exit(&exit, "BTC", Timeframe::H1, "Balanced", "exec-1");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["stage"], "support_resistance");
        assert_eq!(json["reason"], "no_support_resistance");
        assert_eq!(json["timeframe"], "1h");
        assert_eq!(json["symbol"], "BTC");
        assert!(json["suggestions"].as_array().is_some());
    }

    #[tokio::test]
    async fn noop_notifier_never_fails() {
        let exit = EarlyExit::new(ExitStage::DataFetch, ExitReason::InsufficientData);
        let n = EarlyExitNotification::from_exit(&exit, "BTC", Timeframe::H1, "Balanced", "exec-1");
        NoopNotifier.notify_early_exit(&n).await;
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook");
        let exit = EarlyExit::new(ExitStage::DataFetch, ExitReason::InsufficientData);
        let n = EarlyExitNotification::from_exit(&exit, "BTC", Timeframe::H1, "Balanced", "exec-1");
        // Must return despite connection failures.
        notifier.notify_early_exit(&n).await;
    }
}
