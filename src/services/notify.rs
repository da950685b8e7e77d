// src/services/notify.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPath {
    /// Both accumulators reached the planned quantity.
    Quantity,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    WorkOrderCompleted {
        workorder_id: i64,
        order_number: String,
        path: CompletionPath,
        tipping_report_id: Option<i64>,
        completed_at: DateTime<Utc>,
    },
    InconsistencyAlert {
        workorder_id: i64,
        q_proc: i64,
        q_fill: i64,
        streak: i32,
    },
    TaskOverrun {
        task: String,
        interval_minutes: i64,
        elapsed_ms: i64,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkOrderCompleted { .. } => "workorder_completed",
            Self::InconsistencyAlert { .. } => "inconsistency_alert",
            Self::TaskOverrun { .. } => "task_overrun",
        }
    }
}

/// Outbound event sink. Delivery is best-effort: failures are logged by the implementation and
/// never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CoreEvent);

    fn channel_name(&self) -> &str;
}

/// Writes events to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &CoreEvent) {
        match event {
            CoreEvent::InconsistencyAlert { workorder_id, q_proc, q_fill, streak } => {
                tracing::error!(workorder_id, q_proc, q_fill, streak, "inconsistency alert");
            }
            CoreEvent::TaskOverrun { task, elapsed_ms, .. } => {
                tracing::error!(task = %task, elapsed_ms, "periodic task overran");
            }
            CoreEvent::WorkOrderCompleted { workorder_id, path, .. } => {
                tracing::info!(workorder_id, path = ?path, "work-order completed");
            }
        }
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

const WEBHOOK_ATTEMPTS: u32 = 3;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each event as JSON, retrying a bounded number of times.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &CoreEvent) {
        let mut last_err = None;
        for attempt in 1..=WEBHOOK_ATTEMPTS {
            match self.client.post(&self.url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(event = event.name(), attempt, "webhook delivered");
                    return;
                }
                Ok(resp) => last_err = Some(format!("HTTP {}", resp.status())),
                Err(err) => last_err = Some(err.to_string()),
            }
            if attempt < WEBHOOK_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
        }
        tracing::warn!(
            event = event.name(),
            url = %self.url,
            error = last_err.as_deref().unwrap_or("unknown"),
            "webhook delivery failed"
        );
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}

/// Picks the webhook when a URL is configured.
pub fn from_config(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url {
        Some(url) if !url.trim().is_empty() => Box::new(WebhookNotifier::new(url.trim())),
        _ => Box::new(LogNotifier),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_tag() {
        let event = CoreEvent::InconsistencyAlert {
            workorder_id: 7,
            q_proc: 120,
            q_fill: 60,
            streak: 3,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "inconsistency_alert");
        assert_eq!(json["q_proc"], 120);
        assert_eq!(event.name(), "inconsistency_alert");
    }

    #[test]
    fn webhook_is_chosen_only_for_a_non_blank_url() {
        assert_eq!(from_config(None).channel_name(), "log");
        assert_eq!(from_config(Some("  ")).channel_name(), "log");
        assert_eq!(
            from_config(Some("http://hooks.local/mes")).channel_name(),
            "webhook"
        );
    }

    #[tokio::test]
    async fn unreachable_webhook_never_panics() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/unreachable");
        notifier
            .notify(&CoreEvent::TaskOverrun {
                task: "completion_trigger_task".into(),
                interval_minutes: 5,
                elapsed_ms: 600_000,
            })
            .await;
    }
}
