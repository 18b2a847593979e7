use serde_json::json;
use std::time::Duration;

/// Posts ingestion progress to a chat-channel webhook. A missing webhook or
/// a failed post never fails the surrounding command.
#[derive(Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url,
            client,
        }
    }

    pub async fn load_started(&self, name: &str, version: &str) {
        self.post(&format!("Loading dataset {name}/{version}...")).await;
    }

    pub async fn load_finished(&self, name: &str, version: &str) {
        self.post(&format!("Dataset {name}/{version} is now available."))
            .await;
    }

    pub async fn load_failed(&self, name: &str, version: &str, error: &str) {
        self.post(&format!("Loading dataset {name}/{version} failed: {error}"))
            .await;
    }

    async fn post(&self, text: &str) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("notification (no webhook): {}", text);
            return;
        };
        let result = self
            .client
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!("notified: {}", text);
            }
            Ok(response) => {
                tracing::warn!("notification rejected ({}): {}", response.status(), text);
            }
            Err(e) => {
                tracing::warn!("notification failed ({}): {}", e, text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_webhook_is_silent() {
        let notifier = Notifier::new(None);
        // Must not panic or error
        notifier.load_started("test", "v1").await;
        notifier.load_finished("test", "v1").await;
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_swallowed() {
        let notifier = Notifier::new(Some("http://127.0.0.1:1/webhook".into()));
        notifier.load_failed("test", "v1", "boom").await;
    }
}
