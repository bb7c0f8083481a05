use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument};

use super::AlertRecord;

/// POSTs alert records to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
        }
    }

    /// Deliver one alert; failures are logged and reported as `false`
    #[instrument(skip(self, record), fields(sensor = %record.sensor, level = %record.level))]
    pub async fn send(&self, record: &AlertRecord) -> bool {
        let payload = json!({
            "message": record.message,
            "alert": record,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("delivered alert webhook");
                true
            }
            Ok(response) => {
                error!("alert webhook failed with status: {}", response.status());
                false
            }
            Err(e) => {
                error!("failed to send alert webhook: {e}");
                false
            }
        }
    }
}
