//! Inserts notification rows through the backend's REST endpoint.

use async_trait::async_trait;
use log::debug;

use crate::calls::{NotificationRecord, NotificationRecorder};
use crate::config::BackendConfig;

const NOTIFICATIONS_PATH: &str = "/rest/v1/notifications";

/// `ureq` is blocking, so every insert runs on `spawn_blocking`.
#[derive(Clone)]
pub struct RestNotificationRecorder {
    endpoint: String,
    api_key: String,
    agent: ureq::Agent,
}

impl RestNotificationRecorder {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            endpoint: format!("{}{NOTIFICATIONS_PATH}", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.api_key.clone()),
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("Content-Type", "application/json".to_string()),
            ("Prefer", "return=minimal".to_string()),
        ]
    }
}

#[async_trait]
impl NotificationRecorder for RestNotificationRecorder {
    async fn record(&self, record: NotificationRecord) -> Result<(), anyhow::Error> {
        let body = serde_json::to_vec(&record)?;
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let headers = self.headers();

        let status = tokio::task::spawn_blocking(move || -> Result<u16, anyhow::Error> {
            let mut req = agent.post(&endpoint);
            for (key, value) in &headers {
                req = req.header(*key, value);
            }
            let response = req.send(&body[..])?;
            Ok(response.status().as_u16())
        })
        .await??;

        debug!(
            target: "Store/Rest",
            "Inserted {} notification for {} ({status})",
            record.kind.as_str(),
            record.user_id
        );
        Ok(())
    }
}
