use std::time::Duration;

use super::{DeliveryError, Task, TaskTarget};

/// Delivers tasks as `PUT {base_url}{target_path}` with the payload as body.
///
/// Any non-2xx response counts as a failed delivery.
pub struct HttpTarget {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTarget {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DeliveryError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DeliveryError::Transport {
                path: base_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn url_for(&self, task: &Task) -> String {
        format!("{}{}", self.base_url, task.target_path)
    }
}

impl TaskTarget for HttpTarget {
    fn deliver(&self, task: &Task) -> Result<(), DeliveryError> {
        let url = self.url_for(task);
        let response = self
            .client
            .put(&url)
            .body(task.payload.clone())
            .send()
            .map_err(|e| DeliveryError::Transport {
                path: task.target_path.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(uid = %task.uid, %url, "task callback succeeded");
            Ok(())
        } else {
            let body = response.text().unwrap_or_default();
            Err(DeliveryError::rejected(
                &task.target_path,
                format!("status {}: {}", status, body),
            ))
        }
    }
}
