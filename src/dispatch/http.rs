use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use super::{Endpoint, RawResponse};
use crate::config::TARGET_PLACEHOLDER;
use crate::error::{Result, SimError};

/// Delivers records with `POST` to a URL built from a template.
pub struct HttpEndpoint {
    client: Client,
    template: String,
}

impl HttpEndpoint {
    pub fn new(template: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("simdispatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SimError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            template: template.into(),
        })
    }

    pub fn url_for(&self, target: &str) -> String {
        self.template.replace(TARGET_PLACEHOLDER, target)
    }
}

#[async_trait::async_trait]
impl Endpoint for HttpEndpoint {
    async fn deliver(&self, target: &str, body: &Value) -> RawResponse {
        let url = self.url_for(target);
        let response = match self.client.post(&url).json(body).send().await {
            Ok(r) => r,
            Err(e) => {
                return RawResponse::Failed {
                    timed_out: e.is_timeout(),
                    detail: e.to_string(),
                }
            }
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(bytes) => RawResponse::Received {
                status,
                body: bytes.to_vec(),
            },
            Err(e) => RawResponse::Failed {
                timed_out: e.is_timeout(),
                detail: format!("reading body after HTTP {status}: {e}"),
            },
        }
    }
}
