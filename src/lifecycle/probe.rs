use async_trait::async_trait;
use std::time::Duration;

/// Answers "is the backend accepting requests yet?".
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Ready when a GET on the probe URL returns a 2xx status.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .connect_timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    tracing::debug!(url = %self.url, status = %resp.status(), "probe not ready");
                }
                ok
            }
            Err(e) => {
                tracing::debug!(url = %self.url, "probe failed: {e}");
                false
            }
        }
    }
}
