pub mod forge;
pub mod kobold;
pub mod kokoro;
pub mod traits;

pub use forge::ForgeClient;
pub use kobold::KoboldClient;
pub use kokoro::KokoroClient;
pub use traits::{
    ChatContext, ChatTurn, ImageBackend, ImageOutput, Role, SpeechBackend, TextBackend,
};

use crate::util::error_excerpt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// POST a JSON body and return the raw response bytes, failing on non-2xx.
pub(crate) async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    backend: &str,
    url: &str,
    body: &T,
) -> anyhow::Result<Vec<u8>> {
    tracing::debug!(backend, url, "POST");
    let response = client.post(url).json(body).send().await.map_err(|e| {
        anyhow::anyhow!("{backend} request to {url} failed: {e}")
    })?;
    let status = response.status();
    let body = response.bytes().await?;
    tracing::debug!(backend, %status, bytes = body.len(), "response");

    if !status.is_success() {
        let excerpt = error_excerpt(&String::from_utf8_lossy(&body));
        tracing::error!(backend, %status, body_excerpt = %excerpt, "error response");
        anyhow::bail!("{backend} API error ({status}): {excerpt}");
    }
    Ok(body.to_vec())
}

/// Decode a JSON body, logging an excerpt when it does not match.
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    backend: &str,
    body: &[u8],
) -> anyhow::Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        let excerpt = error_excerpt(&String::from_utf8_lossy(body));
        tracing::error!(backend, body_excerpt = %excerpt, "response deserialization failed: {e}");
        anyhow::anyhow!("Failed to parse {backend} response: {e}")
    })
}
