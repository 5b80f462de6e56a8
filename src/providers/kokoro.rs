use crate::config::{join_url, SpeechConfig};
use crate::providers::traits::SpeechBackend;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

const SPEECH_PATH: &str = "/v1/audio/speech";
const BACKEND: &str = "kokoro";

/// Kokoro-FastAPI's OpenAI-compatible speech endpoint.
pub struct KokoroClient {
    base_url: String,
    voice: String,
    max_chars: usize,
    cleaner: SpeechCleaner,
    client: Client,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'static str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    speed: f64,
}

/// Strips chat markup that reads badly aloud.
pub struct SpeechCleaner {
    mentions: Regex,
    wrapped: Vec<Regex>,
    urls: Regex,
}

impl SpeechCleaner {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            mentions: Regex::new(r"<(?:@[!&]?|#)\d+>")?,
            // Order matters: bold before italic.
            wrapped: vec![
                Regex::new(r"\*\*(.*?)\*\*")?,
                Regex::new(r"\*(.*?)\*")?,
                Regex::new(r"__(.*?)__")?,
                Regex::new(r"`(.*?)`")?,
                Regex::new(r"~~(.*?)~~")?,
            ],
            urls: Regex::new(r"https?://\S+")?,
        })
    }

    pub fn clean(&self, text: &str, max_chars: usize) -> String {
        let mut out = self.mentions.replace_all(text, "").into_owned();
        for re in &self.wrapped {
            out = re.replace_all(&out, "$1").into_owned();
        }
        out = self.urls.replace_all(&out, "").into_owned();
        let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.chars().count() > max_chars {
            truncate_with_ellipsis(&collapsed, max_chars.saturating_sub(3))
        } else {
            collapsed
        }
    }
}

impl KokoroClient {
    pub fn new(config: &SpeechConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            voice: config.voice.clone(),
            max_chars: config.max_chars,
            cleaner: SpeechCleaner::new()?,
            client: super::http_client(Duration::from_secs(config.timeout_secs)),
        })
    }
}

#[async_trait]
impl SpeechBackend for KokoroClient {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let input = self.cleaner.clean(text, self.max_chars);
        if input.is_empty() {
            anyhow::bail!("nothing left to speak after cleaning");
        }

        let request = SpeechRequest {
            model: "kokoro",
            input: &input,
            voice: &self.voice,
            response_format: "wav",
            speed: 1.0,
        };
        let url = join_url(&self.base_url, SPEECH_PATH);
        let audio = super::post_json(&self.client, BACKEND, &url, &request).await?;
        if audio.is_empty() {
            anyhow::bail!("Kokoro returned empty audio");
        }
        tracing::debug!(chars = input.chars().count(), bytes = audio.len(), "speech synthesized");
        Ok(audio)
    }
}
