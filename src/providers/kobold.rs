use crate::config::{join_url, TextGenerationConfig};
use crate::providers::traits::{ChatContext, Role, TextBackend};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

const GENERATE_PATH: &str = "/api/v1/generate";
const INTERROGATE_PATH: &str = "/sdapi/v1/interrogate";
const BACKEND: &str = "koboldcpp";

const TURN_START: &str = "<start_of_turn>";
const TURN_END: &str = "<end_of_turn>";

/// KoboldCpp text generation plus its CLIP interrogation endpoint.
pub struct KoboldClient {
    base_url: String,
    sampling: TextGenerationConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_length: u32,
    temperature: f64,
    top_p: f64,
    top_k: u32,
    min_p: f64,
    rep_pen: f64,
    quiet: bool,
    stop_sequence: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    results: Vec<GenerateResult>,
}

#[derive(Debug, Deserialize)]
struct GenerateResult {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct InterrogateRequest<'a> {
    image: &'a str,
    model: &'static str,
}

#[derive(Debug, Deserialize)]
struct InterrogateResponse {
    caption: Option<String>,
}

impl KoboldClient {
    pub fn new(base_url: &str, sampling: TextGenerationConfig, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            sampling,
            client: super::http_client(timeout),
        }
    }
}

/// Render the context into Gemma's turn-marker chat template.
///
/// Gemma has no system role, so persona and side information open the
/// first user turn. The prompt ends with an open model turn.
pub fn render_prompt(context: &ChatContext) -> String {
    let mut system = context.persona.trim().to_string();
    let mut section = |label: &str, value: Option<&String>| {
        if let Some(value) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            let _ = write!(system, "{label}: {value}");
        }
    };
    section("About the user", context.profile.as_ref());
    section("The user attached an image showing", context.image_description.as_ref());
    section("Current date and time", context.current_time.as_ref());

    let mut prompt = String::new();
    if !system.is_empty() {
        let _ = write!(prompt, "{TURN_START}user\n{system}{TURN_END}\n");
    }
    for turn in &context.history {
        let (role, text) = match turn.role {
            Role::User if turn.speaker.is_empty() => ("user", turn.text.clone()),
            Role::User => ("user", format!("{}: {}", turn.speaker, turn.text)),
            Role::Assistant => ("model", turn.text.clone()),
        };
        let _ = write!(prompt, "{TURN_START}{role}\n{}{TURN_END}\n", text.trim());
    }
    prompt.push_str(TURN_START);
    prompt.push_str("model\n");
    prompt
}

/// Drop template markers the model sometimes echoes back.
fn clean_reply(text: &str) -> String {
    let cut = text.find(TURN_END).map_or(text, |idx| &text[..idx]);
    cut.replace(TURN_START, "").trim().to_string()
}

#[async_trait]
impl TextBackend for KoboldClient {
    async fn generate(&self, context: &ChatContext) -> anyhow::Result<String> {
        let prompt = render_prompt(context);
        let request = GenerateRequest {
            prompt: &prompt,
            max_length: self.sampling.max_length,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            top_k: self.sampling.top_k,
            min_p: 0.0,
            rep_pen: self.sampling.rep_pen,
            quiet: true,
            stop_sequence: [TURN_END],
        };
        tracing::debug!(
            turns = context.history.len(),
            prompt_chars = prompt.len(),
            "text generation request"
        );

        let url = join_url(&self.base_url, GENERATE_PATH);
        let body = super::post_json(&self.client, BACKEND, &url, &request).await?;
        let response: GenerateResponse = super::decode_json(BACKEND, &body)?;

        let Some(first) = response.results.first() else {
            anyhow::bail!("KoboldCpp returned no results");
        };
        let reply = clean_reply(&first.text);
        if reply.is_empty() {
            anyhow::bail!("KoboldCpp returned an empty reply");
        }
        Ok(reply)
    }

    async fn describe_image(&self, image: &[u8]) -> anyhow::Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let request = InterrogateRequest {
            image: &encoded,
            model: "clip",
        };

        let url = join_url(&self.base_url, INTERROGATE_PATH);
        let body = super::post_json(&self.client, BACKEND, &url, &request).await?;
        let response: InterrogateResponse = super::decode_json(BACKEND, &body)?;

        response
            .caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("interrogation returned no caption"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::ChatTurn;

    #[test]
    fn prompt_opens_with_persona_and_ends_with_model_turn() {
        let context = ChatContext {
            persona: "You are Gemma, a cheerful painter.".into(),
            profile: Some("Likes foxes".into()),
            image_description: None,
            current_time: Some("Saturday, 18 October 2026 14:05".into()),
            history: vec![
                ChatTurn::user("mika", "hi gemma"),
                ChatTurn::assistant("Hello!"),
                ChatTurn::user("mika", "what time is it?"),
            ],
        };
        let prompt = render_prompt(&context);

        assert!(prompt.starts_with("<start_of_turn>user\nYou are Gemma, a cheerful painter."));
        assert!(prompt.contains("About the user: Likes foxes"));
        assert!(prompt.contains("Current date and time: Saturday"));
        assert!(!prompt.contains("attached an image"));
        assert!(prompt.contains("<start_of_turn>user\nmika: hi gemma<end_of_turn>\n"));
        assert!(prompt.contains("<start_of_turn>model\nHello!<end_of_turn>\n"));
        assert!(prompt.ends_with("mika: what time is it?<end_of_turn>\n<start_of_turn>model\n"));
    }

    #[test]
    fn empty_persona_skips_system_block() {
        let context = ChatContext {
            history: vec![ChatTurn::user("", "hello")],
            ..ChatContext::default()
        };
        assert_eq!(
            render_prompt(&context),
            "<start_of_turn>user\nhello<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn reply_is_cut_at_turn_end() {
        assert_eq!(clean_reply("  Hi there!<end_of_turn>\n<start_of_turn>user"), "Hi there!");
        assert_eq!(clean_reply("plain"), "plain");
    }
}
