use crate::config::{join_url, GenerationConfig};
use crate::prompt::GenerationRequest;
use crate::providers::traits::{ImageBackend, ImageOutput};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const TXT2IMG_PATH: &str = "/sdapi/v1/txt2img";
const BACKEND: &str = "forge";

/// Client for the Forge / A1111 txt2img API.
pub struct ForgeClient {
    base_url: String,
    generation: GenerationConfig,
    client: Client,
}

// ─── Request Structures ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    steps: u32,
    cfg_scale: f64,
    sampler_name: &'a str,
    /// -1 asks the server for a random seed
    seed: i64,
    width: u32,
    height: u32,
    clip_skip: u32,
    override_settings: OverrideSettings<'a>,
    alwayson_scripts: AlwaysOnScripts,
    #[serde(flatten)]
    hires: Option<HiresFields<'a>>,
}

#[derive(Debug, Serialize)]
struct OverrideSettings<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    sd_model_checkpoint: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct AlwaysOnScripts {
    #[serde(rename = "ADetailer", skip_serializing_if = "Option::is_none")]
    adetailer: Option<ScriptArgs>,
}

#[derive(Debug, Serialize)]
struct ScriptArgs {
    args: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct HiresFields<'a> {
    enable_hr: bool,
    hr_upscaler: &'a str,
    hr_scale: f64,
    hr_second_pass_steps: u32,
    denoising_strength: f64,
}

// ─── Response Structures ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
    /// JSON document encoded as a string
    #[serde(default)]
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationInfo {
    seed: Option<i64>,
    #[serde(default)]
    all_seeds: Vec<i64>,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl ForgeClient {
    pub fn new(base_url: &str, generation: GenerationConfig, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            generation,
            client: super::http_client(timeout),
        }
    }

    fn build_payload<'a>(&'a self, request: &'a GenerationRequest) -> Txt2ImgRequest<'a> {
        let cfg = &self.generation;
        let resolution = cfg.resolutions.for_aspect(request.aspect);

        let adetailer = cfg.adetailer.enabled.then(|| ScriptArgs {
            args: vec![serde_json::json!({
                "ad_model": cfg.adetailer.model,
                "ad_prompt": cfg.adetailer.prompt,
                "ad_negative_prompt": cfg.adetailer.negative_prompt,
                "ad_confidence": cfg.adetailer.confidence,
                "ad_mask_blur": cfg.adetailer.mask_blur,
                "ad_denoising_strength": cfg.adetailer.denoising_strength,
                "ad_inpaint_only_masked": cfg.adetailer.inpaint_only_masked,
                "ad_inpaint_padding": cfg.adetailer.inpaint_padding,
                "ad_cfg_scale": cfg.cfg_scale,
                "ad_steps": cfg.steps,
                "ad_sampler": cfg.sampler,
                "ad_clip_skip": 1,
                "ad_checkpoint": "",
                "ad_vae": "",
                "ad_use_inpaint_width_height": false,
                "ad_inpaint_width": resolution.width,
                "ad_inpaint_height": resolution.height,
            })],
        });

        let hires = request.upscale.then(|| HiresFields {
            enable_hr: true,
            hr_upscaler: &cfg.hires.upscaler,
            hr_scale: cfg.hires.upscale_by,
            hr_second_pass_steps: cfg.hires.steps,
            denoising_strength: cfg.hires.denoising_strength,
        });

        Txt2ImgRequest {
            prompt: &request.positive,
            negative_prompt: &request.negative,
            steps: cfg.steps,
            cfg_scale: cfg.cfg_scale,
            sampler_name: &cfg.sampler,
            seed: request
                .seed
                .and_then(|s| i64::try_from(s).ok())
                .unwrap_or(-1),
            width: resolution.width,
            height: resolution.height,
            clip_skip: cfg.clip_skip,
            override_settings: OverrideSettings {
                sd_model_checkpoint: &cfg.model,
            },
            alwayson_scripts: AlwaysOnScripts { adetailer },
            hires,
        }
    }
}

/// Seed the server actually used, from the `info` string.
fn reported_seed(info: Option<&str>) -> Option<u64> {
    let info: GenerationInfo = serde_json::from_str(info?).ok()?;
    info.seed
        .or_else(|| info.all_seeds.first().copied())
        .and_then(|s| u64::try_from(s).ok())
}

fn decode_image(encoded: &str) -> anyhow::Result<Vec<u8>> {
    // Some builds prefix a data URI
    let raw = match encoded.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .context("image is not valid base64")
}

#[async_trait]
impl ImageBackend for ForgeClient {
    async fn txt2img(&self, request: &GenerationRequest) -> anyhow::Result<ImageOutput> {
        let payload = self.build_payload(request);
        tracing::info!(
            aspect = %request.aspect,
            width = payload.width,
            height = payload.height,
            seed = payload.seed,
            upscale = request.upscale,
            "txt2img"
        );
        tracing::debug!(positive = %request.positive, negative = %request.negative, "prompts");

        let url = join_url(&self.base_url, TXT2IMG_PATH);
        let body = super::post_json(&self.client, BACKEND, &url, &payload).await?;
        let response: Txt2ImgResponse = super::decode_json(BACKEND, &body)?;

        let Some(first) = response.images.first() else {
            anyhow::bail!("Forge returned no images");
        };
        let image = decode_image(first)?;
        if image.is_empty() {
            anyhow::bail!("Forge returned an empty image");
        }

        Ok(ImageOutput {
            image,
            seed: reported_seed(response.info.as_deref()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::AspectRatio;

    fn request(aspect: AspectRatio, upscale: bool, seed: Option<u64>) -> GenerationRequest {
        GenerationRequest {
            aspect,
            upscale,
            seed,
            positive: "a cat, masterpiece".into(),
            negative: "blurry".into(),
        }
    }

    fn client() -> ForgeClient {
        ForgeClient::new(
            "http://127.0.0.1:7860/",
            GenerationConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn payload_uses_aspect_resolution_and_random_seed() {
        let client = client();
        let req = request(AspectRatio::Portrait, false, None);
        let json = serde_json::to_value(client.build_payload(&req)).unwrap();

        assert_eq!(json["width"], 1024);
        assert_eq!(json["height"], 1520);
        assert_eq!(json["seed"], -1);
        assert_eq!(json["prompt"], "a cat, masterpiece");
        assert_eq!(json["negative_prompt"], "blurry");
        assert!(json.get("enable_hr").is_none());
    }

    #[test]
    fn payload_adds_hires_fields_when_upscaling() {
        let client = client();
        let req = request(AspectRatio::Landscape, true, Some(42));
        let json = serde_json::to_value(client.build_payload(&req)).unwrap();

        assert_eq!(json["seed"], 42);
        assert_eq!(json["enable_hr"], true);
        assert_eq!(json["hr_upscaler"], GenerationConfig::default().hires.upscaler);
        assert_eq!(json["width"], 1520);
    }

    #[test]
    fn adetailer_script_follows_config() {
        let mut generation = GenerationConfig::default();
        generation.adetailer.enabled = true;
        let client = ForgeClient::new("http://x", generation.clone(), Duration::from_secs(1));
        let req = request(AspectRatio::Square, false, None);
        let json = serde_json::to_value(client.build_payload(&req)).unwrap();
        let args = &json["alwayson_scripts"]["ADetailer"]["args"][0];
        assert_eq!(args["ad_model"], generation.adetailer.model);
        assert_eq!(args["ad_inpaint_width"], 1024);

        generation.adetailer.enabled = false;
        let client = ForgeClient::new("http://x", generation, Duration::from_secs(1));
        let json = serde_json::to_value(client.build_payload(&req)).unwrap();
        assert!(json["alwayson_scripts"].get("ADetailer").is_none());
    }

    #[test]
    fn seed_is_read_from_info() {
        assert_eq!(reported_seed(Some(r#"{"seed": 3141, "all_seeds": [3141]}"#)), Some(3141));
        assert_eq!(reported_seed(Some(r#"{"all_seeds": [77]}"#)), Some(77));
        assert_eq!(reported_seed(Some("not json")), None);
        assert_eq!(reported_seed(None), None);
    }

    #[test]
    fn data_uri_prefix_is_stripped() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"png");
        assert_eq!(decode_image(&encoded).unwrap(), b"png");
        assert_eq!(
            decode_image(&format!("data:image/png;base64,{encoded}")).unwrap(),
            b"png"
        );
        assert!(decode_image("%%%").is_err());
    }
}
