use crate::prompt::AspectRatio;
use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub character: CharacterConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default = "BackendConfig::image_default")]
    pub image_backend: BackendConfig,

    #[serde(default = "BackendConfig::text_default")]
    pub text_backend: BackendConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub text_generation: TextGenerationConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub messages: MessagesConfig,
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let paintbot_dir = home.join(".paintbot");

        Self {
            workspace_dir: paintbot_dir.join("workspace"),
            config_path: paintbot_dir.join("config.toml"),
            character: CharacterConfig::default(),
            commands: CommandsConfig::default(),
            image_backend: BackendConfig::image_default(),
            text_backend: BackendConfig::text_default(),
            generation: GenerationConfig::default(),
            text_generation: TextGenerationConfig::default(),
            speech: SpeechConfig::default(),
            chat: ChatConfig::default(),
            permissions: PermissionsConfig::default(),
            runtime: RuntimeConfig::default(),
            messages: MessagesConfig::default(),
        }
    }
}

// ── Character ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    /// Name the bot answers to while listening (case-insensitive substring match)
    #[serde(default = "default_character_name")]
    pub name: String,
    /// System persona prepended to every chat context
    #[serde(default = "default_persona")]
    pub persona: String,
}

fn default_character_name() -> String {
    "Gemma".into()
}

fn default_persona() -> String {
    "You are Gemma, a friendly and witty assistant hanging out in a Discord server. \
     Keep replies short and conversational."
        .into()
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            name: default_character_name(),
            persona: default_persona(),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────

/// Literal command forms recognised by the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Prefix for image and profile commands (note the trailing space)
    #[serde(default = "default_paint_prefix")]
    pub paint_prefix: String,
    #[serde(default = "default_chat_command")]
    pub chat: String,
    #[serde(default = "default_listen_command")]
    pub listen: String,
    #[serde(default = "default_stop_command")]
    pub stop: String,
    #[serde(default = "default_clear_command")]
    pub clear_chat: String,
}

fn default_paint_prefix() -> String {
    "!paint ".into()
}

fn default_chat_command() -> String {
    "!gemma".into()
}

fn default_listen_command() -> String {
    "!listen".into()
}

fn default_stop_command() -> String {
    "!stop".into()
}

fn default_clear_command() -> String {
    "!clearchat".into()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            paint_prefix: default_paint_prefix(),
            chat: default_chat_command(),
            listen: default_listen_command(),
            stop: default_stop_command(),
            clear_chat: default_clear_command(),
        }
    }
}

// ── Backends ──────────────────────────────────────────────────────

/// How to launch an external backend server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Executable or launch script
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; defaults to the program's parent directory
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// When false the server is managed externally: never launched, only probed
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Path probed with GET to decide readiness
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Upper bound for launch + readiness polling
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// HTTP timeout for a single backend call
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_probe_path() -> String {
    "/".into()
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_startup_timeout_secs() -> u64 {
    180
}

fn default_probe_interval_ms() -> u64 {
    2_000
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl BackendConfig {
    pub fn image_default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".into(),
            auto_start: true,
            launch: LaunchConfig::default(),
            probe_path: "/sdapi/v1/options".into(),
            idle_timeout_secs: default_idle_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            probe_interval_ms: default_probe_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn text_default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5001".into(),
            auto_start: true,
            launch: LaunchConfig::default(),
            probe_path: "/api/v1/model".into(),
            idle_timeout_secs: default_idle_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            probe_interval_ms: default_probe_interval_ms(),
            request_timeout_secs: 120,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_url(&self) -> String {
        join_url(&self.base_url, &self.probe_path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

// ── Image generation ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionsConfig {
    pub square: Resolution,
    pub portrait: Resolution,
    pub landscape: Resolution,
}

impl ResolutionsConfig {
    pub fn for_aspect(&self, aspect: AspectRatio) -> Resolution {
        match aspect {
            AspectRatio::Square => self.square,
            AspectRatio::Portrait => self.portrait,
            AspectRatio::Landscape => self.landscape,
        }
    }
}

impl Default for ResolutionsConfig {
    fn default() -> Self {
        Self {
            square: Resolution {
                width: 1024,
                height: 1024,
            },
            portrait: Resolution {
                width: 1024,
                height: 1520,
            },
            landscape: Resolution {
                width: 1520,
                height: 1024,
            },
        }
    }
}

/// Hires.fix parameters applied when a request carries the upscale flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiresConfig {
    pub upscaler: String,
    pub steps: u32,
    pub denoising_strength: f64,
    pub upscale_by: f64,
}

impl Default for HiresConfig {
    fn default() -> Self {
        Self {
            upscaler: "remacri_original".into(),
            steps: 15,
            denoising_strength: 0.35,
            upscale_by: 1.5,
        }
    }
}

/// Face/hand detailer pass run on every image when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdetailerConfig {
    pub enabled: bool,
    pub model: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub confidence: f64,
    pub mask_blur: u32,
    pub denoising_strength: f64,
    pub inpaint_only_masked: bool,
    pub inpaint_padding: u32,
}

impl Default for AdetailerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "face_yolov8n.pt".into(),
            prompt: "face, perfect eyes, beautiful".into(),
            negative_prompt: "bad face, blurry, deformed".into(),
            confidence: 0.3,
            mask_blur: 4,
            denoising_strength: 0.4,
            inpaint_only_masked: true,
            inpaint_padding: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Quality tags appended to every positive prompt
    #[serde(default = "default_positive_suffix")]
    pub positive_suffix: String,
    /// Quality tags appended to every negative prompt
    #[serde(default = "default_negative_suffix")]
    pub negative_suffix: String,
    /// Terms silently stripped from the user's negative prompt
    #[serde(default = "default_forbidden_negative_terms")]
    pub forbidden_negative_terms: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_clip_skip")]
    pub clip_skip: u32,
    #[serde(default)]
    pub resolutions: ResolutionsConfig,
    #[serde(default)]
    pub hires: HiresConfig,
    #[serde(default)]
    pub adetailer: AdetailerConfig,
    /// How long a second request waits for the job slot. 0 = fail fast.
    #[serde(default)]
    pub busy_wait_secs: u64,
}

fn default_positive_suffix() -> String {
    "detailed, masterpiece, best quality, good quality".into()
}

fn default_negative_suffix() -> String {
    "bad quality, worst quality, lowres, jpeg artifacts, bad anatomy, bad hands, \
     multiple views, signature, watermark, censored, ugly, child, loli"
        .into()
}

fn default_forbidden_negative_terms() -> Vec<String> {
    vec!["child".into(), "loli".into()]
}

fn default_model() -> String {
    "plantMilkModelSuite_walnut.safetensors".into()
}

fn default_sampler() -> String {
    "Euler a".into()
}

fn default_steps() -> u32 {
    28
}

fn default_cfg_scale() -> f64 {
    3.0
}

fn default_clip_skip() -> u32 {
    2
}

impl GenerationConfig {
    pub fn busy_wait(&self) -> Duration {
        Duration::from_secs(self.busy_wait_secs)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            positive_suffix: default_positive_suffix(),
            negative_suffix: default_negative_suffix(),
            forbidden_negative_terms: default_forbidden_negative_terms(),
            model: default_model(),
            sampler: default_sampler(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            clip_skip: default_clip_skip(),
            resolutions: ResolutionsConfig::default(),
            hires: HiresConfig::default(),
            adetailer: AdetailerConfig::default(),
            busy_wait_secs: 0,
        }
    }
}

// ── Text generation ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGenerationConfig {
    #[serde(default = "default_max_length")]
    pub max_length: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_rep_pen")]
    pub rep_pen: f64,
}

fn default_max_length() -> u32 {
    512
}

fn default_temperature() -> f64 {
    1.0
}

fn default_top_p() -> f64 {
    0.95
}

fn default_top_k() -> u32 {
    64
}

fn default_rep_pen() -> f64 {
    1.0
}

impl Default for TextGenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            rep_pen: default_rep_pen(),
        }
    }
}

// ── Speech ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_speech_url")]
    pub base_url: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Word in a chat message that asks for a spoken reply
    #[serde(default = "default_trigger_word")]
    pub trigger_word: String,
    #[serde(default = "default_speech_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_speech_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_speech_url() -> String {
    "http://localhost:8880".into()
}

fn default_voice() -> String {
    "af_bella".into()
}

fn default_trigger_word() -> String {
    "speak".into()
}

fn default_speech_max_chars() -> usize {
    2000
}

fn default_speech_timeout_secs() -> u64 {
    120
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_speech_url(),
            voice: default_voice(),
            trigger_word: default_trigger_word(),
            max_chars: default_speech_max_chars(),
            timeout_secs: default_speech_timeout_secs(),
        }
    }
}

// ── Chat ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Listen-mode window, renewed by every triggering message
    #[serde(default = "default_listen_minutes")]
    pub listen_minutes: u64,
    /// Maximum stored turns per channel (oldest evicted first)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// How long a message waits for the channel's in-flight turn
    #[serde(default = "default_turn_wait_secs")]
    pub turn_wait_secs: u64,
}

fn default_listen_minutes() -> u64 {
    30
}

fn default_history_limit() -> usize {
    20
}

fn default_turn_wait_secs() -> u64 {
    30
}

impl ChatConfig {
    pub fn listen_duration(&self) -> Duration {
        Duration::from_secs(self.listen_minutes * 60)
    }

    pub fn turn_wait(&self) -> Duration {
        Duration::from_secs(self.turn_wait_secs)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            listen_minutes: default_listen_minutes(),
            history_limit: default_history_limit(),
            turn_wait_secs: default_turn_wait_secs(),
        }
    }
}

// ── Permissions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Holding any of these roles grants the moderator capability
    #[serde(default)]
    pub moderator_role_ids: Vec<String>,
    /// Roles allowed to generate images. Empty = everyone.
    #[serde(default)]
    pub generation_role_ids: Vec<String>,
    /// Channels the bot answers in. Empty = all channels.
    #[serde(default)]
    pub allowed_channel_ids: Vec<String>,
}

// ── Runtime ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_state_flush_secs")]
    pub state_flush_secs: u64,
    #[serde(default = "default_initial_backoff_secs")]
    pub channel_initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub channel_max_backoff_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_state_flush_secs() -> u64 {
    5
}

fn default_initial_backoff_secs() -> u64 {
    2
}

fn default_max_backoff_secs() -> u64 {
    60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            state_flush_secs: default_state_flush_secs(),
            channel_initial_backoff_secs: default_initial_backoff_secs(),
            channel_max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────

/// User-visible strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub generating: String,
    pub generated: String,
    pub generation_error: String,
    pub no_prompt: String,
    pub bad_arguments: String,
    pub backend_unavailable: String,
    pub busy: String,
    pub not_allowed: String,
    pub wrong_channel: String,
    pub speech_error: String,
    pub result_expired: String,
    pub action_unavailable: String,
    pub deleted: String,
    pub backend_started: String,
    pub backend_stopped: String,
    pub listening: String,
    pub stopped_listening: String,
    pub listen_expired: String,
    pub history_cleared: String,
    pub profile_saved: String,
    pub profile_missing: String,
    pub profile_deleted: String,
    pub profile_error: String,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            generating: "Generating image with Forge... this might take a moment!".into(),
            generated: "Here's your image, {user}! (seed {seed})".into(),
            generation_error: "An error occurred during image generation. \
                               Please try again later."
                .into(),
            no_prompt: "Please provide a prompt! Example: `!paint generate a majestic dragon \
                        flying over a castle :: text, blurry`"
                .into(),
            bad_arguments: "That wasn't quite right. Please check your arguments.".into(),
            backend_unavailable: "The backend could not be started. Try again in a bit.".into(),
            busy: "I'm still working on the previous request. Please retry in a moment.".into(),
            not_allowed: "Sorry, you're not allowed to do that.".into(),
            wrong_channel: "Sorry, I can only respond to commands in the designated bot \
                            channels."
                .into(),
            speech_error: "I couldn't produce audio this time.".into(),
            result_expired: "That result is no longer available.".into(),
            action_unavailable: "That action isn't available for this result.".into(),
            deleted: "Deleted.".into(),
            backend_started: "Image backend is up.".into(),
            backend_stopped: "Image backend stopped.".into(),
            listening: "I'm listening! Mention my name and I'll reply.".into(),
            stopped_listening: "Okay, I'll stop listening. Chat history cleared.".into(),
            listen_expired: "It's gone quiet, so I'll stop listening for now.".into(),
            history_cleared: "Chat history cleared.".into(),
            profile_saved: "Profile saved.".into(),
            profile_missing: "You don't have a profile yet. Use `!paint setprofile <text>`."
                .into(),
            profile_deleted: "Profile deleted.".into(),
            profile_error: "Your profile could not be updated right now.".into(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let paintbot_dir = std::env::var("PAINTBOT_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map_or_else(|| home.join(".paintbot"), PathBuf::from);
        Self::load_or_init_in(&paintbot_dir)
    }

    /// Load `config.toml` from `dir`, writing defaults on first run.
    pub fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create .paintbot directory")?;
        }
        fs::create_dir_all(dir.join("workspace"))
            .context("Failed to create workspace directory")?;

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            fs::write(&config_path, contents).context("Failed to write config file")?;
            config
        };

        // Set computed paths that are skipped during serialization
        config.config_path = config_path;
        config.workspace_dir = dir.join("workspace");
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(url) = get("PAINTBOT_IMAGE_URL") {
            self.image_backend.base_url = url;
        }
        if let Some(url) = get("PAINTBOT_TEXT_URL") {
            self.text_backend.base_url = url;
        }
        if let Some(url) = get("PAINTBOT_SPEECH_URL") {
            self.speech.base_url = url;
        }
        if let Some(workspace) = get("PAINTBOT_WORKSPACE") {
            self.workspace_dir = PathBuf::from(workspace);
        }
        if let Some(name) = get("PAINTBOT_CHARACTER") {
            self.character.name = name;
        }
        if let Some(mins) = get("PAINTBOT_LISTEN_MINUTES").and_then(|v| v.parse::<u64>().ok()) {
            self.chat.listen_minutes = mins;
        }
    }

    /// Reject values that would leave the bot unable to run.
    pub fn validate(&self) -> Result<()> {
        if self.character.name.trim().is_empty() {
            bail!("character.name must not be empty");
        }
        if self.chat.listen_minutes == 0 {
            bail!("chat.listen_minutes must be greater than zero");
        }
        if self.chat.history_limit == 0 {
            bail!("chat.history_limit must be greater than zero");
        }
        if self.commands.paint_prefix.trim().is_empty() {
            bail!("commands.paint_prefix must not be empty");
        }
        for (name, backend) in [("image_backend", &self.image_backend), ("text_backend", &self.text_backend)] {
            if backend.base_url.trim().is_empty() {
                bail!("{name}.base_url must not be empty");
            }
            if backend.probe_interval_ms == 0 {
                bail!("{name}.probe_interval_ms must be greater than zero");
            }
            if backend.auto_start && backend.launch.program.trim().is_empty() {
                bail!("{name}.launch.program is required when auto_start is enabled");
            }
        }
        Ok(())
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
            .join("daemon_state.json")
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.workspace_dir.join("profiles.json")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.workspace_dir.join("outbox")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn runnable() -> Config {
        let mut c = Config::default();
        c.image_backend.launch.program = "/opt/forge/webui.sh".into();
        c.text_backend.launch.program = "/opt/kobold/koboldcpp".into();
        c
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.character.name, "Gemma");
        assert_eq!(c.commands.paint_prefix, "!paint ");
        assert_eq!(c.chat.listen_minutes, 30);
        assert_eq!(c.runtime.sweep_interval_secs, 60);
        assert_eq!(c.generation.busy_wait_secs, 0);
        assert!(c.workspace_dir.to_string_lossy().contains("workspace"));
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn resolutions_follow_aspect() {
        let r = ResolutionsConfig::default();
        assert_eq!(r.for_aspect(AspectRatio::Square).width, 1024);
        assert_eq!(r.for_aspect(AspectRatio::Portrait).height, 1520);
        assert_eq!(r.for_aspect(AspectRatio::Landscape).width, 1520);
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://h:1/", "/a"), "http://h:1/a");
        assert_eq!(join_url("http://h:1", "a"), "http://h:1/a");
    }

    // ── Serde ────────────────────────────────────────────────

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[character]
name = "Aria"

[image_backend]
base_url = "http://10.0.0.2:7860"
idle_timeout_secs = 600
"#;
        let c: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(c.character.name, "Aria");
        assert!(!c.character.persona.is_empty());
        assert_eq!(c.image_backend.idle_timeout_secs, 600);
        assert_eq!(c.image_backend.probe_path, "/");
        assert_eq!(c.text_backend.base_url, "http://127.0.0.1:5001");
        assert_eq!(c.messages.busy, MessagesConfig::default().busy);
    }

    #[test]
    fn config_toml_roundtrip() {
        let c = runnable();
        let s = toml::to_string_pretty(&c).unwrap();
        let parsed: Config = toml::from_str(&s).unwrap();
        assert_eq!(parsed.image_backend.launch.program, "/opt/forge/webui.sh");
        assert_eq!(parsed.generation.steps, c.generation.steps);
    }

    // ── Loading ──────────────────────────────────────────────

    #[test]
    fn load_or_init_writes_default_file() {
        let tmp = TempDir::new().unwrap();
        let c = Config::load_or_init_in(tmp.path()).unwrap();
        assert!(tmp.path().join("config.toml").exists());
        // Defaults have no launch program, so auto-start must be rejected.
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("launch.program"));
    }

    #[test]
    fn load_or_init_reads_existing_file() {
        let tmp = TempDir::new().unwrap();
        let contents = toml::to_string_pretty(&runnable()).unwrap();
        fs::write(tmp.path().join("config.toml"), contents).unwrap();

        let c = Config::load_or_init_in(tmp.path()).unwrap();
        assert_eq!(c.config_path, tmp.path().join("config.toml"));
        assert_eq!(c.workspace_dir, tmp.path().join("workspace"));
        assert!(c.workspace_dir.exists());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PAINTBOT_IMAGE_URL", "http://gpu:7860"),
            ("PAINTBOT_CHARACTER", "Nova"),
            ("PAINTBOT_LISTEN_MINUTES", "5"),
            ("PAINTBOT_TEXT_URL", ""),
        ]);
        let mut c = Config::default();
        c.apply_overrides(|k| vars.get(k).map(|v| (*v).to_string()));
        assert_eq!(c.image_backend.base_url, "http://gpu:7860");
        assert_eq!(c.character.name, "Nova");
        assert_eq!(c.chat.listen_minutes, 5);
        assert_eq!(c.text_backend.base_url, "http://127.0.0.1:5001");
    }

    // ── Validation ───────────────────────────────────────────

    #[test]
    fn validate_accepts_runnable_config() {
        assert!(runnable().validate().is_ok());
    }

    #[test]
    fn validate_allows_external_backends_without_program() {
        let mut c = Config::default();
        c.image_backend.auto_start = false;
        c.text_backend.auto_start = false;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_listen_window() {
        let mut c = runnable();
        c.chat.listen_minutes = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_character_name() {
        let mut c = runnable();
        c.character.name = "  ".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_probe_interval() {
        let mut c = runnable();
        c.text_backend.probe_interval_ms = 0;
        assert!(c.validate().is_err());
    }
}
