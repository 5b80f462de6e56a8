use crate::bot::{Bot, BotEvent};
use crate::channels::{Channel, CliChannel};
use crate::clock;
use crate::config::Config;
use crate::dispatch::GenerationDispatcher;
use crate::interaction::{InteractionRouter, RolePermissions};
use crate::lifecycle::BackendProcess;
use crate::profiles::{JsonProfileStore, ProfileStore};
use crate::providers::{ForgeClient, KoboldClient, KokoroClient, SpeechBackend};
use crate::session::{ChatSessionManager, SessionSettings};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const EVENT_QUEUE: usize = 64;

/// Wire every component from config.
pub fn build_bot(config: &Config) -> Result<Arc<Bot>> {
    let clock = clock::system();
    let log_dir = config.workspace_dir.join("logs");

    let image_backend = BackendProcess::from_config(
        "image",
        &config.image_backend,
        log_dir.clone(),
        Arc::clone(&clock),
    );
    let text_backend =
        BackendProcess::from_config("text", &config.text_backend, log_dir, Arc::clone(&clock));

    let forge = ForgeClient::new(
        &config.image_backend.base_url,
        config.generation.clone(),
        config.image_backend.request_timeout(),
    );
    let kobold = KoboldClient::new(
        &config.text_backend.base_url,
        config.text_generation.clone(),
        config.text_backend.request_timeout(),
    );
    let speech: Option<Arc<dyn SpeechBackend>> = if config.speech.enabled {
        Some(Arc::new(
            KokoroClient::new(&config.speech).context("Failed to set up speech client")?,
        ))
    } else {
        None
    };

    let profiles: Arc<dyn ProfileStore> = Arc::new(JsonProfileStore::open(config.profiles_path())?);

    let dispatcher = Arc::new(GenerationDispatcher::new(
        image_backend,
        Arc::new(forge),
        config.generation.busy_wait(),
        config.image_backend.startup_timeout(),
    ));
    let sessions = Arc::new(ChatSessionManager::new(
        SessionSettings::from_config(config),
        text_backend,
        Arc::new(kobold),
        speech,
        Arc::clone(&profiles),
        clock,
    ));
    let router = Arc::new(InteractionRouter::new(
        Arc::clone(&dispatcher),
        Arc::new(RolePermissions::from_config(&config.permissions)),
    ));

    Ok(Arc::new(Bot::new(config, dispatcher, sessions, router, profiles)))
}

pub async fn run(config: Config) -> Result<()> {
    let initial_backoff = config.runtime.channel_initial_backoff_secs.max(1);
    let max_backoff = config.runtime.channel_max_backoff_secs.max(initial_backoff);

    crate::health::mark_component_ok("daemon");

    let bot = build_bot(&config)?;
    let channel: Arc<dyn Channel> = Arc::new(CliChannel::new(config.outbox_dir()));
    let (tx, rx) = mpsc::channel::<BotEvent>(EVENT_QUEUE);

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(config.clone())];

    {
        let listener = Arc::clone(&channel);
        handles.push(spawn_component_supervisor(
            "channel",
            initial_backoff,
            max_backoff,
            move || {
                let listener = Arc::clone(&listener);
                let tx = tx.clone();
                async move { listener.listen(tx).await }
            },
        ));
    }

    handles.push(spawn_event_loop(Arc::clone(&bot), Arc::clone(&channel), rx));
    handles.push(spawn_sweeper(
        Arc::clone(&bot),
        Arc::clone(&channel),
        Duration::from_secs(config.runtime.sweep_interval_secs.max(1)),
    ));

    println!("🎨 paintbot daemon started");
    println!("   Character: {}", config.character.name);
    println!("   Images:    {}", config.image_backend.base_url);
    println!("   Chat:      {}", config.text_backend.base_url);
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_component_error("daemon", "shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    bot.dispatcher().backend().stop().await;
    bot.sessions().backend().stop().await;
    tracing::info!("backends stopped, exiting");

    Ok(())
}

/// Drain incoming events; each one is handled on its own task.
fn spawn_event_loop(
    bot: Arc<Bot>,
    channel: Arc<dyn Channel>,
    mut rx: mpsc::Receiver<BotEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let bot = Arc::clone(&bot);
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { handle_event(&bot, channel.as_ref(), event).await });
        }
    })
}

pub async fn handle_event(bot: &Bot, channel: &dyn Channel, event: BotEvent) {
    if let Some(ack) = bot.acknowledgement(&event) {
        if let Err(e) = channel.send(&ack).await {
            tracing::warn!(channel = channel.name(), "failed to send acknowledgement: {e:#}");
        }
    }
    for reply in bot.handle_event(event).await {
        if let Err(e) = channel.send(&reply).await {
            tracing::error!(channel = channel.name(), "failed to send reply: {e:#}");
        }
    }
}

/// Idle shutdown for both backends and listen-mode expiry.
fn spawn_sweeper(bot: Arc<Bot>, channel: Arc<dyn Channel>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            sweep_once(&bot, channel.as_ref()).await;
        }
    })
}

pub async fn sweep_once(bot: &Bot, channel: &dyn Channel) {
    bot.dispatcher().backend().idle_sweep().await;
    bot.sessions().backend().idle_sweep().await;

    let expired = bot.sessions().sweep();
    for reply in bot.listen_expired(&expired) {
        if let Err(e) = channel.send(&reply).await {
            tracing::warn!(channel = channel.name(), "failed to announce listen expiry: {e:#}");
        }
    }
}

fn spawn_state_writer(config: Config) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = config.state_file_path();
        let every = Duration::from_secs(config.runtime.state_flush_secs.max(1));
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = write_state_file(&path).await {
                tracing::warn!(path = %path.display(), "failed to write state file: {e:#}");
            }
        }
    })
}

/// Dump the health snapshot, stamped with the write time.
async fn write_state_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut json = crate::health::snapshot_json();
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json).context("Failed to serialize health snapshot")?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!(component = name, backoff_secs = backoff, "exited, restarting");
                }
                Err(e) => {
                    crate::health::mark_component_error(name, format!("{e:#}"));
                    tracing::error!(component = name, backoff_secs = backoff, "failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
