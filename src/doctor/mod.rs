use crate::config::{BackendConfig, Config};
use crate::lifecycle::{HttpProbe, ReadinessProbe};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

const DAEMON_STALE_SECONDS: i64 = 30;

/// Print the last snapshot the daemon wrote.
pub fn status(config: &Config) -> Result<()> {
    let state_file = config.state_file_path();
    if !state_file.exists() {
        println!("🎨 paintbot status");
        println!("  ❌ daemon state file not found: {}", state_file.display());
        println!("  💡 Start the bot with: paintbot run");
        return Ok(());
    }

    let raw = std::fs::read_to_string(&state_file)
        .with_context(|| format!("Failed to read {}", state_file.display()))?;
    let snapshot: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", state_file.display()))?;

    println!("🎨 paintbot status");
    println!("  State file: {}", state_file.display());
    for line in summarize_snapshot(&snapshot, Utc::now()) {
        println!("  {line}");
    }
    Ok(())
}

fn summarize_snapshot(snapshot: &serde_json::Value, now: DateTime<Utc>) -> Vec<String> {
    let mut lines = Vec::new();

    let updated_at = snapshot
        .get("updated_at")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    match parse_rfc3339(updated_at) {
        Some(ts) => {
            let age = now.signed_duration_since(ts).num_seconds();
            if age <= DAEMON_STALE_SECONDS {
                lines.push(format!("✅ daemon heartbeat fresh ({age}s ago)"));
            } else {
                lines.push(format!("❌ daemon heartbeat stale ({age}s ago)"));
            }
        }
        None => lines.push(format!("❌ invalid daemon timestamp: {updated_at}")),
    }

    if let Some(backends) = snapshot
        .get("backends")
        .and_then(serde_json::Value::as_object)
    {
        for (name, state) in backends {
            let state = state.as_str().unwrap_or("unknown");
            lines.push(format!("• backend {name}: {state}"));
        }
    }

    if let Some(components) = snapshot
        .get("components")
        .and_then(serde_json::Value::as_object)
    {
        for (name, component) in components {
            let ok = component
                .get("status")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|s| s == "ok");
            let restarts = component
                .get("restart_count")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            if ok {
                lines.push(format!("✅ {name} ok (restarts: {restarts})"));
            } else {
                let err = component
                    .get("last_error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error");
                lines.push(format!("❌ {name}: {err} (restarts: {restarts})"));
            }
        }
    }

    lines
}

/// Probe both backends once and report reachability.
pub async fn run(config: &Config) -> Result<()> {
    println!("🩺 paintbot doctor");
    println!("  Config: {}", config.config_path.display());
    println!("  {}", backend_report("image", &config.image_backend).await);
    println!("  {}", backend_report("text", &config.text_backend).await);
    if config.speech.enabled {
        println!("  ℹ️ speech: {} (voice {})", config.speech.base_url, config.speech.voice);
    } else {
        println!("  ℹ️ speech disabled");
    }
    Ok(())
}

async fn backend_report(name: &str, backend: &BackendConfig) -> String {
    let url = backend.probe_url();
    let reachable = HttpProbe::new(url.clone()).is_ready().await;
    let managed = if backend.auto_start {
        format!("starts on demand via `{}`", backend.launch.program)
    } else {
        "managed externally".to_string()
    };
    if reachable {
        format!("✅ {name} backend reachable at {url} ({managed})")
    } else {
        format!("❌ {name} backend not answering at {url} ({managed})")
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
