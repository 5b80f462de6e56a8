use super::traits::Channel;
use crate::bot::{BotEvent, IncomingInteraction, IncomingMessage, Reply};
use crate::dispatch::RecordId;
use crate::interaction::{Actor, InteractionKind};
use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{self, AsyncBufReadExt, BufReader};

pub const CLI_CHANNEL: &str = "cli";
pub const CLI_USER: &str = "local";

/// CLI channel: stdin in, stdout out, attachments dropped into an outbox directory
pub struct CliChannel {
    outbox: PathBuf,
}

impl CliChannel {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
        }
    }

    fn actor() -> Actor {
        Actor {
            id: CLI_USER.into(),
            name: CLI_USER.into(),
            roles: Vec::new(),
        }
    }

    /// `/upscale <id>`, `/rerun <id>` and `/delete <id>` click a control;
    /// anything else is a chat message.
    pub fn parse_line(line: &str) -> Option<BotEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(rest) = line.strip_prefix('/') {
            let (word, id) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if let Ok(kind) = word.parse::<InteractionKind>() {
                if !id.trim().is_empty() {
                    return Some(BotEvent::Interaction(IncomingInteraction {
                        channel: CLI_CHANNEL.into(),
                        actor: Self::actor(),
                        kind,
                        record: RecordId::from(id),
                    }));
                }
            }
        }
        Some(BotEvent::Message(IncomingMessage {
            channel: CLI_CHANNEL.into(),
            author: Self::actor(),
            text: line.to_string(),
            image: None,
        }))
    }

    /// Render a reply as terminal text, writing any attachment to the outbox.
    pub async fn render(&self, reply: &Reply) -> anyhow::Result<String> {
        match reply {
            Reply::Message {
                text,
                attachment,
                controls,
                record,
                ..
            } => {
                let mut out = text.clone();
                if let Some(attachment) = attachment {
                    tokio::fs::create_dir_all(&self.outbox)
                        .await
                        .with_context(|| format!("Failed to create {}", self.outbox.display()))?;
                    let path = self.outbox.join(&attachment.file_name);
                    tokio::fs::write(&path, &attachment.bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    out.push_str(&format!("\n  saved {}", path.display()));
                }
                if let Some(record) = record {
                    if !controls.is_empty() {
                        let actions: Vec<String> =
                            controls.iter().map(|c| format!("/{c} {record}")).collect();
                        out.push_str(&format!("\n  {}", actions.join("  ")));
                    }
                }
                Ok(out)
            }
            Reply::Delete { record, .. } => Ok(format!("(result {record} deleted)")),
        }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        CLI_CHANNEL
    }

    async fn send(&self, reply: &Reply) -> anyhow::Result<()> {
        println!("{}", self.render(reply).await?);
        Ok(())
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<BotEvent>) -> anyhow::Result<()> {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed == "/quit" || trimmed == "/exit" {
                break;
            }
            let Some(event) = Self::parse_line(trimmed) else {
                continue;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
