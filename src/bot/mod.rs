//! Front end: turns platform events into calls on the core components and
//! renders the outcome as replies.

pub mod commands;

pub use commands::Command;

use crate::config::{CommandsConfig, Config, MessagesConfig};
use crate::dispatch::{GenerationDispatcher, GenerationRecord, RecordId};
use crate::error::BotError;
use crate::interaction::{Actor, InteractionKind, InteractionOutcome, InteractionRouter};
use crate::profiles::ProfileStore;
use crate::prompt::PromptTemplate;
use crate::session::{ChatMessage, ChatSessionManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub channel: String,
    pub author: Actor,
    pub text: String,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct IncomingInteraction {
    pub channel: String,
    pub actor: Actor,
    pub kind: InteractionKind,
    pub record: RecordId,
}

#[derive(Debug, Clone)]
pub enum BotEvent {
    Message(IncomingMessage),
    Interaction(IncomingInteraction),
}

impl BotEvent {
    pub fn channel(&self) -> &str {
        match self {
            Self::Message(m) => &m.channel,
            Self::Interaction(i) => &i.channel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub enum Reply {
    Message {
        channel: String,
        text: String,
        attachment: Option<Attachment>,
        /// Buttons under the message, acting on `record`
        controls: Vec<InteractionKind>,
        record: Option<RecordId>,
    },
    /// Remove the message that rendered `record`
    Delete { channel: String, record: RecordId },
}

impl Reply {
    pub fn text(channel: &str, text: impl Into<String>) -> Self {
        Self::Message {
            channel: channel.to_string(),
            text: text.into(),
            attachment: None,
            controls: Vec::new(),
            record: None,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::Message { channel, .. } | Self::Delete { channel, .. } => channel,
        }
    }
}

pub struct Bot {
    commands: CommandsConfig,
    messages: MessagesConfig,
    allowed_channels: HashSet<String>,
    image_ready_timeout: Duration,
    template: PromptTemplate,
    dispatcher: Arc<GenerationDispatcher>,
    sessions: Arc<ChatSessionManager>,
    router: Arc<InteractionRouter>,
    profiles: Arc<dyn ProfileStore>,
}

impl Bot {
    pub fn new(
        config: &Config,
        dispatcher: Arc<GenerationDispatcher>,
        sessions: Arc<ChatSessionManager>,
        router: Arc<InteractionRouter>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            commands: config.commands.clone(),
            messages: config.messages.clone(),
            allowed_channels: config.permissions.allowed_channel_ids.iter().cloned().collect(),
            image_ready_timeout: config.image_backend.startup_timeout(),
            template: PromptTemplate::from_config(&config.generation),
            dispatcher,
            sessions,
            router,
            profiles,
        }
    }

    pub fn dispatcher(&self) -> &Arc<GenerationDispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<ChatSessionManager> {
        &self.sessions
    }

    fn channel_allowed(&self, channel: &str) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.contains(channel)
    }

    fn error_reply(&self, channel: &str, err: &BotError) -> Reply {
        Reply::text(channel, err.user_message(&self.messages))
    }

    /// Quick notice to send before a slow event is handled.
    pub fn acknowledgement(&self, event: &BotEvent) -> Option<Reply> {
        let starts_job = match event {
            BotEvent::Message(m) => {
                self.channel_allowed(&m.channel)
                    && matches!(
                        Command::parse(&m.text, &self.commands),
                        Some(Command::Generate { ref args, .. }) if !args.trim().is_empty()
                    )
            }
            BotEvent::Interaction(i) => i.kind != InteractionKind::Delete,
        };
        starts_job.then(|| Reply::text(event.channel(), self.messages.generating.clone()))
    }

    pub async fn handle_event(&self, event: BotEvent) -> Vec<Reply> {
        match event {
            BotEvent::Message(message) => self.handle_message(message).await,
            BotEvent::Interaction(interaction) => self.handle_interaction(interaction).await,
        }
    }

    /// Notices for channels whose listen window just closed.
    pub fn listen_expired(&self, channels: &[String]) -> Vec<Reply> {
        channels
            .iter()
            .map(|c| Reply::text(c, self.messages.listen_expired.clone()))
            .collect()
    }

    async fn handle_message(&self, message: IncomingMessage) -> Vec<Reply> {
        let channel = message.channel.clone();
        let Some(command) = Command::parse(&message.text, &self.commands) else {
            return self.chat(message, false).await;
        };

        if !self.channel_allowed(&channel) {
            tracing::debug!(channel = %channel, "command from channel outside allow-list");
            return vec![Reply::text(&channel, self.messages.wrong_channel.clone())];
        }

        let author = &message.author;
        match command {
            Command::Generate { alias, args } => self.generate(&channel, author, &alias, &args).await,
            Command::StartImage => self.start_image(&channel, author).await,
            Command::StopImage => self.stop_image(&channel, author).await,
            Command::SetProfile(text) => {
                if text.trim().is_empty() {
                    return vec![Reply::text(&channel, self.messages.bad_arguments.clone())];
                }
                let reply = match self.profiles.set(&author.id, &text) {
                    Ok(()) => self.messages.profile_saved.clone(),
                    Err(e) => e.user_message(&self.messages),
                };
                vec![Reply::text(&channel, reply)]
            }
            Command::ViewProfile => {
                let reply = match self.profiles.get(&author.id) {
                    Ok(Some(profile)) => format!("Your profile: {profile}"),
                    Ok(None) => self.messages.profile_missing.clone(),
                    Err(e) => e.user_message(&self.messages),
                };
                vec![Reply::text(&channel, reply)]
            }
            Command::DeleteProfile => {
                let reply = match self.profiles.delete(&author.id) {
                    Ok(true) => self.messages.profile_deleted.clone(),
                    Ok(false) => self.messages.profile_missing.clone(),
                    Err(e) => e.user_message(&self.messages),
                };
                vec![Reply::text(&channel, reply)]
            }
            Command::Chat(text) => {
                if text.is_empty() && message.image.is_none() {
                    return vec![Reply::text(&channel, self.messages.bad_arguments.clone())];
                }
                self.chat(IncomingMessage { text, ..message }, true).await
            }
            Command::Listen => {
                self.sessions.activate_listen(&channel);
                vec![Reply::text(&channel, self.messages.listening.clone())]
            }
            Command::StopListening => {
                self.sessions.stop(&channel);
                vec![Reply::text(&channel, self.messages.stopped_listening.clone())]
            }
            Command::ClearChat => {
                self.sessions.clear_history(&channel);
                vec![Reply::text(&channel, self.messages.history_cleared.clone())]
            }
            Command::Unknown(sub) => {
                tracing::debug!(sub = %sub, "unknown paint subcommand");
                vec![Reply::text(&channel, self.messages.bad_arguments.clone())]
            }
        }
    }

    async fn generate(&self, channel: &str, author: &Actor, alias: &str, args: &str) -> Vec<Reply> {
        if !self.router.permissions().can_generate(author) {
            return vec![self.error_reply(channel, &BotError::Authorization(author.id.clone()))];
        }
        let request = match self.template.parse(alias, args) {
            Ok(request) => request,
            Err(e) => return vec![self.error_reply(channel, &e.into())],
        };
        match self.dispatcher.dispatch(request, &author.id).await {
            Ok(record) => {
                self.router.register(record.clone());
                vec![self.render_record(channel, &author.name, &record)]
            }
            Err(e) => vec![self.error_reply(channel, &e)],
        }
    }

    async fn start_image(&self, channel: &str, author: &Actor) -> Vec<Reply> {
        if !self.router.permissions().can_generate(author) {
            return vec![self.error_reply(channel, &BotError::Authorization(author.id.clone()))];
        }
        let backend = self.dispatcher.backend();
        match backend.ensure_ready(self.image_ready_timeout).await {
            Ok(()) => vec![Reply::text(channel, self.messages.backend_started.clone())],
            Err(e) => vec![self.error_reply(channel, &e)],
        }
    }

    async fn stop_image(&self, channel: &str, author: &Actor) -> Vec<Reply> {
        if !self.router.permissions().can_generate(author) {
            return vec![self.error_reply(channel, &BotError::Authorization(author.id.clone()))];
        }
        match self.dispatcher.stop_backend().await {
            Ok(_) => vec![Reply::text(channel, self.messages.backend_stopped.clone())],
            Err(e) => vec![self.error_reply(channel, &e)],
        }
    }

    async fn chat(&self, message: IncomingMessage, direct: bool) -> Vec<Reply> {
        let chat = ChatMessage {
            channel: message.channel.clone(),
            user_id: message.author.id.clone(),
            user_name: message.author.name.clone(),
            text: message.text,
            image: message.image,
            direct,
        };
        match self.sessions.handle_message(&chat).await {
            Ok(Some(reply)) => vec![Reply::Message {
                channel: chat.channel,
                text: reply.text,
                attachment: reply.audio.map(|audio| Attachment {
                    file_name: "reply.wav".into(),
                    bytes: audio.into(),
                }),
                controls: Vec::new(),
                record: None,
            }],
            Ok(None) => Vec::new(),
            Err(e) => vec![self.error_reply(&chat.channel, &e)],
        }
    }

    async fn handle_interaction(&self, interaction: IncomingInteraction) -> Vec<Reply> {
        let channel = interaction.channel;
        match self
            .router
            .handle(interaction.kind, &interaction.record, &interaction.actor)
            .await
        {
            Ok(InteractionOutcome::Generated(record)) => {
                vec![self.render_record(&channel, &interaction.actor.name, &record)]
            }
            Ok(InteractionOutcome::Deleted(record)) => vec![Reply::Delete { channel, record }],
            Err(e) => vec![self.error_reply(&channel, &e)],
        }
    }

    fn render_record(&self, channel: &str, user: &str, record: &GenerationRecord) -> Reply {
        let text = self
            .messages
            .generated
            .replace("{user}", user)
            .replace("{seed}", &record.seed.to_string());
        Reply::Message {
            channel: channel.to_string(),
            text,
            attachment: Some(Attachment {
                file_name: record.artifact.file_name.clone(),
                bytes: Arc::clone(&record.artifact.bytes),
            }),
            controls: InteractionRouter::controls_for(record),
            record: Some(record.id.clone()),
        }
    }
}
