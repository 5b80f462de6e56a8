//! Per-channel chat sessions.
//!
//! Each channel has a bounded history and an optional listen-mode deadline.
//! A message gets a reply when it is a direct command, or when the channel
//! is listening and the message names the character. Every reply slides the
//! listen window forward. One chat turn runs per channel at a time.

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{BotError, BotResult};
use crate::lifecycle::BackendProcess;
use crate::profiles::ProfileStore;
use crate::providers::{ChatContext, ChatTurn, SpeechBackend, TextBackend};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub character: String,
    pub persona: String,
    pub listen_duration: Duration,
    pub history_limit: usize,
    /// How long a second message waits for the channel's in-flight turn
    pub turn_wait: Duration,
    pub ready_timeout: Duration,
    /// Replies are spoken when the message contains this word (case-insensitive)
    pub speech_trigger: Option<String>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            character: config.character.name.clone(),
            persona: config.character.persona.clone(),
            listen_duration: config.chat.listen_duration(),
            history_limit: config.chat.history_limit,
            turn_wait: config.chat.turn_wait(),
            ready_timeout: config.text_backend.startup_timeout(),
            speech_trigger: config
                .speech
                .enabled
                .then(|| config.speech.trigger_word.to_lowercase())
                .filter(|w| !w.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    /// Raw bytes of an attached image, if any
    pub image: Option<Vec<u8>>,
    /// Sent with the direct chat command rather than as plain conversation
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    /// WAV bytes when speech was requested and synthesis worked
    pub audio: Option<Vec<u8>>,
}

/// Bounded turn log. `epoch` moves on every wipe so a turn that started
/// before the wipe cannot write into the fresh history.
#[derive(Default)]
struct History {
    turns: VecDeque<ChatTurn>,
    epoch: u64,
}

#[derive(Default)]
struct ChannelSession {
    listen_until: Mutex<Option<Instant>>,
    history: Mutex<History>,
    turn: tokio::sync::Mutex<()>,
}

impl ChannelSession {
    fn is_listening(&self, now: Instant) -> bool {
        self.listen_until.lock().is_some_and(|until| until > now)
    }

    fn epoch(&self) -> u64 {
        self.history.lock().epoch
    }

    /// Append unless the history was wiped since `epoch`; returns whether it landed.
    fn push(&self, turn: ChatTurn, limit: usize, epoch: u64) -> bool {
        let mut history = self.history.lock();
        if history.epoch != epoch {
            return false;
        }
        history.turns.push_back(turn);
        while history.turns.len() > limit {
            history.turns.pop_front();
        }
        true
    }

    fn turns(&self) -> Vec<ChatTurn> {
        self.history.lock().turns.iter().cloned().collect()
    }

    fn clear(&self) {
        let mut history = self.history.lock();
        history.turns.clear();
        history.epoch = history.epoch.wrapping_add(1);
    }
}

pub struct ChatSessionManager {
    settings: SessionSettings,
    character_lower: String,
    backend: BackendProcess,
    text: Arc<dyn TextBackend>,
    speech: Option<Arc<dyn SpeechBackend>>,
    profiles: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    sessions: Mutex<HashMap<String, Arc<ChannelSession>>>,
}

impl ChatSessionManager {
    pub fn new(
        settings: SessionSettings,
        backend: BackendProcess,
        text: Arc<dyn TextBackend>,
        speech: Option<Arc<dyn SpeechBackend>>,
        profiles: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            character_lower: settings.character.to_lowercase(),
            settings,
            backend,
            text,
            speech,
            profiles,
            clock,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &BackendProcess {
        &self.backend
    }

    fn session(&self, channel: &str) -> Arc<ChannelSession> {
        Arc::clone(
            self.sessions
                .lock()
                .entry(channel.to_string())
                .or_default(),
        )
    }

    fn existing(&self, channel: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.lock().get(channel).cloned()
    }

    /// `Ok(None)` when the message does not call for a reply.
    pub async fn handle_message(&self, message: &ChatMessage) -> BotResult<Option<ChatReply>> {
        let session = self.session(&message.channel);
        let now = self.clock.now();
        let lower = message.text.to_lowercase();

        let addressed = session.is_listening(now) && lower.contains(&self.character_lower);
        if !message.direct && !addressed {
            return Ok(None);
        }
        *session.listen_until.lock() = Some(now + self.settings.listen_duration);

        let Ok(_turn) = tokio::time::timeout(self.settings.turn_wait, session.turn.lock()).await
        else {
            tracing::info!(channel = %message.channel, "chat turn rejected, channel busy");
            return Err(BotError::Busy("still answering the previous message".into()));
        };

        let epoch = session.epoch();
        session.push(
            ChatTurn::user(&message.user_name, &message.text),
            self.settings.history_limit,
            epoch,
        );

        self.backend.ensure_ready(self.settings.ready_timeout).await?;
        let _lease = self.backend.lease();

        let image_description = match &message.image {
            Some(image) => self.describe(image).await,
            None => None,
        };
        let history = session.turns();
        let context = ChatContext {
            persona: self.settings.persona.clone(),
            profile: self.profile_for(&message.user_id),
            image_description,
            current_time: (lower.contains("time") || lower.contains("date"))
                .then(|| chrono::Local::now().format("%A, %d %B %Y, %H:%M").to_string()),
            history,
        };

        let text = self.text.generate(&context).await.map_err(|e| {
            tracing::warn!(channel = %message.channel, "text generation failed: {e:#}");
            BotError::backend(self.backend.name(), &e)
        })?;
        self.backend.record_activity();
        if !session.push(ChatTurn::assistant(&text), self.settings.history_limit, epoch) {
            tracing::debug!(channel = %message.channel, "history wiped mid-turn, reply not kept");
        }

        let audio = if self.wants_speech(&lower) {
            self.speak(&text).await
        } else {
            None
        };

        Ok(Some(ChatReply { text, audio }))
    }

    fn profile_for(&self, user_id: &str) -> Option<String> {
        match self.profiles.get(user_id) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(user = user_id, "profile lookup failed: {e}");
                None
            }
        }
    }

    async fn describe(&self, image: &[u8]) -> Option<String> {
        match self.text.describe_image(image).await {
            Ok(caption) => Some(caption),
            Err(e) => {
                tracing::warn!("image description failed, continuing without it: {e:#}");
                None
            }
        }
    }

    fn wants_speech(&self, lower_text: &str) -> bool {
        self.speech.is_some()
            && self
                .settings
                .speech_trigger
                .as_deref()
                .is_some_and(|word| lower_text.contains(word))
    }

    async fn speak(&self, text: &str) -> Option<Vec<u8>> {
        let speech = self.speech.as_ref()?;
        match speech.synthesize(text).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                let err = BotError::Synthesis(format!("{e:#}"));
                tracing::warn!("{err}");
                None
            }
        }
    }

    /// Enter or extend listen mode without needing the character's name.
    pub fn activate_listen(&self, channel: &str) {
        let until = self.clock.now() + self.settings.listen_duration;
        *self.session(channel).listen_until.lock() = Some(until);
        tracing::info!(channel, "listen mode on");
    }

    /// Leave listen mode and wipe history in one step.
    pub fn stop(&self, channel: &str) {
        if let Some(session) = self.existing(channel) {
            *session.listen_until.lock() = None;
            session.clear();
        }
        tracing::info!(channel, "listen mode off, history cleared");
    }

    /// Wipe history; listen mode is left as it is.
    pub fn clear_history(&self, channel: &str) {
        if let Some(session) = self.existing(channel) {
            session.clear();
        }
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        let now = self.clock.now();
        self.existing(channel)
            .is_some_and(|session| session.is_listening(now))
    }

    pub fn history(&self, channel: &str) -> Vec<ChatTurn> {
        self.existing(channel)
            .map(|session| session.turns())
            .unwrap_or_default()
    }

    /// Expire listen windows that have passed; returns the affected channels.
    pub fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let sessions = self.sessions.lock();
        let mut expired: Vec<String> = sessions
            .iter()
            .filter_map(|(channel, session)| {
                let mut until = session.listen_until.lock();
                match *until {
                    Some(deadline) if deadline <= now => {
                        *until = None;
                        Some(channel.clone())
                    }
                    _ => None,
                }
            })
            .collect();
        expired.sort();
        for channel in &expired {
            tracing::info!(channel, "listen mode expired");
        }
        expired
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::providers::{ChatContext, Role, SpeechBackend, TextBackend};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes the last user turn and keeps every context it saw.
    #[derive(Default)]
    pub struct FakeText {
        pub delay: Duration,
        pub contexts: Mutex<Vec<ChatContext>>,
        pub fail: AtomicBool,
        pub fail_describe: AtomicBool,
    }

    #[async_trait]
    impl TextBackend for FakeText {
        async fn generate(&self, context: &ChatContext) -> anyhow::Result<String> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("koboldcpp API error (503 Service Unavailable): loading");
            }
            self.contexts.lock().push(context.clone());
            let last = context
                .history
                .iter()
                .rev()
                .find(|t| t.role == Role::User)
                .map(|t| t.text.clone())
                .unwrap_or_default();
            Ok(format!("reply to: {last}"))
        }

        async fn describe_image(&self, _image: &[u8]) -> anyhow::Result<String> {
            if self.fail_describe.load(Ordering::SeqCst) {
                anyhow::bail!("interrogation returned no caption");
            }
            Ok("a cat on a windowsill".into())
        }
    }

    #[derive(Default)]
    pub struct FakeSpeech {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
    }

    #[async_trait]
    impl SpeechBackend for FakeSpeech {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("kokoro API error (500)");
            }
            Ok(b"RIFF fake".to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeSpeech, FakeText};
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::testing::{backend, FakeLauncher, FakeProbe};
    use crate::profiles::MemoryProfileStore;
    use crate::providers::Role;
    use std::sync::atomic::Ordering;

    const D: Duration = Duration::from_secs(30 * 60);
    const EPS: Duration = Duration::from_secs(1);

    struct Harness {
        manager: Arc<ChatSessionManager>,
        clock: Arc<ManualClock>,
        text: Arc<FakeText>,
        speech: Arc<FakeSpeech>,
        profiles: Arc<MemoryProfileStore>,
        launcher: Arc<FakeLauncher>,
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            character: "Gemma".into(),
            persona: "You are Gemma.".into(),
            listen_duration: D,
            history_limit: 4,
            turn_wait: Duration::from_millis(20),
            ready_timeout: Duration::from_secs(5),
            speech_trigger: Some("speak".into()),
        }
    }

    fn harness_with(text: FakeText) -> Harness {
        let clock = ManualClock::new();
        let launcher = Arc::new(FakeLauncher::default());
        let probe = Arc::new(FakeProbe::ready());
        let text = Arc::new(text);
        let speech = Arc::new(FakeSpeech::default());
        let profiles = Arc::new(MemoryProfileStore::new());
        let manager = Arc::new(ChatSessionManager::new(
            settings(),
            backend(&launcher, &probe, clock.clone()),
            text.clone(),
            Some(speech.clone() as Arc<dyn SpeechBackend>),
            profiles.clone(),
            clock.clone(),
        ));
        Harness {
            manager,
            clock,
            text,
            speech,
            profiles,
            launcher,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeText::default())
    }

    fn msg(text: &str, direct: bool) -> ChatMessage {
        ChatMessage {
            channel: "c1".into(),
            user_id: "u1".into(),
            user_name: "mika".into(),
            text: text.into(),
            image: None,
            direct,
        }
    }

    #[tokio::test]
    async fn plain_message_without_listen_mode_is_ignored() {
        let h = harness();
        assert_eq!(h.manager.handle_message(&msg("hi gemma", false)).await.unwrap(), None);
        assert_eq!(h.launcher.launches(), 0);
        assert!(h.manager.history("c1").is_empty());
    }

    #[tokio::test]
    async fn direct_message_replies_and_starts_listening() {
        let h = harness();
        let reply = h.manager.handle_message(&msg("hello", true)).await.unwrap().unwrap();
        assert_eq!(reply.text, "reply to: hello");
        assert!(reply.audio.is_none());
        assert!(h.manager.is_listening("c1"));

        let history = h.manager.history("c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn listen_mode_needs_character_name() {
        let h = harness();
        h.manager.activate_listen("c1");

        assert!(h.manager.handle_message(&msg("nice weather", false)).await.unwrap().is_none());
        let reply = h.manager.handle_message(&msg("what do you think, GEMMA?", false)).await.unwrap();
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn listen_window_slides_on_trigger() {
        let h = harness();
        h.manager.activate_listen("c1");

        h.clock.advance(D - EPS);
        assert!(h.manager.is_listening("c1"));
        h.clock.advance(EPS * 2);
        assert!(!h.manager.is_listening("c1"));

        // Fresh window, then a trigger halfway through extends it.
        h.manager.activate_listen("c1");
        h.clock.advance(D / 2);
        h.manager.handle_message(&msg("gemma, still there?", false)).await.unwrap().unwrap();
        h.clock.advance(D - EPS);
        assert!(h.manager.is_listening("c1"));
        h.clock.advance(EPS * 2);
        assert!(!h.manager.is_listening("c1"));
    }

    #[tokio::test]
    async fn sweep_reports_expired_channels_once() {
        let h = harness();
        h.manager.activate_listen("c1");
        h.manager.activate_listen("c2");
        h.clock.advance(D / 2);
        h.manager.activate_listen("c2");

        h.clock.advance(D / 2 + EPS);
        assert_eq!(h.manager.sweep(), vec!["c1".to_string()]);
        assert!(h.manager.sweep().is_empty());
        assert!(h.manager.is_listening("c2"));
    }

    #[tokio::test]
    async fn stop_clears_listen_and_history_but_clear_keeps_listen() {
        let h = harness();
        h.manager.handle_message(&msg("hello", true)).await.unwrap();

        h.manager.clear_history("c1");
        assert!(h.manager.history("c1").is_empty());
        assert!(h.manager.is_listening("c1"));

        h.manager.handle_message(&msg("again", true)).await.unwrap();
        h.manager.stop("c1");
        assert!(h.manager.history("c1").is_empty());
        assert!(!h.manager.is_listening("c1"));
    }

    #[tokio::test]
    async fn history_is_bounded_oldest_first_out() {
        let h = harness();
        for i in 0..5 {
            h.manager.handle_message(&msg(&format!("m{i}"), true)).await.unwrap();
        }
        let history = h.manager.history("c1");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].text, "m3");
        assert_eq!(history[3].text, "reply to: m4");
    }

    #[tokio::test]
    async fn context_carries_profile_image_and_time() {
        let h = harness();
        h.profiles.set("u1", "likes foxes").unwrap();
        let mut m = msg("what date is it? here is a picture", true);
        m.image = Some(b"jpeg".to_vec());
        h.manager.handle_message(&m).await.unwrap();

        let contexts = h.text.contexts.lock();
        let ctx = &contexts[0];
        assert_eq!(ctx.persona, "You are Gemma.");
        assert_eq!(ctx.profile.as_deref(), Some("likes foxes"));
        assert_eq!(ctx.image_description.as_deref(), Some("a cat on a windowsill"));
        assert!(ctx.current_time.is_some());
        assert_eq!(ctx.history.last().unwrap().speaker, "mika");
    }

    #[tokio::test]
    async fn failed_image_description_does_not_fail_turn() {
        let text = FakeText::default();
        text.fail_describe.store(true, Ordering::SeqCst);
        let h = harness_with(text);
        let mut m = msg("look", true);
        m.image = Some(b"jpeg".to_vec());

        assert!(h.manager.handle_message(&m).await.unwrap().is_some());
        let contexts = h.text.contexts.lock();
        assert!(contexts[0].image_description.is_none());
        assert!(contexts[0].current_time.is_none());
    }

    #[tokio::test]
    async fn speech_is_best_effort() {
        let h = harness();
        let reply = h.manager.handle_message(&msg("speak to me", true)).await.unwrap().unwrap();
        assert!(reply.audio.is_some());

        h.speech.fail.store(true, Ordering::SeqCst);
        let reply = h.manager.handle_message(&msg("Speak again", true)).await.unwrap().unwrap();
        assert!(reply.audio.is_none());
        assert_eq!(reply.text, "reply to: Speak again");
        assert_eq!(h.speech.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_turn_in_same_channel_is_busy() {
        let h = harness_with(FakeText {
            delay: Duration::from_millis(200),
            ..FakeText::default()
        });
        let first = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.handle_message(&msg("first", true)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = h.manager.handle_message(&msg("second", true)).await;
        assert!(matches!(second, Err(BotError::Busy(_))));
        assert!(first.await.unwrap().unwrap().is_some());

        let texts: Vec<_> = h.manager.history("c1").into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["first", "reply to: first"]);
    }

    #[tokio::test]
    async fn wipe_during_turn_is_not_undone_by_the_reply() {
        let h = harness_with(FakeText {
            delay: Duration::from_millis(200),
            ..FakeText::default()
        });
        let turn = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.handle_message(&msg("hello", true)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.manager.stop("c1");

        let reply = turn.await.unwrap().unwrap().unwrap();
        assert_eq!(reply.text, "reply to: hello");
        assert!(h.manager.history("c1").is_empty());

        // The next turn records normally.
        h.manager.handle_message(&msg("again", true)).await.unwrap();
        let texts: Vec<_> = h.manager.history("c1").into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["again", "reply to: again"]);
    }

    #[tokio::test]
    async fn clear_during_turn_drops_the_late_reply() {
        let h = harness_with(FakeText {
            delay: Duration::from_millis(200),
            ..FakeText::default()
        });
        let turn = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.handle_message(&msg("hello", true)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.manager.clear_history("c1");

        assert!(turn.await.unwrap().unwrap().is_some());
        assert!(h.manager.history("c1").is_empty());
        assert!(h.manager.is_listening("c1"));
    }

    #[tokio::test]
    async fn backend_failure_is_reported() {
        let text = FakeText::default();
        text.fail.store(true, Ordering::SeqCst);
        let h = harness_with(text);
        let err = h.manager.handle_message(&msg("hello", true)).await.unwrap_err();
        assert!(matches!(err, BotError::Backend { .. }));
    }
}
