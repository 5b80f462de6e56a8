use crate::bot::{BotEvent, Reply};
use async_trait::async_trait;

/// A chat platform the bot is attached to.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Deliver one reply (text, attachment, controls or a deletion)
    async fn send(&self, reply: &Reply) -> anyhow::Result<()>;

    /// Start listening for incoming events (long-running)
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<BotEvent>) -> anyhow::Result<()>;

    /// Check if channel is healthy
    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::IncomingMessage;
    use crate::interaction::Actor;

    struct DummyChannel;

    #[async_trait]
    impl Channel for DummyChannel {
        fn name(&self) -> &str {
            "dummy"
        }

        async fn send(&self, _reply: &Reply) -> anyhow::Result<()> {
            Ok(())
        }

        async fn listen(&self, tx: tokio::sync::mpsc::Sender<BotEvent>) -> anyhow::Result<()> {
            tx.send(BotEvent::Message(IncomingMessage {
                channel: "dummy".into(),
                author: Actor {
                    id: "tester".into(),
                    name: "tester".into(),
                    roles: Vec::new(),
                },
                text: "hello".into(),
                image: None,
            }))
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
        }
    }

    #[tokio::test]
    async fn default_trait_methods_return_success() {
        let channel = DummyChannel;
        assert!(channel.health_check().await);
        assert!(channel.send(&Reply::text("dummy", "hi")).await.is_ok());
    }

    #[tokio::test]
    async fn listen_sends_event_to_channel() {
        let channel = DummyChannel;
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        channel.listen(tx).await.unwrap();

        let received = rx.recv().await.expect("event should be sent");
        let BotEvent::Message(message) = received else {
            panic!("expected a message");
        };
        assert_eq!(message.author.id, "tester");
        assert_eq!(message.text, "hello");
        assert_eq!(message.channel, "dummy");
    }
}
