use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

use crate::channel::{Channel, MessageHandler};
use crate::rpc::message::Message;

/// In-process channel. Messages (including their [bytes::Bytes] payloads) are moved to the
///  other side, nothing is copied.
pub struct LoopbackChannel {
    name: &'static str,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
    cancel_sender: watch::Sender<bool>,
}

impl LoopbackChannel {
    /// Two connected ends: whatever is posted on one end is received on the other.
    pub fn pair() -> (Arc<LoopbackChannel>, Arc<LoopbackChannel>) {
        let (sender_a, receiver_b) = mpsc::unbounded_channel();
        let (sender_b, receiver_a) = mpsc::unbounded_channel();

        let a = LoopbackChannel::new("a", sender_a, receiver_a);
        let b = LoopbackChannel::new("b", sender_b, receiver_b);
        (Arc::new(a), Arc::new(b))
    }

    fn new(name: &'static str, sender: mpsc::UnboundedSender<Message>, receiver: mpsc::UnboundedReceiver<Message>) -> LoopbackChannel {
        let (cancel_sender, _) = watch::channel(false);
        LoopbackChannel {
            name,
            sender,
            receiver: Mutex::new(receiver),
            cancel_sender,
        }
    }
}

#[async_trait::async_trait]
impl Channel for LoopbackChannel {
    fn post_message(&self, message: Message) -> anyhow::Result<()> {
        trace!(channel = self.name, ?message, "posting message");
        self.sender.send(message)
            .map_err(|_| anyhow!("loopback channel {}: peer is gone", self.name))
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let mut receiver = match self.receiver.try_lock() {
            Ok(r) => r,
            Err(_) => bail!("loopback channel {}: receive loop is already running", self.name),
        };

        if *cancel_receiver.borrow_and_update() {
            debug!(channel = self.name, "loopback receive loop was cancelled before it started");
            return Ok(());
        }

        debug!(channel = self.name, "starting loopback receive loop");

        loop {
            tokio::select! {
                biased;
                _ = cancel_receiver.changed() => break,
                msg = receiver.recv() => {
                    match msg {
                        Some(message) => handler.handle_message(message).await?,
                        None => bail!("loopback channel {}: peer disconnected", self.name),
                    }
                }
            }
        }

        debug!(channel = self.name, "loopback receive loop cancelled");
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel_sender.send_replace(true);
    }

    fn supports_transfer(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::rpc::message::{MessageBody, Payload};
    use super::*;

    struct Collect(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl MessageHandler for Collect {
        async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
            if let MessageBody::Action { action, .. } = &message.body {
                if action == "Fail" {
                    bail!("failing on request");
                }
            }
            self.0.send(message)?;
            Ok(())
        }
    }

    fn action(name: &str) -> Message {
        Message {
            source: "a".to_string(),
            target: "b".to_string(),
            body: MessageBody::Action { action: name.to_string(), data: Payload::empty() },
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (a, b) = LoopbackChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let b2 = b.clone();
        let recv = tokio::spawn(async move { b2.recv_loop(Arc::new(Collect(tx))).await });

        for i in 0..5 {
            a.post_message(action(&format!("A{}", i))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), action(&format!("A{}", i)));
        }

        b.cancel_recv_loop();
        assert!(recv.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (_a, b) = LoopbackChannel::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        b.cancel_recv_loop();
        let result = tokio::time::timeout(Duration::from_secs(1), b.recv_loop(Arc::new(Collect(tx)))).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_peer_dropped() {
        let (a, b) = LoopbackChannel::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        drop(a);
        assert!(b.recv_loop(Arc::new(Collect(tx))).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_error_ends_loop() {
        let (a, b) = LoopbackChannel::pair();
        let (tx, _rx) = mpsc::unbounded_channel();
        a.post_message(action("Fail")).unwrap();
        assert!(b.recv_loop(Arc::new(Collect(tx))).await.is_err());
    }

    #[test]
    fn test_post_to_dropped_peer() {
        let (a, b) = LoopbackChannel::pair();
        drop(b);
        assert!(a.post_message(action("x")).is_err());
    }
}
