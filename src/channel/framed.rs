use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, trace};

use crate::channel::{Channel, MessageHandler};
use crate::rpc::message::Message;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A channel over a byte stream (pipe, socket, child process stdio). Each message is encoded
///  with the binary wire codec and written as a frame:
///
/// ```ascii
/// 0: frame length (u32 BE), excluding these four bytes
/// 4: encoded message
/// ```
///
/// Payloads are copied into frames, so this channel does not support transfer.
pub struct FramedChannel {
    frame_sender: mpsc::UnboundedSender<Bytes>,
    reader: Mutex<Box<dyn AsyncRead + Send + Unpin>>,
    cancel_sender: watch::Sender<bool>,
}

impl FramedChannel {
    /// Spawns the writer task, so this must be called from inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> FramedChannel
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (frame_sender, frame_receiver) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, frame_receiver));

        let (cancel_sender, _) = watch::channel(false);
        FramedChannel {
            frame_sender,
            reader: Mutex::new(Box::new(reader)),
            cancel_sender,
        }
    }

    /// Both ends of an in-memory duplex pipe, for running the framed codec in-process.
    pub fn duplex_pair(max_buf_size: usize) -> (Arc<FramedChannel>, Arc<FramedChannel>) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Arc::new(FramedChannel::new(a_read, a_write)), Arc::new(FramedChannel::new(b_read, b_write)))
    }
}

pub fn encode_frame(message: &Message) -> anyhow::Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u32(0);
    message.ser(&mut buf)?;

    let len = buf.len() - 4;
    if len > MAX_FRAME_SIZE {
        bail!("message of {} bytes exceeds the maximum frame size of {} bytes", len, MAX_FRAME_SIZE);
    }
    buf[..4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(buf.freeze())
}

async fn read_frame(reader: &mut (dyn AsyncRead + Send + Unpin)) -> anyhow::Result<Option<Message>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        bail!("announced frame length {} exceeds the maximum of {} bytes", len, MAX_FRAME_SIZE);
    }

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;

    let mut frame = Bytes::from(frame);
    Message::deser(&mut frame).map(Some)
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            error!(error = ?e, "error writing frame - shutting down writer");
            return;
        }
        if let Err(e) = writer.flush().await {
            error!(error = ?e, "error flushing frame - shutting down writer");
            return;
        }
    }
    debug!("all senders are gone - shutting down writer");
    let _ = writer.shutdown().await;
}

#[async_trait::async_trait]
impl Channel for FramedChannel {
    fn post_message(&self, message: Message) -> anyhow::Result<()> {
        let frame = encode_frame(&message)?;
        trace!(len = frame.len(), "posting frame");
        self.frame_sender.send(frame)
            .map_err(|_| anyhow!("framed channel writer is closed"))
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let mut reader = match self.reader.try_lock() {
            Ok(r) => r,
            Err(_) => bail!("framed channel: receive loop is already running"),
        };

        if *cancel_receiver.borrow_and_update() {
            return Ok(());
        }

        debug!("starting framed receive loop");

        loop {
            tokio::select! {
                biased;
                _ = cancel_receiver.changed() => break,
                frame = read_frame(&mut **reader) => {
                    match frame? {
                        Some(message) => handler.handle_message(message).await?,
                        None => bail!("framed channel: peer closed the connection"),
                    }
                }
            }
        }

        debug!("framed receive loop cancelled");
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel_sender.send_replace(true);
    }

    fn supports_transfer(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;
    use serde_json::json;
    use crate::rpc::message::{MessageBody, Payload};
    use super::*;

    struct Forward(mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl MessageHandler for Forward {
        async fn handle_message(&self, message: Message) -> anyhow::Result<()> {
            self.0.send(message)?;
            Ok(())
        }
    }

    fn call(call_id: u64) -> Message {
        Message {
            source: "main".to_string(),
            target: "worker".to_string(),
            body: MessageBody::Call {
                action: "GetPage".to_string(),
                call_id,
                data: Payload::value(json!({"pageIndex": call_id})).with_binary(Bytes::from(vec![7u8; 1000])),
            },
        }
    }

    #[test]
    fn test_encode_frame_length_prefix() {
        let mut frame = encode_frame(&call(1)).unwrap();
        let len = frame.get_u32() as usize;
        assert_eq!(len, frame.remaining());
        assert_eq!(Message::deser(&mut frame).unwrap(), call(1));
    }

    #[tokio::test]
    async fn test_messages_cross_the_pipe() {
        let (a, b) = FramedChannel::duplex_pair(256);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let b2 = b.clone();
        let recv = tokio::spawn(async move { b2.recv_loop(Arc::new(Forward(tx))).await });

        for i in 0..10 {
            a.post_message(call(i)).unwrap();
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), call(i));
        }
        assert!(!a.supports_transfer());

        b.cancel_recv_loop();
        assert!(recv.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_garbage_ends_loop() {
        let (mut raw, other) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(other);
        let channel = FramedChannel::new(read, write);

        raw.write_all(&[0, 0, 0, 2, 9, 9]).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(channel.recv_loop(Arc::new(Forward(tx))).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_loop() {
        let (mut raw, other) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(other);
        let channel = FramedChannel::new(read, write);

        raw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(channel.recv_loop(Arc::new(Forward(tx))).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let (raw, other) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(other);
        let channel = FramedChannel::new(read, write);
        drop(raw);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(channel.recv_loop(Arc::new(Forward(tx))).await.is_err());
    }
}
