use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, BufReader, BufWriter},
    sync::{mpsc, oneshot},
};

use crate::{read_frame, write_frame, Envelope, MessageId, WireMessage};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("send error: {0}")]
    SendError(#[source] Box<mpsc::error::SendError<Envelope>>),
    #[error("response channel closed: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
    #[error("timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

impl From<mpsc::error::SendError<Envelope>> for RpcError {
    fn from(err: mpsc::error::SendError<Envelope>) -> Self {
        RpcError::SendError(Box::new(err))
    }
}

enum Waiter {
    /// A unary call; resolved by the first reply.
    Unary(oneshot::Sender<Envelope>),
    /// A stream; fed every reply until a stream-ending payload arrives.
    Stream(mpsc::Sender<Envelope>),
}

/// Cloneable sending half of a connection: outbound queue plus the table of
/// callers waiting on replies.
#[derive(Clone)]
pub struct RpcHandle {
    tx: mpsc::Sender<Envelope>,
    pending: Arc<DashMap<MessageId, Waiter>>,
}

impl RpcHandle {
    /// Fire-and-forget send; no reply is expected.
    pub async fn send(&self, payload: WireMessage) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        self.tx
            .send(Envelope { msg_id, reply_to: None, payload })
            .await?;
        Ok(msg_id)
    }

    /// Reply to a previously received message. Stream items reply to the
    /// request that opened the stream; the send awaits outbound capacity,
    /// which is the per-call backpressure signal.
    pub async fn reply(
        &self,
        request_msg_id: MessageId,
        payload: WireMessage,
    ) -> Result<MessageId, RpcError> {
        let msg_id = MessageId::new();
        self.tx
            .send(Envelope { msg_id, reply_to: Some(request_msg_id), payload })
            .await?;
        Ok(msg_id)
    }

    /// Unary round trip with a deadline.
    pub async fn call(
        &self,
        payload: WireMessage,
        timeout: Duration,
    ) -> Result<Envelope, RpcError> {
        let msg_id = MessageId::new();
        let (tx_wait, rx_wait) = oneshot::channel();
        self.pending.insert(msg_id, Waiter::Unary(tx_wait));

        let env = Envelope { msg_id, reply_to: None, payload };
        if let Err(e) = self.tx.send(env).await {
            self.pending.remove(&msg_id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx_wait).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(closed)) => Err(RpcError::ChannelClosed(closed)),
            Err(elapsed) => {
                self.pending.remove(&msg_id);
                Err(RpcError::Timeout(elapsed))
            }
        }
    }

    /// Open a server stream. Every reply to the request is delivered on the
    /// returned channel; the entry is cleared when a stream-ending payload
    /// arrives or the receiver is dropped.
    pub async fn call_stream(
        &self,
        payload: WireMessage,
        buffer: usize,
    ) -> Result<mpsc::Receiver<Envelope>, RpcError> {
        let msg_id = MessageId::new();
        let (tx_items, rx_items) = mpsc::channel(buffer);
        self.pending.insert(msg_id, Waiter::Stream(tx_items));

        let env = Envelope { msg_id, reply_to: None, payload };
        if let Err(e) = self.tx.send(env).await {
            self.pending.remove(&msg_id);
            return Err(e.into());
        }

        Ok(rx_items)
    }
}

/// One framed connection: spawns reader and writer tasks over the stream and
/// routes replies back to waiting callers.
pub struct RpcTcp {
    handle: RpcHandle,
    rx: mpsc::Receiver<Envelope>,
}

impl RpcTcp {
    pub fn new<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let (tx_out, mut rx_out) = mpsc::channel::<Envelope>(buffer);
        let (tx_in, rx_in) = mpsc::channel::<Envelope>(buffer);

        let pending: Arc<DashMap<MessageId, Waiter>> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(msg) = rx_out.recv().await {
                if let Err(e) = write_frame(&mut writer, &msg).await {
                    tracing::debug!(error = %e, "writer task stopped");
                    break;
                }
            }
        });

        let pending_clone = pending.clone();
        tokio::spawn(async move {
            loop {
                let msg = match read_frame(&mut reader).await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!(error = %e, "reader task stopped");
                        break;
                    }
                };

                if let Some(reply_to) = msg.reply_to {
                    let ends = msg.payload.ends_stream();

                    // Clone the stream sender out of the map so no shard
                    // guard is held across the await below.
                    let stream_tx = match pending_clone.get(&reply_to) {
                        Some(entry) => match entry.value() {
                            Waiter::Unary(_) => None,
                            Waiter::Stream(tx) => Some(tx.clone()),
                        },
                        None => {
                            tracing::warn!("no waiter found for reply");
                            continue;
                        }
                    };

                    match stream_tx {
                        Some(tx) => {
                            let delivered = tx.send(msg).await.is_ok();
                            if ends || !delivered {
                                pending_clone.remove(&reply_to);
                            }
                        }
                        None => {
                            if let Some((_, Waiter::Unary(tx))) = pending_clone.remove(&reply_to) {
                                let _ = tx.send(msg);
                            }
                        }
                    }
                    continue;
                }

                if tx_in.send(msg).await.is_err() {
                    break;
                }
            }
            // Connection gone: fail every outstanding waiter.
            pending_clone.clear();
        });

        Self {
            handle: RpcHandle { tx: tx_out, pending },
            rx: rx_in,
        }
    }

    /// Cloneable sending half.
    pub fn handle(&self) -> RpcHandle {
        self.handle.clone()
    }

    /// Next message that is not a reply to an outstanding call.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}
