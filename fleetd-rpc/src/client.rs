use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::{
    AggregateParams, AggregatesPage, Envelope, ErrorBody, FleetSnapshot, HistoryParams,
    LiveParams, RpcError, RpcHandle, RpcTcp, SnapshotParams, WireMessage,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("remote error: {0}")]
    Remote(#[from] ErrorBody),
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// Typed client over one fleetd-rpc connection. Answers keepalive pings in
/// the background.
pub struct Client {
    handle: RpcHandle,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let mut rpc = RpcTcp::new(stream, 256);
        let handle = rpc.handle();

        let pong_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rpc.recv().await {
                match envelope.payload {
                    WireMessage::Ping => {
                        if pong_handle
                            .reply(envelope.msg_id, WireMessage::Pong)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    other => {
                        tracing::debug!(?other, "unexpected rpc message on client");
                    }
                }
            }
        });

        Ok(Self { handle })
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), ClientError> {
        let reply = self.handle.call(WireMessage::Ping, timeout).await?;
        match reply.payload {
            WireMessage::Pong => Ok(()),
            WireMessage::Error(body) => Err(body.into()),
            _ => Err(ClientError::UnexpectedReply("ping")),
        }
    }

    pub async fn snapshot(
        &self,
        params: SnapshotParams,
        timeout: Duration,
    ) -> Result<FleetSnapshot, ClientError> {
        let reply = self
            .handle
            .call(WireMessage::SnapshotRequest(params), timeout)
            .await?;
        match reply.payload {
            WireMessage::SnapshotResponse(snapshot) => Ok(snapshot),
            WireMessage::Error(body) => Err(body.into()),
            _ => Err(ClientError::UnexpectedReply("snapshot")),
        }
    }

    pub async fn aggregates(
        &self,
        params: AggregateParams,
        timeout: Duration,
    ) -> Result<AggregatesPage, ClientError> {
        let reply = self
            .handle
            .call(WireMessage::AggregatesRequest(params), timeout)
            .await?;
        match reply.payload {
            WireMessage::AggregatesResponse(page) => Ok(page),
            WireMessage::Error(body) => Err(body.into()),
            _ => Err(ClientError::UnexpectedReply("aggregates")),
        }
    }

    /// Open a history stream: StreamMeta, events in ascending time order,
    /// StreamEnd when the page is exhausted.
    pub async fn history(&self, params: HistoryParams) -> Result<RpcStream, ClientError> {
        let rx = self
            .handle
            .call_stream(WireMessage::HistoryRequest(params), 64)
            .await?;
        Ok(RpcStream { rx })
    }

    /// Open a live snapshot stream: StreamMeta, then updates until the
    /// connection is dropped.
    pub async fn live(&self, params: LiveParams) -> Result<RpcStream, ClientError> {
        let rx = self
            .handle
            .call_stream(WireMessage::LiveRequest(params), 64)
            .await?;
        Ok(RpcStream { rx })
    }
}

/// Receiving end of a server stream. Yields raw payloads; `None` once the
/// stream has ended or the connection is gone.
pub struct RpcStream {
    rx: mpsc::Receiver<Envelope>,
}

impl RpcStream {
    pub async fn next(&mut self) -> Option<WireMessage> {
        self.rx.recv().await.map(|envelope| envelope.payload)
    }
}
