use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    AggregateParams, AggregatesPage, ErrorBody, FleetSnapshot, HistoryParams, LiveParams,
    MessageId, RpcError, RpcHandle, RpcTcp, SnapshotParams, StreamMeta, WireMessage,
};
use fleetd_core::{EnrichedVehicle, TelemetryEvent};

pub type UnaryHandler<Req, Res> = Box<
    dyn Fn(Req) -> Pin<Box<dyn Future<Output = Result<Res, ErrorBody>> + Send>> + Send + Sync,
>;

pub type StreamHandler<Req> =
    Box<dyn Fn(Req, StreamSink) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Writing end of one server stream. Every send replies to the request that
/// opened the stream; sends await outbound capacity, so a slow consumer
/// pauses the producer rather than growing a queue.
#[derive(Clone)]
pub struct StreamSink {
    handle: RpcHandle,
    request_id: MessageId,
    cancel: CancellationToken,
}

impl StreamSink {
    /// Out-of-band metadata; send before the first item.
    pub async fn meta(&self, meta: StreamMeta) -> Result<(), RpcError> {
        self.handle
            .reply(self.request_id, WireMessage::StreamMeta(meta))
            .await?;
        Ok(())
    }

    pub async fn history_event(&self, event: TelemetryEvent) -> Result<(), RpcError> {
        self.handle
            .reply(self.request_id, WireMessage::HistoryEvent(event))
            .await?;
        Ok(())
    }

    pub async fn live_update(&self, vehicle: EnrichedVehicle) -> Result<(), RpcError> {
        self.handle
            .reply(self.request_id, WireMessage::LiveUpdate(vehicle))
            .await?;
        Ok(())
    }

    pub async fn end(&self) -> Result<(), RpcError> {
        self.handle
            .reply(self.request_id, WireMessage::StreamEnd)
            .await?;
        Ok(())
    }

    pub async fn error(&self, error: ErrorBody) -> Result<(), RpcError> {
        self.handle
            .reply(self.request_id, WireMessage::Error(error))
            .await?;
        Ok(())
    }

    /// Fires when the connection closes or the server shuts down.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub struct Server {
    listener: TcpListener,
    buffer_size: usize,
    keepalive: Option<Keepalive>,
    handlers: ServerHandlers,
}

#[derive(Clone, Copy)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

struct ServerHandlers {
    on_snapshot: Option<UnaryHandler<SnapshotParams, FleetSnapshot>>,
    on_aggregates: Option<UnaryHandler<AggregateParams, AggregatesPage>>,
    on_history: Option<StreamHandler<HistoryParams>>,
    on_live: Option<StreamHandler<LiveParams>>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            buffer_size: 1024,
            keepalive: None,
            handlers: ServerHandlers {
                on_snapshot: None,
                on_aggregates: None,
                on_history: None,
                on_live: None,
            },
        }
    }

    pub fn with_buffer(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Ping each connection at `interval`; drop it when no pong arrives
    /// within `timeout`.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive = Some(Keepalive { interval, timeout });
        self
    }

    pub fn on_snapshot<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SnapshotParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FleetSnapshot, ErrorBody>> + Send + 'static,
    {
        self.handlers.on_snapshot = Some(Box::new(move |params| Box::pin(handler(params))));
        self
    }

    pub fn on_aggregates<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AggregateParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AggregatesPage, ErrorBody>> + Send + 'static,
    {
        self.handlers.on_aggregates = Some(Box::new(move |params| Box::pin(handler(params))));
        self
    }

    pub fn on_history<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HistoryParams, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on_history =
            Some(Box::new(move |params, sink| Box::pin(handler(params, sink))));
        self
    }

    pub fn on_live<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(LiveParams, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on_live =
            Some(Box::new(move |params, sink| Box::pin(handler(params, sink))));
        self
    }

    pub async fn serve(self, cancel: CancellationToken) {
        let handlers = Arc::new(self.handlers);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("rpc server shutdown requested");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!(%addr, "accepted rpc connection");
                            let handlers = handlers.clone();
                            let buffer_size = self.buffer_size;
                            let keepalive = self.keepalive;
                            let conn_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                Self::handle_connection(
                                    handlers, stream, buffer_size, keepalive, conn_cancel,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "error accepting rpc connection");
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        handlers: Arc<ServerHandlers>,
        stream: TcpStream,
        buffer_size: usize,
        keepalive: Option<Keepalive>,
        cancel: CancellationToken,
    ) {
        let mut rpc = RpcTcp::new(stream, buffer_size);
        let handle = rpc.handle();

        if let Some(ka) = keepalive {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ka.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // interval fires immediately; swallow the first tick
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if handle.call(WireMessage::Ping, ka.timeout).await.is_err() {
                                tracing::debug!("keepalive expired, dropping connection");
                                cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            });
        }

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                env = rpc.recv() => match env {
                    Some(env) => env,
                    None => {
                        tracing::debug!("rpc connection closed");
                        break;
                    }
                },
            };

            let msg_id = envelope.msg_id;
            match envelope.payload {
                WireMessage::Ping => {
                    if let Err(e) = handle.reply(msg_id, WireMessage::Pong).await {
                        tracing::error!(error = %e, "failed to send pong");
                    }
                }
                WireMessage::SnapshotRequest(params) => {
                    let reply = match &handlers.on_snapshot {
                        Some(handler) => match handler(params).await {
                            Ok(snapshot) => WireMessage::SnapshotResponse(snapshot),
                            Err(body) => WireMessage::Error(body),
                        },
                        None => WireMessage::Error(ErrorBody::internal("snapshot not served")),
                    };
                    if let Err(e) = handle.reply(msg_id, reply).await {
                        tracing::error!(error = %e, "failed to send snapshot reply");
                    }
                }
                WireMessage::AggregatesRequest(params) => {
                    let reply = match &handlers.on_aggregates {
                        Some(handler) => match handler(params).await {
                            Ok(page) => WireMessage::AggregatesResponse(page),
                            Err(body) => WireMessage::Error(body),
                        },
                        None => WireMessage::Error(ErrorBody::internal("aggregates not served")),
                    };
                    if let Err(e) = handle.reply(msg_id, reply).await {
                        tracing::error!(error = %e, "failed to send aggregates reply");
                    }
                }
                WireMessage::HistoryRequest(params) => {
                    let sink = StreamSink {
                        handle: handle.clone(),
                        request_id: msg_id,
                        cancel: cancel.child_token(),
                    };
                    match &handlers.on_history {
                        Some(handler) => {
                            tokio::spawn(handler(params, sink));
                        }
                        None => {
                            let _ = sink.error(ErrorBody::internal("history not served")).await;
                        }
                    }
                }
                WireMessage::LiveRequest(params) => {
                    let sink = StreamSink {
                        handle: handle.clone(),
                        request_id: msg_id,
                        cancel: cancel.child_token(),
                    };
                    match &handlers.on_live {
                        Some(handler) => {
                            tokio::spawn(handler(params, sink));
                        }
                        None => {
                            let _ = sink.error(ErrorBody::internal("live not served")).await;
                        }
                    }
                }
                WireMessage::Pong => {
                    tracing::debug!("received pong outside a keepalive exchange");
                }
                other => {
                    tracing::debug!(?other, "unexpected rpc message on server");
                }
            }
        }

        // Stops keepalive and any in-flight stream handlers for this
        // connection without touching sibling connections.
        cancel.cancel();
    }
}
