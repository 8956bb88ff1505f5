use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fleetd_hub::api::{self, ApiState};
use fleetd_hub::cache::{self, VehicleCache};
use fleetd_hub::config::{BrokerConfig, Config};
use fleetd_hub::fanout::{LiveFanout, DEFAULT_BUFFER_THRESHOLD};
use fleetd_hub::ingest::{mock::MockBrokerReceiver, mqtt::MqttReceiver, BrokerReceiver};
use fleetd_hub::pipeline::{run_ingest, IngestContext};
use fleetd_hub::rpc_service;
use fleetd_hub::state::HubState;
use fleetd_hub::store::{rollup, TelemetryStore};

#[derive(Parser)]
#[command(name = "fleetd-hub")]
#[command(about = "Fleet telemetry ingestion and distribution service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "fleetd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "fleetd_hub=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        http_port = config.http.port,
        subscription_topic = %config.subscription_topic,
        cache_limit = config.cache.limit,
        "Starting fleetd-hub"
    );

    let cancel = CancellationToken::new();

    let hub = HubState::new(config.message_window_ms);
    let store =
        TelemetryStore::open(&config.telemetry_db.path, config.telemetry_db.windows()).await?;
    info!(
        events = store.event_count().await?,
        vehicles = store.vehicle_count().await?,
        "Telemetry store opened"
    );

    let vehicle_cache = VehicleCache::new(config.cache.limit, config.cache.vehicle_ttl_ms);
    let fanout = LiveFanout::new(config.websocket.payload_version, DEFAULT_BUFFER_THRESHOLD);

    // The fan-out reads cache snapshots; the cache notifies the fan-out on
    // expiry. Both edges are injected so neither owns the other.
    let cache_for_snapshot = vehicle_cache.clone();
    fanout.set_snapshot_source(Box::new(move || cache_for_snapshot.values()));
    let fanout_for_expiry = fanout.clone();
    vehicle_cache.set_expiry_callback(Arc::new(move |vehicle_id, _entry| {
        fanout_for_expiry.broadcast_remove(vehicle_id);
    }));

    let sweeper_handle = cache::spawn_sweeper(vehicle_cache.clone(), cancel.child_token());

    let rollup_handle = rollup::spawn_scheduler(
        store.clone(),
        config.telemetry_db.windows(),
        config.telemetry_db.rollup_catch_up_windows,
        config.telemetry_db.rollup_interval_ms,
        cancel.child_token(),
    );

    let broker_rx = match &config.broker {
        BrokerConfig::Mqtt {
            host,
            port,
            username,
            password,
            use_tls,
            reject_unauthorized,
            client_id,
        } => {
            info!(%host, port, "Using MQTT broker source");
            let receiver = MqttReceiver {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
                use_tls: *use_tls,
                reject_unauthorized: *reject_unauthorized,
                client_id: client_id.clone(),
                topic: config.subscription_topic.clone(),
            };
            match receiver.start(cancel.child_token()).await {
                Ok(rx) => rx,
                Err(infallible) => match infallible {},
            }
        }
        BrokerConfig::Mock { vehicle_count, interval_ms } => {
            info!(vehicle_count, interval_ms, "Using mock broker source");
            let receiver = MockBrokerReceiver::new(*vehicle_count, *interval_ms);
            match receiver.start(cancel.child_token()).await {
                Ok(rx) => rx,
                Err(infallible) => match infallible {},
            }
        }
    };

    let ingest_ctx = IngestContext {
        cache: vehicle_cache.clone(),
        state: hub.clone(),
        store: store.clone(),
        fanout: fanout.clone(),
        topic_filter: config.subscription_topic.clone(),
    };
    let pipeline_handle = tokio::spawn(run_ingest(broker_rx, ingest_ctx, cancel.child_token()));

    let api_state = ApiState {
        cache: vehicle_cache.clone(),
        hub: hub.clone(),
        store: store.clone(),
        fanout: fanout.clone(),
    };

    let mut rpc_handle = None;
    if config.rpc.enabled {
        let rpc_addr = config.rpc_addr()?;
        let listener = TcpListener::bind(rpc_addr).await?;
        info!(%rpc_addr, "RPC server listening");
        let server = rpc_service::build_server(listener, api_state.clone(), &config.rpc);
        rpc_handle = Some(tokio::spawn(server.serve(cancel.child_token())));
    }

    let http_addr = config.http_addr();
    let app = api::router(api_state, &config.websocket.path);
    let http_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, ws_path = %config.websocket.path, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(http_listener, app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received termination signal, shutting down...");
        }
    }

    cancel.cancel();

    // Hard exit if graceful shutdown stalls.
    let watchdog = tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        error!("Graceful shutdown timed out, exiting");
        std::process::exit(1);
    });

    let _ = pipeline_handle.await;
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    let _ = rollup_handle.await;
    if let Some(handle) = rpc_handle {
        let _ = handle.await;
    }
    fanout.close_all();
    store.close().await;

    watchdog.abort();
    info!("fleetd-hub shut down complete");
    Ok(())
}
