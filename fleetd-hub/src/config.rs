use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub broker: BrokerConfig,
    /// Topic filter the ingest pipeline subscribes to.
    pub subscription_topic: String,
    pub http: HttpConfig,
    pub cache: CacheConfig,
    /// Horizon of the message-rate window, in milliseconds.
    pub message_window_ms: u64,
    pub telemetry_db: TelemetryDbConfig,
    pub rpc: RpcConfig,
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrokerConfig {
    Mqtt {
        #[serde(default = "defaults::broker_host")]
        host: String,
        #[serde(default = "defaults::broker_port")]
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        use_tls: bool,
        #[serde(default = "defaults::yes")]
        reject_unauthorized: bool,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// In-process synthetic source for development and tests.
    Mock {
        #[serde(default = "defaults::mock_vehicle_count")]
        vehicle_count: usize,
        #[serde(default = "defaults::mock_interval_ms")]
        interval_ms: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of vehicles held in memory.
    pub limit: usize,
    /// Entries idle longer than this are expired; 0 disables expiry.
    pub vehicle_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryDbConfig {
    /// SQLite database path; `:memory:` keeps everything in process.
    pub path: String,
    /// Base rollup window, seconds.
    pub rollup_window_seconds: u32,
    /// Additional materialised windows, seconds.
    pub rollup_windows: Vec<u32>,
    pub rollup_interval_ms: u64,
    /// How many already-processed windows each pass recomputes.
    pub rollup_catch_up_windows: u32,
}

impl TelemetryDbConfig {
    /// All materialised windows, deduplicated and non-zero, base window
    /// first.
    pub fn windows(&self) -> Vec<u32> {
        let mut windows = Vec::new();
        let all = std::iter::once(self.rollup_window_seconds)
            .chain(self.rollup_windows.iter().copied());
        for w in all {
            if w > 0 && !windows.contains(&w) {
                windows.push(w);
            }
        }
        if windows.is_empty() {
            windows.push(300);
        }
        windows
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Poll interval of the live snapshot stream.
    pub stream_interval_ms: u64,
    /// Metadata heartbeat when a live stream has been silent this long.
    pub stream_heartbeat_ms: u64,
    pub keepalive_time_ms: u64,
    pub keepalive_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub path: String,
    pub payload_version: u32,
}

mod defaults {
    pub fn broker_host() -> String {
        "localhost".to_owned()
    }
    pub fn broker_port() -> u16 {
        1883
    }
    pub fn yes() -> bool {
        true
    }
    pub fn mock_vehicle_count() -> usize {
        5
    }
    pub fn mock_interval_ms() -> u64 {
        2000
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            subscription_topic: "fleet/+/telemetry".to_owned(),
            http: HttpConfig::default(),
            cache: CacheConfig::default(),
            message_window_ms: 60_000,
            telemetry_db: TelemetryDbConfig::default(),
            rpc: RpcConfig::default(),
            websocket: WebsocketConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig::Mqtt {
            host: defaults::broker_host(),
            port: defaults::broker_port(),
            username: None,
            password: None,
            use_tls: false,
            reject_unauthorized: true,
            client_id: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { limit: 1000, vehicle_ttl_ms: 60_000 }
    }
}

impl Default for TelemetryDbConfig {
    fn default() -> Self {
        Self {
            path: "fleetd-telemetry.db".to_owned(),
            rollup_window_seconds: 300,
            rollup_windows: Vec::new(),
            rollup_interval_ms: 60_000,
            rollup_catch_up_windows: 1,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_owned(),
            port: 9090,
            stream_interval_ms: 1000,
            stream_heartbeat_ms: 15_000,
            keepalive_time_ms: 30_000,
            keepalive_timeout_ms: 10_000,
        }
    }
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self { path: "/stream".to_owned(), payload_version: 1 }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http.port))
    }

    pub fn rpc_addr(&self) -> color_eyre::Result<SocketAddr> {
        let addr = format!("{}:{}", self.rpc.host, self.rpc.port).parse()?;
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.subscription_topic, "fleet/+/telemetry");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.cache.limit, 1000);
        assert_eq!(config.cache.vehicle_ttl_ms, 60_000);
        assert_eq!(config.message_window_ms, 60_000);
        assert_eq!(config.telemetry_db.rollup_window_seconds, 300);
        assert_eq!(config.telemetry_db.rollup_interval_ms, 60_000);
        assert_eq!(config.telemetry_db.rollup_catch_up_windows, 1);
        assert_eq!(config.websocket.path, "/stream");
        assert_eq!(config.websocket.payload_version, 1);
    }

    #[test]
    fn parses_a_full_toml_document() {
        let toml = r#"
            subscription_topic = "fleet/+/telemetry"
            message_window_ms = 30000

            [broker]
            type = "mqtt"
            host = "broker.internal"
            port = 8883
            username = "ingest"
            password = "secret"
            use_tls = true

            [http]
            port = 9080

            [cache]
            limit = 250
            vehicle_ttl_ms = 10000

            [telemetry_db]
            path = ":memory:"
            rollup_window_seconds = 60
            rollup_windows = [300, 3600]

            [rpc]
            enabled = false

            [websocket]
            path = "/live"
        "#;
        let config: Config = toml::from_str(toml).unwrap();

        match &config.broker {
            BrokerConfig::Mqtt { host, port, use_tls, reject_unauthorized, .. } => {
                assert_eq!(host, "broker.internal");
                assert_eq!(*port, 8883);
                assert!(use_tls);
                assert!(reject_unauthorized);
            }
            other => panic!("unexpected broker config: {other:?}"),
        }
        assert_eq!(config.cache.limit, 250);
        assert_eq!(config.telemetry_db.windows(), vec![60, 300, 3600]);
        assert!(!config.rpc.enabled);
        assert_eq!(config.websocket.path, "/live");
    }

    #[test]
    fn windows_deduplicate_and_keep_the_base_first() {
        let db = TelemetryDbConfig {
            rollup_window_seconds: 300,
            rollup_windows: vec![300, 60, 0, 60],
            ..TelemetryDbConfig::default()
        };
        assert_eq!(db.windows(), vec![300, 60]);
    }
}
