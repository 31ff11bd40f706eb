// Runtime configuration
//
// Everything comes from the process environment; a dotenv loader or option
// parser in front of the process is expected to have populated it already.
// Defaults are deployment-tested values, not placeholders.

use crate::error::{NetError, Result};
use serde::Serialize;
use std::env;

/// One listen interface, optionally with a distinct advertised address:
/// `advertise@bind:port` or plain `bind:port`. A `ws://` scheme on the bind
/// address selects a WebSocket listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetInterface {
    pub advertise: String,
    pub bind: String,
}

impl NetInterface {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetError::Configuration("empty interface".to_string()));
        }
        let (advertise, bind) = match s.split_once('@') {
            Some((adv, bind)) => (adv.to_string(), bind.to_string()),
            None => (s.to_string(), s.to_string()),
        };
        if bind.is_empty() || advertise.is_empty() {
            return Err(NetError::Configuration(format!("invalid interface [{s}]")));
        }
        Ok(Self { advertise, bind })
    }

    pub fn is_websocket(&self) -> bool {
        self.bind.starts_with("ws://") || self.bind.starts_with("wss://")
    }

    /// Bind address with any WebSocket scheme and path stripped.
    pub fn bind_addr(&self) -> &str {
        let addr = self
            .bind
            .strip_prefix("ws://")
            .or_else(|| self.bind.strip_prefix("wss://"))
            .unwrap_or(&self.bind);
        match addr.find('/') {
            Some(i) => &addr[..i],
            None => addr,
        }
    }
}

/// Environment variables consumed by every node process.
#[derive(Debug, Clone, Serialize)]
pub struct Environ {
    pub app_env: String,
    pub game_id: String,
    #[serde(skip)]
    pub access_key: String,
    pub service_type: String,
    pub service_index: u16,
    pub service_dependency: Vec<String>,
    pub interfaces: Vec<NetInterface>,

    pub executor_capacity: usize,
    pub executor_concurrency: usize,
    pub context_inbound_size: usize,
    pub context_outbound_size: usize,
    pub endpoint_outbound_size: usize,

    /// Seconds between peer heartbeats.
    pub net_peer_ping_interval: u64,
    /// Seconds before an idle peer read times out.
    pub net_peer_read_timeout: u64,
    /// Seconds before an idle client session read times out.
    pub net_session_read_timeout: u64,
    /// Seconds an RPC may stay pending.
    pub net_rpc_timeout: u64,

    pub etcd_addr: String,
    pub etcd_keyspace: String,
    pub etcd_lease_ttl: i64,
}

impl Default for Environ {
    fn default() -> Self {
        Self {
            app_env: "dev".to_string(),
            game_id: String::new(),
            access_key: String::new(),
            service_type: String::new(),
            service_index: 1,
            service_dependency: Vec::new(),
            interfaces: Vec::new(),
            executor_capacity: 20_000,
            executor_concurrency: 1,
            context_inbound_size: 60_000,
            context_outbound_size: 8_000,
            endpoint_outbound_size: 1_000,
            net_peer_ping_interval: 10,
            net_peer_read_timeout: 100,
            net_session_read_timeout: 100,
            net_rpc_timeout: 60,
            etcd_addr: "http://127.0.0.1:2379".to_string(),
            etcd_keyspace: "/meshgate".to_string(),
            etcd_lease_ttl: 5,
        }
    }
}

fn env_string(key: &str, out: &mut String) {
    if let Ok(v) = env::var(key) {
        if !v.is_empty() {
            *out = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, out: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.trim().parse() {
            *out = parsed;
        }
    }
}

impl Environ {
    /// Load from the process environment on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut e = Environ::default();
        env_string("APP_ENV", &mut e.app_env);
        env_string("APP_GAME_ID", &mut e.game_id);
        env_string("APP_ACCESS_KEY", &mut e.access_key);
        env_string("APP_SERVICE_TYPE", &mut e.service_type);
        env_parse("APP_SERVICE_INDEX", &mut e.service_index);
        if let Ok(deps) = env::var("APP_SERVICE_DEPENDENCY") {
            e.service_dependency = deps
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(ifaces) = env::var("NET_INTERFACES") {
            e.interfaces = ifaces
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(NetInterface::parse)
                .collect::<Result<Vec<_>>>()?;
        }
        env_parse("RUNTIME_EXECUTOR_CAPACITY", &mut e.executor_capacity);
        env_parse("RUNTIME_EXECUTOR_CONCURRENCY", &mut e.executor_concurrency);
        env_parse("RUNTIME_CONTEXT_INBOUND_SIZE", &mut e.context_inbound_size);
        env_parse("RUNTIME_CONTEXT_OUTBOUND_SIZE", &mut e.context_outbound_size);
        env_parse("RUNTIME_ENDPOINT_OUTBOUND_SIZE", &mut e.endpoint_outbound_size);
        env_parse("NET_PEER_PING_INTERVAL", &mut e.net_peer_ping_interval);
        env_parse("NET_PEER_READ_TIMEOUT", &mut e.net_peer_read_timeout);
        env_parse("NET_SESSION_READ_TIMEOUT", &mut e.net_session_read_timeout);
        env_parse("NET_RPC_TIMEOUT_INTERVAL", &mut e.net_rpc_timeout);
        env_string("ETCD_ADDR", &mut e.etcd_addr);
        env_string("ETCD_KEYSPACE", &mut e.etcd_keyspace);
        env_parse("ETCD_LEASE_TTL", &mut e.etcd_lease_ttl);
        e.service_type = e.service_type.to_lowercase();
        Ok(e)
    }

    pub fn is_prod(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("prod")
    }
}
