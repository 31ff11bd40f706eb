// Service discovery against the etcd v3 JSON gateway
//
// One task per service instance. On start it lists the service prefix,
// registers itself under a lease, then watches the prefix for peers coming
// and going. Losing the store drops every dependency and retries a full
// list+register every 1.5 s until the store answers again.

use crate::config::Environ;
use crate::error::{NetError, Result};
use crate::packet::NodeId;
use crate::protocol::NodeInfo;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Deadline on list/put/grant/revoke calls.
const OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between reconnect attempts after the store is lost.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(1500);
const DEFAULT_LEASE_TTL: i64 = 5;

/// The owning node's view of discovery events.
pub trait ServiceSink: Send + Sync {
    /// Record announced for this process.
    fn node_info(&self) -> NodeInfo;

    fn add_dependency(&self, info: &NodeInfo);

    /// `lost_all` means the store itself is gone; `node` is unset then.
    fn del_dependency(&self, lost_all: bool, node: NodeId);
}

pub struct EtcdDiscovery {
    me: Weak<EtcdDiscovery>,
    endpoint: String,
    keyspace: String,
    lease_ttl: i64,
    client: reqwest::Client,
    lease_id: AtomicI64,
    sink: Weak<dyn ServiceSink>,
    done_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdDiscovery {
    pub fn new(env: &Environ, sink: Weak<dyn ServiceSink>) -> Arc<Self> {
        let endpoint = env
            .etcd_addr
            .split(',')
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        let lease_ttl = if env.etcd_lease_ttl > 0 {
            env.etcd_lease_ttl
        } else {
            DEFAULT_LEASE_TTL
        };
        // No client-wide timeout: the watch response streams indefinitely.
        // Unary calls are individually bounded by OP_TIMEOUT instead.
        let client = reqwest::Client::new();
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            endpoint,
            keyspace: format!("{}/service", env.etcd_keyspace.trim_end_matches('/')),
            lease_ttl,
            client,
            lease_id: AtomicI64::new(0),
            sink,
            done_tx,
            handle: Mutex::new(None),
        })
    }

    /// List the prefix, register this node, and start the serve task.
    pub async fn start(&self) -> Result<()> {
        self.bootstrap().await?;
        let discovery = self
            .me
            .upgrade()
            .ok_or_else(|| NetError::Discovery("discovery dropped".to_string()))?;
        let handle = tokio::spawn(async move { discovery.serve().await });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.done_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.revoke().await;
    }

    // ------------------------------------------------------------------
    // etcd JSON gateway plumbing
    // ------------------------------------------------------------------

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.endpoint, path);
        let send = self.client.post(&url).json(&body).send();
        let response = tokio::time::timeout(OP_TIMEOUT, send)
            .await
            .map_err(|_| NetError::Timeout(format!("etcd {path}")))?
            .map_err(|e| NetError::Discovery(format!("etcd {path}: {e}")))?;
        if !response.status().is_success() {
            return Err(NetError::Discovery(format!(
                "etcd {path}: status {}",
                response.status()
            )));
        }
        let value = tokio::time::timeout(OP_TIMEOUT, response.json())
            .await
            .map_err(|_| NetError::Timeout(format!("etcd {path}")))?
            .map_err(|e| NetError::Discovery(format!("etcd {path}: {e}")))?;
        Ok(value)
    }

    async fn kv_range(&self, key: &str, range_end: Option<&str>) -> Result<Vec<(String, String)>> {
        let mut req = serde_json::json!({ "key": BASE64.encode(key) });
        if let Some(end) = range_end {
            req["range_end"] = serde_json::Value::from(BASE64.encode(end));
        }
        let value = self.post_json("/v3/kv/range", req).await?;
        let mut out = Vec::new();
        if let Some(kvs) = value["kvs"].as_array() {
            for kv in kvs {
                let key = decode_b64_str(kv["key"].as_str().unwrap_or_default());
                let val = decode_b64_str(kv["value"].as_str().unwrap_or_default());
                out.push((key, val));
            }
        }
        Ok(out)
    }

    async fn lease_grant(&self) -> Result<i64> {
        let value = self
            .post_json("/v3/lease/grant", serde_json::json!({ "TTL": self.lease_ttl }))
            .await?;
        parse_etcd_int(&value["ID"])
            .ok_or_else(|| NetError::Discovery("lease grant returned no id".to_string()))
    }

    async fn lease_keepalive(&self) -> Result<()> {
        let id = self.lease_id.load(Ordering::Acquire);
        if id == 0 {
            return Err(NetError::Discovery("no lease to keep alive".to_string()));
        }
        let value = self
            .post_json("/v3/lease/keepalive", serde_json::json!({ "ID": id }))
            .await?;
        let ttl = parse_etcd_int(&value["result"]["TTL"]).unwrap_or(0);
        if ttl <= 0 {
            return Err(NetError::Discovery(format!("lease {id} expired")));
        }
        Ok(())
    }

    async fn revoke(&self) {
        let id = self.lease_id.swap(0, Ordering::AcqRel);
        if id == 0 {
            return;
        }
        let revoke = self.post_json("/v3/lease/revoke", serde_json::json!({ "ID": id }));
        match tokio::time::timeout(Duration::from_secs(1), revoke).await {
            Ok(Err(err)) => tracing::error!("revoke lease {id}: {err}"),
            Err(_) => tracing::error!("revoke lease {id}: timed out"),
            Ok(Ok(_)) => {}
        }
    }

    // ------------------------------------------------------------------
    // Registration and watch
    // ------------------------------------------------------------------

    /// Full list + register pass, run at start and after every reconnect.
    async fn bootstrap(&self) -> Result<()> {
        let prefix = format!("{}/", self.keyspace);
        let kvs = self
            .kv_range(&prefix, Some(&prefix_range_end(&prefix)))
            .await?;
        if let Some(sink) = self.sink.upgrade() {
            for (key, value) in &kvs {
                self.apply_record(&sink, key, value);
            }
        }
        self.register().await
    }

    async fn register(&self) -> Result<()> {
        let sink = self
            .sink
            .upgrade()
            .ok_or_else(|| NetError::Discovery("service sink dropped".to_string()))?;
        let info = sink.node_info();
        let key = format!("{}/{}", self.keyspace, NodeId(info.node));

        let existing = self.kv_range(&key, None).await?;
        if !existing.is_empty() {
            return Err(NetError::DuplicateRegistration(key));
        }

        let lease = self.lease_grant().await?;
        self.lease_id.store(lease, Ordering::Release);

        let value = serde_json::to_string(&info)?;
        self.post_json(
            "/v3/kv/put",
            serde_json::json!({
                "key": BASE64.encode(&key),
                "value": BASE64.encode(&value),
                "lease": lease,
            }),
        )
        .await?;
        tracing::info!("registered {key} under lease {lease}");
        Ok(())
    }

    fn apply_record(&self, sink: &Arc<dyn ServiceSink>, key: &str, value: &str) {
        match serde_json::from_str::<NodeInfo>(value) {
            Ok(info) => sink.add_dependency(&info),
            Err(err) => tracing::error!("bad discovery record {key}: {err}"),
        }
    }

    fn apply_delete(&self, sink: &Arc<dyn ServiceSink>, key: &str) {
        match parse_node_key(key) {
            Some(node) => sink.del_dependency(false, node),
            None => tracing::error!("cannot parse node id from key {key}"),
        }
    }

    /// Handle one watch-stream JSON payload.
    fn process_watch_payload(&self, payload: &serde_json::Value) {
        let Some(sink) = self.sink.upgrade() else {
            return;
        };
        let Some(events) = payload["result"]["events"].as_array() else {
            return;
        };
        for event in events {
            let key = decode_b64_str(event["kv"]["key"].as_str().unwrap_or_default());
            if event["type"].as_str() == Some("DELETE") {
                self.apply_delete(&sink, &key);
            } else {
                let value = decode_b64_str(event["kv"]["value"].as_str().unwrap_or_default());
                self.apply_record(&sink, &key, &value);
            }
        }
    }

    async fn open_watch(&self) -> Result<reqwest::Response> {
        let prefix = format!("{}/", self.keyspace);
        let req = serde_json::json!({
            "create_request": {
                "key": BASE64.encode(&prefix),
                "range_end": BASE64.encode(&prefix_range_end(&prefix)),
            }
        });
        let url = format!("{}/v3/watch", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| NetError::Discovery(format!("etcd watch: {e}")))?;
        if !response.status().is_success() {
            return Err(NetError::Discovery(format!(
                "etcd watch: status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn serve(self: Arc<Self>) {
        let mut done = self.done_tx.subscribe();
        let keepalive_every = Duration::from_secs((self.lease_ttl as u64 / 2).max(1));
        'outer: loop {
            let mut watch = match self.open_watch().await {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!("{err}");
                    if !self.reconnect_until_ready(&mut done).await {
                        break 'outer;
                    }
                    continue;
                }
            };
            let mut buffer: Vec<u8> = Vec::new();
            let mut keepalive = tokio::time::interval(keepalive_every);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = keepalive.tick() => {
                        if let Err(err) = self.lease_keepalive().await {
                            tracing::error!("lost contact with etcd [{}]: {err}", self.endpoint);
                            break;
                        }
                    }
                    chunk = watch.chunk() => match chunk {
                        Ok(Some(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            self.drain_watch_lines(&mut buffer);
                        }
                        Ok(None) => {
                            tracing::error!("etcd watch stream ended");
                            break;
                        }
                        Err(err) => {
                            tracing::error!("etcd watch stream: {err}");
                            break;
                        }
                    },
                    _ = done.changed() => break 'outer,
                }
            }
            // Connectivity lost: drop everything and retry from scratch.
            if let Some(sink) = self.sink.upgrade() {
                sink.del_dependency(true, NodeId::ZERO);
            }
            if !self.reconnect_until_ready(&mut done).await {
                break 'outer;
            }
        }
    }

    fn drain_watch_lines(&self, buffer: &mut Vec<u8>) {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(payload) => self.process_watch_payload(&payload),
                Err(err) => tracing::error!("bad watch payload: {err}"),
            }
        }
    }

    /// Retry list+register every 1.5 s. False means shutdown interrupted.
    async fn reconnect_until_ready(&self, done: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {
                    match self.bootstrap().await {
                        Ok(()) => return true,
                        Err(err) => tracing::error!("reconnect etcd: {err}"),
                    }
                }
                _ = done.changed() => return false,
            }
        }
    }
}

fn decode_b64_str(data: &str) -> String {
    BASE64
        .decode(data)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .unwrap_or_default()
}

/// etcd integers come back as JSON strings; tolerate both.
fn parse_etcd_int(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// The hex node id after the last '/' of a discovery key.
fn parse_node_key(key: &str) -> Option<NodeId> {
    let suffix = key.rsplit('/').next()?;
    suffix.parse().ok()
}

/// Smallest key strictly greater than every key with this prefix.
fn prefix_range_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        if *last < 255 {
            *last += 1;
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|_| format!("{prefix}~"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingSink {
        added: PlMutex<Vec<NodeInfo>>,
        deleted: PlMutex<Vec<(bool, NodeId)>>,
    }

    impl ServiceSink for RecordingSink {
        fn node_info(&self) -> NodeInfo {
            NodeInfo {
                node: NodeId::backend(5, 1).0,
                interface: "127.0.0.1:9100".to_string(),
            }
        }

        fn add_dependency(&self, info: &NodeInfo) {
            self.added.lock().push(info.clone());
        }

        fn del_dependency(&self, lost_all: bool, node: NodeId) {
            self.deleted.lock().push((lost_all, node));
        }
    }

    fn fixture() -> (Arc<RecordingSink>, Arc<EtcdDiscovery>) {
        let sink = Arc::new(RecordingSink::default());
        let sink_dyn: Arc<dyn ServiceSink> = sink.clone();
        let weak: Weak<dyn ServiceSink> = Arc::downgrade(&sink_dyn);
        let env = Environ::default();
        let discovery = EtcdDiscovery::new(&env, weak);
        (sink, discovery)
    }

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end("/meshgate/service/"), "/meshgate/service0");
        assert_eq!(prefix_range_end("a"), "b");
    }

    #[test]
    fn node_key_parsing() {
        assert_eq!(
            parse_node_key("/meshgate/service/050001"),
            Some(NodeId::backend(5, 1))
        );
        assert_eq!(parse_node_key("/meshgate/service/zzz"), None);
    }

    #[test]
    fn etcd_int_parsing() {
        assert_eq!(parse_etcd_int(&serde_json::json!(7)), Some(7));
        assert_eq!(parse_etcd_int(&serde_json::json!("7696581588605")), Some(7696581588605));
        assert_eq!(parse_etcd_int(&serde_json::json!(null)), None);
    }

    #[test]
    fn watch_payload_put_and_delete() {
        let (sink, discovery) = fixture();
        let info = NodeInfo {
            node: NodeId::backend(6, 2).0,
            interface: "10.0.0.2:9200".to_string(),
        };
        let key = BASE64.encode("/meshgate/service/060002");
        let value = BASE64.encode(serde_json::to_string(&info).unwrap());
        let payload = serde_json::json!({
            "result": {
                "events": [
                    { "kv": { "key": key, "value": value } },
                    { "type": "DELETE", "kv": { "key": BASE64.encode("/meshgate/service/060003") } },
                ]
            }
        });
        discovery.process_watch_payload(&payload);

        assert_eq!(sink.added.lock().as_slice(), &[info]);
        assert_eq!(
            sink.deleted.lock().as_slice(),
            &[(false, NodeId::backend(6, 3))]
        );
    }

    #[test]
    fn watch_lines_split_on_newlines() {
        let (sink, discovery) = fixture();
        let info = NodeInfo {
            node: NodeId::backend(7, 1).0,
            interface: String::new(),
        };
        let payload = serde_json::json!({
            "result": { "events": [
                { "kv": {
                    "key": BASE64.encode("/meshgate/service/070001"),
                    "value": BASE64.encode(serde_json::to_string(&info).unwrap()),
                } }
            ] }
        });
        let mut buffer = Vec::new();
        let line = serde_json::to_string(&payload).unwrap();
        // First half of the line: nothing should be processed yet.
        buffer.extend_from_slice(&line.as_bytes()[..10]);
        discovery.drain_watch_lines(&mut buffer);
        assert!(sink.added.lock().is_empty());

        buffer.extend_from_slice(&line.as_bytes()[10..]);
        buffer.push(b'\n');
        discovery.drain_watch_lines(&mut buffer);
        assert_eq!(sink.added.lock().len(), 1);
        assert!(buffer.is_empty());
    }
}
