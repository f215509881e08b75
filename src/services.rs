use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::ScopedDb;
use crate::errors::{MultiplexError, MultiplexResult};
use crate::privval::PrivValidator;

pub const SERVICE_PROXY_APP: &str = "proxyApp";
pub const SERVICE_EVENT_BUS: &str = "eventBus";
pub const SERVICE_INDEXER: &str = "indexerService";

/// A startable node subsystem tracked by the service registry.
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self) -> MultiplexResult<()>;
    fn stop(&self) -> MultiplexResult<()>;
    fn is_running(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Event bus

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum Event {
    NewBlock {
        height: u64,
        hash: String,
        num_txs: usize,
    },
    Tx {
        hash: String,
        height: u64,
    },
}

/// Publish/subscribe fabric for one chain's block and tx events.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    running: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            sender,
            running: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishing to a bus nobody listens to is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn publish_new_block(&self, height: u64, hash: String, num_txs: usize) {
        self.publish(Event::NewBlock {
            height,
            hash,
            num_txs,
        });
    }

    pub fn publish_tx(&self, hash: String, height: u64) {
        self.publish(Event::Tx { hash, height });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for EventBus {
    fn name(&self) -> &'static str {
        SERVICE_EVENT_BUS
    }

    fn start(&self) -> MultiplexResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> MultiplexResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Indexer service

#[derive(Debug, Serialize, Deserialize)]
struct IndexedBlock {
    height: u64,
    hash: String,
    num_txs: usize,
}

fn block_index_key(height: u64) -> Vec<u8> {
    format!("block-height:{height}").into_bytes()
}

fn tx_index_key(hash: &str) -> Vec<u8> {
    format!("tx-hash:{hash}").into_bytes()
}

/// Consumes the event bus and maintains the tx and block indexes in the
/// scope's indexer database.
pub struct IndexerService {
    chain_id: String,
    db: ScopedDb,
    bus: Arc<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl IndexerService {
    pub fn new(chain_id: impl Into<String>, db: ScopedDb, bus: Arc<EventBus>) -> Self {
        Self {
            chain_id: chain_id.into(),
            db,
            bus,
            task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn index_event(db: &ScopedDb, event: &Event) -> MultiplexResult<()> {
        match event {
            Event::NewBlock {
                height,
                hash,
                num_txs,
            } => {
                let record = IndexedBlock {
                    height: *height,
                    hash: hash.clone(),
                    num_txs: *num_txs,
                };
                db.set(&block_index_key(*height), &bincode::serialize(&record)?)
            }
            Event::Tx { hash, height } => {
                db.set(&tx_index_key(hash), &height.to_be_bytes())
            }
        }
    }

    pub fn indexed_block(&self, height: u64) -> MultiplexResult<Option<(String, usize)>> {
        match self.db.get(&block_index_key(height))? {
            Some(bytes) => {
                let record: IndexedBlock = bincode::deserialize(&bytes)?;
                Ok(Some((record.hash, record.num_txs)))
            }
            None => Ok(None),
        }
    }

    pub fn tx_height(&self, tx_hash: &str) -> MultiplexResult<Option<u64>> {
        match self.db.get(&tx_index_key(tx_hash))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    MultiplexError::Config("invalid tx index encoding".to_string())
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }
}

impl Service for IndexerService {
    fn name(&self) -> &'static str {
        SERVICE_INDEXER
    }

    fn start(&self) -> MultiplexResult<()> {
        let mut receiver = self.bus.subscribe();
        let db = self.db.clone();
        let chain_id = self.chain_id.clone();
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(err) = IndexerService::index_event(&db, &event) {
                            warn!(%chain_id, %err, "failed to index event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%chain_id, skipped, "indexer lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> MultiplexResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// ABCI proxy connections

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryResponse {
    pub code: u32,
    pub value: Vec<u8>,
    pub log: String,
}

impl QueryResponse {
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            code: 0,
            value,
            log: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// The application state machine behind the proxy connections.
pub trait Application: Send + Sync {
    fn query(&self, path: &str, data: &[u8]) -> QueryResponse;
}

/// Application that acknowledges every query; the default local backend.
pub struct EchoApplication;

impl Application for EchoApplication {
    fn query(&self, _path: &str, data: &[u8]) -> QueryResponse {
        QueryResponse::ok(data.to_vec())
    }
}

/// Where the proxy connections are dialed to.
#[derive(Clone)]
pub enum ClientCreator {
    Local(Arc<dyn Application>),
    Socket(String),
}

impl ClientCreator {
    /// Resolves the configured `proxy_app` endpoint.
    pub fn from_config(proxy_app: &str) -> Self {
        match proxy_app {
            "" | "local" | "echo" => ClientCreator::Local(Arc::new(EchoApplication)),
            addr => ClientCreator::Socket(addr.to_string()),
        }
    }
}

/// The client connection group to one chain's application.
pub struct AppConns {
    creator: ClientCreator,
    running: AtomicBool,
}

impl AppConns {
    pub fn new(creator: ClientCreator) -> Self {
        Self {
            creator,
            running: AtomicBool::new(false),
        }
    }

    pub fn query(&self, path: &str, data: &[u8]) -> MultiplexResult<QueryResponse> {
        match &self.creator {
            ClientCreator::Local(app) => Ok(app.query(path, data)),
            ClientCreator::Socket(addr) => socket_query(addr, path, data),
        }
    }
}

fn socket_query(addr: &str, path: &str, data: &[u8]) -> MultiplexResult<QueryResponse> {
    let addr = addr.strip_prefix("tcp://").unwrap_or(addr);
    let mut stream = TcpStream::connect(addr).map_err(|err| {
        MultiplexError::Config(format!("failed to reach proxy app at {addr}: {err}"))
    })?;
    let request = serde_json::json!({
        "type": "query",
        "path": path,
        "data": hex::encode(data),
    });
    let mut line = request.to_string();
    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&mut stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    let parsed: serde_json::Value = serde_json::from_str(&response)
        .map_err(|err| MultiplexError::Config(format!("invalid proxy app response: {err}")))?;
    let code = parsed.get("code").and_then(serde_json::Value::as_u64).unwrap_or(0) as u32;
    let value = parsed
        .get("value")
        .and_then(serde_json::Value::as_str)
        .map(hex::decode)
        .transpose()
        .map_err(|err| MultiplexError::Config(format!("invalid proxy app value: {err}")))?
        .unwrap_or_default();
    let log = parsed
        .get("log")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(QueryResponse { code, value, log })
}

impl Service for AppConns {
    fn name(&self) -> &'static str {
        SERVICE_PROXY_APP
    }

    fn start(&self) -> MultiplexResult<()> {
        if let ClientCreator::Socket(addr) = &self.creator {
            let raw = addr.strip_prefix("tcp://").unwrap_or(addr);
            TcpStream::connect(raw).map_err(|err| {
                MultiplexError::Config(format!("failed to reach proxy app at {addr}: {err}"))
            })?;
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> MultiplexResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Peer filters

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: String,
    pub remote_addr: String,
}

pub type PeerFilterFn = Arc<dyn Fn(&PeerInfo) -> MultiplexResult<()> + Send + Sync>;

/// Builds the ABCI-query-based connection and peer filters installed
/// when `filter_peers` is set: the application must answer the
/// `/p2p/filter/...` queries with code zero for a peer to be admitted.
pub fn abci_peer_filters(proxy_app: Arc<AppConns>) -> Vec<PeerFilterFn> {
    let addr_filter: PeerFilterFn = {
        let proxy_app = proxy_app.clone();
        Arc::new(move |peer: &PeerInfo| {
            let response =
                proxy_app.query(&format!("/p2p/filter/addr/{}", peer.remote_addr), &[])?;
            if response.is_ok() {
                Ok(())
            } else {
                Err(MultiplexError::Config(format!(
                    "peer addr {} rejected by application: {}",
                    peer.remote_addr, response.log
                )))
            }
        })
    };
    let id_filter: PeerFilterFn = Arc::new(move |peer: &PeerInfo| {
        let response = proxy_app.query(&format!("/p2p/filter/id/{}", peer.id), &[])?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(MultiplexError::Config(format!(
                "peer id {} rejected by application: {}",
                peer.id, response.log
            )))
        }
    });
    vec![addr_filter, id_filter]
}

// ----------------------------------------------------------------------------
// Registries

/// Two-level registry: scope hash → service name → service handle.
///
/// Written from per-chain startup tasks, read from request paths. The
/// mutex is held only across map access.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<HashMap<String, HashMap<String, Arc<dyn Service>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scope_hash: &str, name: &str, service: Arc<dyn Service>) {
        let mut inner = self.inner.lock();
        let services = inner.entry(scope_hash.to_string()).or_default();
        if services.insert(name.to_string(), service).is_some() {
            warn!(scope = %scope_hash, service = %name, "service overwritten in registry");
        }
    }

    /// Panics on an unknown scope or name: readers must not race the
    /// per-scope startup signal, so a miss is a programmer error.
    pub fn get(&self, scope_hash: &str, name: &str) -> Arc<dyn Service> {
        let inner = self.inner.lock();
        let services = inner.get(scope_hash).unwrap_or_else(|| {
            panic!("could not load services for scope hash {scope_hash}")
        });
        services
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("could not find a service with name: {name}"))
    }

    pub fn try_get(&self, scope_hash: &str, name: &str) -> Option<Arc<dyn Service>> {
        self.inner.lock().get(scope_hash)?.get(name).cloned()
    }

    pub fn service_names(&self, scope_hash: &str) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner
            .get(scope_hash)
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stops every service registered for the scope and drops them.
    pub fn stop_scope(&self, scope_hash: &str) {
        let services = self.inner.lock().remove(scope_hash);
        if let Some(services) = services {
            for (name, service) in services {
                if let Err(err) = service.stop() {
                    warn!(scope = %scope_hash, service = %name, %err, "failed to stop service");
                } else {
                    debug!(scope = %scope_hash, service = %name, "service stopped");
                }
            }
        }
    }
}

/// Scope hash → private validator. Independent of the service registry
/// mutex so signing paths never contend with service startup.
#[derive(Default)]
pub struct PrivValidatorRegistry {
    inner: Mutex<HashMap<String, Arc<dyn PrivValidator>>>,
}

impl PrivValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scope_hash: &str, priv_validator: Arc<dyn PrivValidator>) {
        self.inner
            .lock()
            .insert(scope_hash.to_string(), priv_validator);
    }

    pub fn get(&self, scope_hash: &str) -> Arc<dyn PrivValidator> {
        self.inner.lock().get(scope_hash).cloned().unwrap_or_else(|| {
            panic!("could not find a priv validator for scope hash {scope_hash}")
        })
    }

    pub fn try_get(&self, scope_hash: &str) -> Option<Arc<dyn PrivValidator>> {
        self.inner.lock().get(scope_hash).cloned()
    }

    pub fn remove(&self, scope_hash: &str) {
        self.inner.lock().remove(scope_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn indexer_consumes_bus_events() {
        let dir = tempfile::tempdir().unwrap();
        let db = ScopedDb::open("aa", &dir.path().join("tx_index.db")).unwrap();
        let bus = Arc::new(EventBus::new());
        bus.start().unwrap();
        let indexer = IndexerService::new("chain-a", db, bus.clone());
        indexer.start().unwrap();

        bus.publish_new_block(3, "deadbeef".to_string(), 2);
        bus.publish_tx("cafe".to_string(), 3);

        let mut block = None;
        for _ in 0..50 {
            block = indexer.indexed_block(3).unwrap();
            if block.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(block, Some(("deadbeef".to_string(), 2)));

        let mut height = None;
        for _ in 0..50 {
            height = indexer.tx_height("cafe").unwrap();
            if height.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(height, Some(3));

        indexer.stop().unwrap();
        assert!(!indexer.is_running());
    }

    #[test]
    fn registry_overwrites_and_panics_on_miss() {
        let registry = ServiceRegistry::new();
        let bus: Arc<dyn Service> = Arc::new(EventBus::new());
        registry.register("aa", SERVICE_EVENT_BUS, bus.clone());
        registry.register("aa", SERVICE_EVENT_BUS, bus);
        assert_eq!(registry.service_names("aa"), vec![SERVICE_EVENT_BUS]);
        assert!(registry.try_get("aa", SERVICE_PROXY_APP).is_none());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.get("bb", SERVICE_EVENT_BUS)
        }));
        assert!(result.is_err());
    }

    #[test]
    fn peer_filters_consult_the_application() {
        struct DenyIds;
        impl Application for DenyIds {
            fn query(&self, path: &str, _data: &[u8]) -> QueryResponse {
                if path.starts_with("/p2p/filter/id/") {
                    QueryResponse {
                        code: 1,
                        value: Vec::new(),
                        log: "denied".to_string(),
                    }
                } else {
                    QueryResponse::ok(Vec::new())
                }
            }
        }

        let proxy_app = Arc::new(AppConns::new(ClientCreator::Local(Arc::new(DenyIds))));
        proxy_app.start().unwrap();
        let filters = abci_peer_filters(proxy_app);
        assert_eq!(filters.len(), 2);

        let peer = PeerInfo {
            id: "node-1".to_string(),
            remote_addr: "203.0.113.9:26656".to_string(),
        };
        assert!(filters[0](&peer).is_ok());
        assert!(filters[1](&peer).is_err());
    }
}
