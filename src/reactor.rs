use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::db::{init_dbs, DbFamily, DbMultiplexes, ScopedDb};
use crate::errors::{MultiplexError, MultiplexResult};
use crate::fs::{scoped_config_dir, scoped_data_dir, MultiplexFs};
use crate::genesis::ChecksummedGenesisDocSet;
use crate::privval::{connect_socket_priv_validator, FilePv, NodeKey, PrivValidator};
use crate::scope::{fingerprint_of, ScopeRegistry};
use crate::services::{
    abci_peer_filters, AppConns, ClientCreator, EventBus, IndexerService, PeerFilterFn,
    PrivValidatorRegistry, Service, ServiceRegistry, SERVICE_EVENT_BUS, SERVICE_INDEXER,
    SERVICE_PROXY_APP,
};
use crate::state::{load_multiplex_state, MultiplexState, ScopedState};
use crate::store::{BlockStore, MultiplexBlockStore, MultiplexStateStore, StateStore, StoreOptions};

/// P2P channel byte reserved for replication metadata exchange.
pub const REPLICATION_CHANNEL: u8 = 0x90;

/// Max message size for multiplex reactor messages (1 MiB).
pub const MAX_MSG_SIZE: usize = 1_048_576;

#[derive(Clone, Debug)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub priority: u32,
    pub max_msg_size: usize,
}

#[derive(Clone, Debug)]
pub struct Envelope {
    pub src: String,
    pub channel_id: u8,
    pub payload: Vec<u8>,
}

/// The four rewritten listen endpoints of one replicated chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAddresses {
    pub p2p: String,
    pub rpc: String,
    pub grpc: String,
    pub grpc_privileged: String,
}

/// Top-level supervisor of the multiplex: owns the registries, databases,
/// stores, and per-chain services of every replicated chain, and exposes
/// them through scope-hash keyed providers.
pub struct MultiplexReactor {
    inner: Arc<ReactorInner>,
    startup_tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct ReactorInner {
    node_config: NodeConfig,
    node_key: NodeKey,
    scope_registry: ScopeRegistry,
    repl_chains: Vec<String>,
    genesis: ChecksummedGenesisDocSet,
    client_creator: ClientCreator,

    listen_addresses: RwLock<HashMap<String, ServiceAddresses>>,
    repl_config: RwLock<HashMap<String, Arc<NodeConfig>>>,

    dbs: RwLock<Option<Arc<DbMultiplexes>>>,
    states: RwLock<Option<Arc<MultiplexState>>>,
    state_stores: RwLock<Option<Arc<MultiplexStateStore>>>,
    block_stores: RwLock<Option<Arc<MultiplexBlockStore>>>,

    services: ServiceRegistry,
    priv_validators: PrivValidatorRegistry,
    peer_filters: Mutex<HashMap<String, Vec<PeerFilterFn>>>,
    networks_sync_states: Mutex<HashMap<String, bool>>,
    networks_sync_blocks: Mutex<HashMap<String, bool>>,

    started_scopes: Mutex<BTreeSet<String>>,
    running: AtomicBool,
}

impl MultiplexReactor {
    /// Builds a reactor from the node configuration, resolving the scope
    /// registry and loading the checksummed genesis doc set.
    pub fn new(config: NodeConfig) -> MultiplexResult<Self> {
        let client_creator = ClientCreator::from_config(&config.proxy_app);
        Self::new_with_client_creator(config, client_creator)
    }

    /// Same as [`MultiplexReactor::new`] with an explicit ABCI client
    /// creator, used by tests to inject an in-process application.
    pub fn new_with_client_creator(
        config: NodeConfig,
        client_creator: ClientCreator,
    ) -> MultiplexResult<Self> {
        config.validate_basic()?;
        let node_key = NodeKey::load_or_generate(&config.node_key_file())?;
        let scope_registry = ScopeRegistry::from_user_config(&config.user)?;
        let repl_chains = config.user.scope_hashes();
        let genesis = ChecksummedGenesisDocSet::load(&config.genesis_file())?;

        let mut sync_states = HashMap::with_capacity(repl_chains.len());
        let mut sync_blocks = HashMap::with_capacity(repl_chains.len());
        for scope_hash in &repl_chains {
            sync_states.insert(scope_hash.clone(), false);
            sync_blocks.insert(scope_hash.clone(), false);
        }

        Ok(Self {
            inner: Arc::new(ReactorInner {
                node_config: config,
                node_key,
                scope_registry,
                repl_chains,
                genesis,
                client_creator,
                listen_addresses: RwLock::new(HashMap::new()),
                repl_config: RwLock::new(HashMap::new()),
                dbs: RwLock::new(None),
                states: RwLock::new(None),
                state_stores: RwLock::new(None),
                block_stores: RwLock::new(None),
                services: ServiceRegistry::new(),
                priv_validators: PrivValidatorRegistry::new(),
                peer_filters: Mutex::new(HashMap::new()),
                networks_sync_states: Mutex::new(sync_states),
                networks_sync_blocks: Mutex::new(sync_blocks),
                started_scopes: Mutex::new(BTreeSet::new()),
                running: AtomicBool::new(false),
            }),
            startup_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        "MultiplexReactor"
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Channels served by this reactor. The replication channel byte is
    /// reserved but message handling over it is a future extension.
    pub fn channels(&self) -> Vec<ChannelDescriptor> {
        Vec::new()
    }

    /// Replication metadata exchange is not implemented yet.
    pub fn receive(&self, envelope: Envelope) {
        if !self.is_running() {
            debug!(src = %envelope.src, channel_id = envelope.channel_id, "receive");
        }
    }

    /// Starts the multiplex: prepares the filesystem, opens every scoped
    /// database, loads the state multiplex, builds the store wrappers, and
    /// fans out one startup task per replicated chain. Returns once every
    /// chain has reported in, or on the first chain that fails.
    pub async fn start(&self) -> MultiplexResult<()> {
        let inner = &self.inner;
        MultiplexFs::from_config(&inner.node_config)?;

        let dbs = Arc::new(init_dbs(&inner.node_config, &inner.scope_registry)?);
        let multiplex_state = load_multiplex_state(
            &dbs.state,
            &inner.genesis,
            inner.node_config.operator_genesis_hash(),
            &inner.node_config,
        )?;
        let store_options = StoreOptions::from_config(&inner.node_config.storage)?;
        let state_stores = MultiplexStateStore::new(&dbs.state, store_options.clone());
        let block_stores = MultiplexBlockStore::new(&dbs.blockstore, store_options);

        *inner.dbs.write() = Some(dbs);
        *inner.states.write() = Some(Arc::new(multiplex_state));
        *inner.state_stores.write() = Some(Arc::new(state_stores));
        *inner.block_stores.write() = Some(Arc::new(block_stores));

        if let Some(prof_laddr) = &inner.node_config.instrumentation.prof_laddr {
            info!(%prof_laddr, "profiling endpoint enabled by configuration");
        }

        let num_chains = inner.repl_chains.len();
        let (completions, mut completed) =
            mpsc::channel::<MultiplexResult<String>>(num_chains.max(1));

        for (index, scope_hash) in inner.repl_chains.iter().enumerate() {
            inner.update_node_config(scope_hash, index)?;

            let task_inner = Arc::clone(inner);
            let scope_hash = scope_hash.clone();
            let completions = completions.clone();
            let handle = tokio::spawn(async move {
                let result = start_chain_listeners(&task_inner, &scope_hash).await;
                let _ = completions.send(result.map(|_| scope_hash)).await;
            });
            self.startup_tasks.lock().push(handle);
        }
        drop(completions);

        // Every chain reports exactly once; the first failure wins.
        for _ in 0..num_chains {
            match completed.recv().await {
                Some(Ok(scope_hash)) => {
                    debug!(scope = %fingerprint_of(&scope_hash), "chain listeners started");
                    inner.started_scopes.lock().insert(scope_hash);
                }
                Some(Err(err)) => {
                    if let MultiplexError::ListenerStart { scope, step, reason } = &err {
                        error!(scope = %scope, step = %step, error = %reason, "chain startup failed");
                    }
                    self.abort_startup_tasks();
                    return Err(err);
                }
                None => break,
            }
        }

        inner.running.store(true, Ordering::SeqCst);
        info!(
            node_id = %inner.node_key.id(),
            chains = num_chains,
            "multiplex reactor started"
        );
        Ok(())
    }

    /// Stops every chain's services in reverse start order and closes the
    /// databases in reverse construction order.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.abort_startup_tasks();

        for scope_hash in self.inner.repl_chains.iter().rev() {
            self.inner.services.stop_scope(scope_hash);
            self.inner.priv_validators.remove(scope_hash);
        }
        self.inner.started_scopes.lock().clear();
        self.inner.peer_filters.lock().clear();

        *self.inner.block_stores.write() = None;
        *self.inner.state_stores.write() = None;
        *self.inner.states.write() = None;
        if let Some(dbs) = self.inner.dbs.write().take() {
            match Arc::try_unwrap(dbs) {
                Ok(dbs) => {
                    let DbMultiplexes {
                        blockstore,
                        state,
                        indexer,
                        evidence,
                    } = dbs;
                    drop(evidence);
                    drop(indexer);
                    drop(state);
                    drop(blockstore);
                    debug!("databases closed");
                }
                Err(_) => warn!("database handles still shared at shutdown"),
            }
        }
        info!("multiplex reactor stopped");
    }

    fn abort_startup_tasks(&self) {
        for handle in self.startup_tasks.lock().drain(..) {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Providers (read-only once start has completed)

    /// Scope hashes of all replicated chains, in sorted order.
    pub fn scope_hashes(&self) -> &[String] {
        &self.inner.repl_chains
    }

    pub fn scope_registry(&self) -> &ScopeRegistry {
        &self.inner.scope_registry
    }

    /// Identifier of the host node key shared by all replicated chains.
    pub fn node_id(&self) -> String {
        self.inner.node_key.id()
    }

    pub fn genesis(&self) -> &ChecksummedGenesisDocSet {
        &self.inner.genesis
    }

    /// Scopes whose listeners have completed startup.
    pub fn started_scopes(&self) -> BTreeSet<String> {
        self.inner.started_scopes.lock().clone()
    }

    /// Returns the database serving `(family, scope)`.
    ///
    /// Panics when called before `start` completed or for an unknown
    /// scope; both violate the start-complete contract.
    pub fn database(&self, family: DbFamily, scope_hash: &str) -> ScopedDb {
        let guard = self.inner.dbs.read();
        let dbs = guard
            .as_ref()
            .unwrap_or_else(|| panic!("databases requested before reactor start"));
        match dbs.family(family).get(scope_hash) {
            Ok(db) => db.clone(),
            Err(err) => panic!("{err}"),
        }
    }

    pub fn state(&self, scope_hash: &str) -> ScopedState {
        let guard = self.inner.states.read();
        let states = guard
            .as_ref()
            .unwrap_or_else(|| panic!("states requested before reactor start"));
        match states.get(scope_hash) {
            Ok(state) => state.clone(),
            Err(err) => panic!("{err}"),
        }
    }

    pub fn state_store(&self, scope_hash: &str) -> Arc<StateStore> {
        let guard = self.inner.state_stores.read();
        let stores = guard
            .as_ref()
            .unwrap_or_else(|| panic!("state stores requested before reactor start"));
        match stores.get(scope_hash) {
            Ok(store) => store,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn block_store(&self, scope_hash: &str) -> Arc<BlockStore> {
        let guard = self.inner.block_stores.read();
        let stores = guard
            .as_ref()
            .unwrap_or_else(|| panic!("block stores requested before reactor start"));
        match stores.get(scope_hash) {
            Ok(store) => store,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn service(&self, scope_hash: &str, name: &str) -> Arc<dyn Service> {
        self.inner.services.get(scope_hash, name)
    }

    pub fn priv_validator(&self, scope_hash: &str) -> Arc<dyn PrivValidator> {
        self.inner.priv_validators.get(scope_hash)
    }

    pub fn peer_filters(&self, scope_hash: &str) -> Vec<PeerFilterFn> {
        self.inner
            .peer_filters
            .lock()
            .get(scope_hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn state_sync(&self, scope_hash: &str) -> bool {
        self.inner
            .networks_sync_states
            .lock()
            .get(scope_hash)
            .copied()
            .unwrap_or(false)
    }

    pub fn block_sync(&self, scope_hash: &str) -> bool {
        self.inner
            .networks_sync_blocks
            .lock()
            .get(scope_hash)
            .copied()
            .unwrap_or(false)
    }

    /// Per-scope node configuration with rewritten listen addresses.
    pub fn node_config(&self, scope_hash: &str) -> Arc<NodeConfig> {
        match self.inner.repl_node_config(scope_hash) {
            Ok(config) => config,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn listen_addresses(&self, scope_hash: &str) -> Option<ServiceAddresses> {
        self.inner.listen_addresses.read().get(scope_hash).cloned()
    }

    // ------------------------------------------------------------------------
    // Setters (test injection and transport wiring)

    pub fn set_state_sync(&self, scope_hash: &str, state_sync: bool) {
        self.inner
            .networks_sync_states
            .lock()
            .insert(scope_hash.to_string(), state_sync);
    }

    pub fn set_block_sync(&self, scope_hash: &str, block_sync: bool) {
        self.inner
            .networks_sync_blocks
            .lock()
            .insert(scope_hash.to_string(), block_sync);
    }

    pub fn set_peer_filters(&self, scope_hash: &str, filters: Vec<PeerFilterFn>) {
        self.inner
            .peer_filters
            .lock()
            .insert(scope_hash.to_string(), filters);
    }

    pub fn register_service(&self, scope_hash: &str, name: &str, service: Arc<dyn Service>) {
        self.inner.services.register(scope_hash, name, service);
    }

    pub fn register_priv_validator(
        &self,
        scope_hash: &str,
        priv_validator: Arc<dyn PrivValidator>,
    ) {
        self.inner.priv_validators.register(scope_hash, priv_validator);
    }
}

impl std::fmt::Display for MultiplexReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MultiplexReactor")
    }
}

impl ReactorInner {
    fn repl_node_config(&self, scope_hash: &str) -> MultiplexResult<Arc<NodeConfig>> {
        self.repl_config
            .read()
            .get(scope_hash)
            .cloned()
            .ok_or_else(|| {
                MultiplexError::NotFound(format!(
                    "no node config for scope hash {scope_hash:?}"
                ))
            })
    }

    /// Derives the per-scope node configuration: the chain at sorted index
    /// `i` gets P2P port `base + i`, RPC `base + 1000 + i`, gRPC
    /// `base + 2000 + i`, and privileged gRPC `base + 3000 + i`, with the
    /// host portion of each configured address preserved.
    fn update_node_config(&self, scope_hash: &str, index: usize) -> MultiplexResult<()> {
        let base = u32::from(self.node_config.user.listen_port_base);
        let index = index as u32;

        let addresses = ServiceAddresses {
            p2p: replace_port(&self.node_config.p2p.listen_address, base + index)?,
            rpc: replace_port(&self.node_config.rpc.listen_address, base + 1000 + index)?,
            grpc: replace_port(&self.node_config.grpc.listen_address, base + 2000 + index)?,
            grpc_privileged: replace_port(
                &self.node_config.grpc.privileged.listen_address,
                base + 3000 + index,
            )?,
        };

        let mut scoped_config = self.node_config.clone();
        scoped_config.set_listen_addresses(
            addresses.p2p.clone(),
            addresses.rpc.clone(),
            addresses.grpc.clone(),
            addresses.grpc_privileged.clone(),
        );

        self.listen_addresses
            .write()
            .insert(scope_hash.to_string(), addresses);
        self.repl_config
            .write()
            .insert(scope_hash.to_string(), Arc::new(scoped_config));
        Ok(())
    }
}

/// Replaces the port of a `host:port`-shaped listen address, keeping
/// everything around it.
fn replace_port(listen_address: &str, port: u32) -> MultiplexResult<String> {
    let re = Regex::new(r"(.*)(:\d+)(.*)")
        .map_err(|err| MultiplexError::Config(format!("invalid listen address pattern: {err}")))?;
    Ok(re
        .replace(listen_address, format!("${{1}}:{port}${{3}}").as_str())
        .into_owned())
}

fn listener_error(scope_hash: &str, step: &'static str, err: MultiplexError) -> MultiplexError {
    MultiplexError::ListenerStart {
        scope: fingerprint_of(scope_hash),
        step,
        reason: err.to_string(),
    }
}

/// Starts the listeners of one replicated chain, in strict order: ABCI
/// proxy connections, event bus, indexer service, private validator.
/// Every started service is inserted into the reactor's registries.
async fn start_chain_listeners(
    inner: &Arc<ReactorInner>,
    scope_hash: &str,
) -> MultiplexResult<()> {
    let entry = inner
        .genesis
        .doc_by_scope(scope_hash)
        .map_err(|err| listener_error(scope_hash, "genesis", err))?;
    let chain_id = entry.genesis_doc.chain_id.clone();

    let node_config = inner
        .repl_node_config(scope_hash)
        .map_err(|err| listener_error(scope_hash, "config", err))?;
    let scope_id = inner
        .scope_registry
        .scope_id(scope_hash)
        .map_err(|err| listener_error(scope_hash, "config", err))?;
    let config_dir = scoped_config_dir(
        &inner.node_config.root_dir,
        scope_id.address(),
        &scope_id.fingerprint(),
    );
    let data_dir = scoped_data_dir(
        &inner.node_config.root_dir,
        scope_id.address(),
        &scope_id.fingerprint(),
    );

    // 1) ABCI proxy connections (--proxy_app)
    let proxy_app = Arc::new(AppConns::new(inner.client_creator.clone()));
    proxy_app
        .start()
        .map_err(|err| listener_error(scope_hash, "proxy_app", err))?;

    // 2) Event bus
    let event_bus = Arc::new(EventBus::new());
    event_bus
        .start()
        .map_err(|err| listener_error(scope_hash, "event_bus", err))?;

    // 3) Indexers over the scope's indexer database
    let indexer_db = {
        let guard = inner.dbs.read();
        let dbs = guard.as_ref().ok_or_else(|| {
            listener_error(
                scope_hash,
                "indexer",
                MultiplexError::NotFound("databases are not initialized".to_string()),
            )
        })?;
        dbs.indexer
            .get(scope_hash)
            .map_err(|err| listener_error(scope_hash, "indexer", err))?
            .clone()
    };
    let indexer_service = Arc::new(IndexerService::new(
        chain_id.clone(),
        indexer_db,
        event_bus.clone(),
    ));
    indexer_service
        .start()
        .map_err(|err| listener_error(scope_hash, "indexer", err))?;

    // 4) Private validator: file-backed per chain unless an external
    // signing socket is configured.
    let priv_validator: Arc<dyn PrivValidator> =
        if node_config.priv_validator_listen_addr.is_empty() {
            let key_name = file_name_or(&node_config.priv_validator_key_file, "priv_validator_key.json");
            let state_name =
                file_name_or(&node_config.priv_validator_state_file, "priv_validator_state.json");
            let file_pv = FilePv::load_or_generate(
                &config_dir.join(key_name),
                &data_dir.join(state_name),
            )
            .map_err(|err| listener_error(scope_hash, "priv_validator", err))?;
            Arc::new(file_pv)
        } else {
            let listen_addr = node_config.priv_validator_listen_addr.clone();
            let signer_chain_id = chain_id.clone();
            let client = tokio::task::spawn_blocking(move || {
                connect_socket_priv_validator(&listen_addr, &signer_chain_id)
            })
            .await
            .map_err(|err| {
                listener_error(
                    scope_hash,
                    "priv_validator",
                    MultiplexError::Crypto(format!("signer dial task failed: {err}")),
                )
            })?
            .map_err(|err| listener_error(scope_hash, "priv_validator", err))?;
            Arc::new(client)
        };

    inner
        .services
        .register(scope_hash, SERVICE_PROXY_APP, proxy_app.clone());
    inner
        .services
        .register(scope_hash, SERVICE_EVENT_BUS, event_bus);
    inner
        .services
        .register(scope_hash, SERVICE_INDEXER, indexer_service);
    inner.priv_validators.register(scope_hash, priv_validator);

    if inner.node_config.filter_peers {
        inner
            .peer_filters
            .lock()
            .insert(scope_hash.to_string(), abci_peer_filters(proxy_app));
    }

    info!(
        scope = %scope_id.fingerprint(),
        chain_id = %chain_id,
        "chain services registered"
    );
    Ok(())
}

fn file_name_or(path: &std::path::Path, fallback: &'static str) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_port_keeps_the_host_portion() {
        assert_eq!(
            replace_port("tcp://0.0.0.0:26656", 30001).unwrap(),
            "tcp://0.0.0.0:30001"
        );
        assert_eq!(
            replace_port("tcp://127.0.0.1:26657", 31002).unwrap(),
            "tcp://127.0.0.1:31002"
        );
        // Anything after the port is preserved too.
        assert_eq!(
            replace_port("tcp://10.0.0.1:26656/path", 30003).unwrap(),
            "tcp://10.0.0.1:30003/path"
        );
    }

    #[test]
    fn per_scope_configs_get_distinct_port_offsets() {
        use crate::config::{Replication, UserConfig};
        use crate::genesis::{GenesisDoc, GenesisDocSet, GenesisValidator, ScopedGenesisDoc};
        use std::collections::BTreeMap;

        let address = "0000000000000000000000000000000000000000";
        let mut user_scopes = BTreeMap::new();
        user_scopes.insert(
            address.to_string(),
            vec!["Default".to_string(), "Games".to_string(), "Mail".to_string()],
        );
        let mut node_config = NodeConfig::default();
        node_config.user = UserConfig::new(Replication::Plural, user_scopes, None);

        let set = GenesisDocSet {
            genesis_docs: node_config
                .user
                .user_scopes
                .iter()
                .flat_map(|(addr, scopes)| {
                    scopes.iter().map(|scope| ScopedGenesisDoc {
                        user_address: addr.clone(),
                        scope: scope.clone(),
                        genesis_doc: GenesisDoc {
                            chain_id: format!("chain-{scope}"),
                            initial_height: 1,
                            genesis_time: None,
                            validators: vec![GenesisValidator {
                                address: "val-0".to_string(),
                                pub_key: "00".repeat(32),
                                power: 1,
                                name: String::new(),
                            }],
                            app_hash: String::new(),
                            app_state: None,
                        },
                    })
                })
                .collect(),
        };
        let blob = serde_json::to_vec(&set).unwrap();
        let genesis = ChecksummedGenesisDocSet::from_json(&blob).unwrap();
        let scope_registry = ScopeRegistry::from_user_config(&node_config.user).unwrap();
        let repl_chains = node_config.user.scope_hashes();

        let dir = tempfile::tempdir().unwrap();
        let node_key = NodeKey::load_or_generate(&dir.path().join("node_key.json")).unwrap();
        let inner = ReactorInner {
            node_config,
            node_key,
            scope_registry,
            repl_chains: repl_chains.clone(),
            genesis,
            client_creator: ClientCreator::from_config("local"),
            listen_addresses: RwLock::new(HashMap::new()),
            repl_config: RwLock::new(HashMap::new()),
            dbs: RwLock::new(None),
            states: RwLock::new(None),
            state_stores: RwLock::new(None),
            block_stores: RwLock::new(None),
            services: ServiceRegistry::new(),
            priv_validators: PrivValidatorRegistry::new(),
            peer_filters: Mutex::new(HashMap::new()),
            networks_sync_states: Mutex::new(HashMap::new()),
            networks_sync_blocks: Mutex::new(HashMap::new()),
            started_scopes: Mutex::new(BTreeSet::new()),
            running: AtomicBool::new(false),
        };

        for (index, scope_hash) in repl_chains.iter().enumerate() {
            inner.update_node_config(scope_hash, index).unwrap();
        }

        let addresses = inner.listen_addresses.read();
        for (index, scope_hash) in repl_chains.iter().enumerate() {
            let expected_p2p = format!("tcp://0.0.0.0:{}", 30001 + index);
            let expected_rpc = format!("tcp://127.0.0.1:{}", 31001 + index);
            let expected_grpc = format!("tcp://127.0.0.1:{}", 32001 + index);
            let expected_priv = format!("tcp://127.0.0.1:{}", 33001 + index);
            let entry = addresses.get(scope_hash).unwrap();
            assert_eq!(entry.p2p, expected_p2p);
            assert_eq!(entry.rpc, expected_rpc);
            assert_eq!(entry.grpc, expected_grpc);
            assert_eq!(entry.grpc_privileged, expected_priv);

            let scoped = inner.repl_node_config(scope_hash).unwrap();
            assert_eq!(scoped.p2p.listen_address, expected_p2p);
            assert_eq!(scoped.rpc.listen_address, expected_rpc);
        }
    }
}
