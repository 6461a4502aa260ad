//! The node facade: composes per-family reactors over one identity, one
//! storage and one token manager, and exposes the public overlay API.

use super::rpc::{Command, ConnectionState, ReactorEvent, RpcServer, ServerStats};
use super::table::{Eligibility, RoutingTable};
use super::task::{AnnouncePayload, Family, LookupKind, TaskOutcome};
use super::token::TokenManager;
use super::REANNOUNCE_INTERVAL;
use crate::config::NodeConfig;
use crate::crypto::{self, Identity, PRIVATE_KEY_BYTES};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::storage::{MemoryStorage, SledStorage, Storage, PEER_TTL, VALUE_TTL};
use crate::types::{now, LookupOption, NodeInfo};
use crate::value::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Events pushed to subscribers.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChanged(NodeState),
    Connection(Family, ConnectionState),
}

/// Best per-family match of a node lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoundNode {
    pub v4: Option<NodeInfo>,
    pub v6: Option<NodeInfo>,
}

impl FoundNode {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

struct DhtHandle {
    family: Family,
    cmd_tx: mpsc::Sender<Command>,
    bound_addr: SocketAddr,
    routing: Arc<RwLock<RoutingTable>>,
    cache_path: Option<PathBuf>,
    join: JoinHandle<()>,
}

struct Running {
    handles: Vec<DhtHandle>,
    event_pump: JoinHandle<()>,
    reannounce: JoinHandle<()>,
}

struct NodeInner {
    config: Arc<NodeConfig>,
    identity: Arc<Identity>,
    storage: Arc<dyn Storage>,
    tokens: Arc<TokenManager>,
    state: Mutex<NodeState>,
    running: Mutex<Option<Running>>,
    events: broadcast::Sender<NodeEvent>,
}

/// A DHT node. Cheap to clone; all clones share the same engine.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Build a node: resolve the identity (config key, key file, or fresh)
    /// and open storage. Fails on invalid configuration or unusable data
    /// directory.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let identity = Arc::new(Self::resolve_identity(&config)?);
        if let Some(dir) = &config.data_dir {
            std::fs::write(dir.join("id"), format!("{}\n", identity.id()))?;
        }

        let storage_path = config
            .storage_path
            .clone()
            .or_else(|| config.data_dir.as_ref().map(|d| d.join("storage.db")));
        let storage: Arc<dyn Storage> = match storage_path {
            Some(path) => Arc::new(SledStorage::open(path)?),
            None => Arc::new(MemoryStorage::new()),
        };
        storage.initialize(VALUE_TTL, PEER_TTL)?;

        let (events, _) = broadcast::channel(64);
        info!("node {} created", identity.id());
        Ok(Self {
            inner: Arc::new(NodeInner {
                config: Arc::new(config),
                identity,
                storage,
                tokens: Arc::new(TokenManager::new()),
                state: Mutex::new(NodeState::Stopped),
                running: Mutex::new(None),
                events,
            }),
        })
    }

    fn resolve_identity(config: &NodeConfig) -> Result<Identity> {
        if let Some(key) = &config.private_key {
            return Ok(Identity::from_private_key(key));
        }
        let key_path = config.data_dir.as_ref().map(|d| d.join("key"));
        if let Some(path) = &key_path {
            if path.exists() {
                let bytes = Zeroizing::new(std::fs::read(path)?);
                let key: &[u8; PRIVATE_KEY_BYTES] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Crypto("malformed key file".into()))?;
                return Ok(Identity::from_private_key(key));
            }
        }
        let identity = Identity::generate();
        if let Some(path) = &key_path {
            let key = Zeroizing::new(identity.private_key());
            std::fs::write(path, key.as_slice())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
        }
        Ok(identity)
    }

    pub fn id(&self) -> &Id {
        self.inner.identity.id()
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    fn set_state(&self, state: NodeState) {
        *self.inner.state.lock() = state;
        let _ = self.inner.events.send(NodeEvent::StateChanged(state));
    }

    fn require_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::IllegalState("node is not running"))
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Bind sockets and launch the per-family reactors. On failure the
    /// node returns to `Stopped`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != NodeState::Stopped {
                return Err(Error::IllegalState("node already started"));
            }
            *state = NodeState::Starting;
        }
        let _ = self
            .inner
            .events
            .send(NodeEvent::StateChanged(NodeState::Starting));

        match self.launch().await {
            Ok(running) => {
                *self.inner.running.lock() = Some(running);
                self.set_state(NodeState::Running);
                info!("node {} running", self.id());

                if !self.inner.config.bootstrap_nodes.is_empty() {
                    let node = self.clone();
                    tokio::spawn(async move {
                        let seeds = node.inner.config.bootstrap_nodes.clone();
                        if let Err(e) = node.bootstrap(&seeds).await {
                            warn!("initial bootstrap failed: {}", e);
                        }
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(NodeState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        let config = &self.inner.config;
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();

        let routing4 = config
            .addr4
            .map(|_| Arc::new(RwLock::new(RoutingTable::new(*self.id()))));
        let routing6 = config
            .addr6
            .map(|_| Arc::new(RwLock::new(RoutingTable::new(*self.id()))));

        let plans = [
            (Family::V4, config.addr4, &routing4, &routing6, "dht4.cache"),
            (Family::V6, config.addr6, &routing6, &routing4, "dht6.cache"),
        ];
        for (family, addr, routing, sibling, cache_name) in plans {
            let Some(addr) = addr else { continue };
            let Some(routing) = routing.clone() else {
                continue;
            };
            let cache_path = config.data_dir.as_ref().map(|d| d.join(cache_name));

            // persisted cache entries go back in as probe candidates
            if let Some(path) = &cache_path {
                match RoutingTable::load_candidates(path) {
                    Ok(candidates) => {
                        let mut table = routing.write();
                        for info in candidates {
                            table.put_candidate(info);
                        }
                    }
                    Err(e) => warn!("ignoring {}: {}", path.display(), e),
                }
            }

            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let server = RpcServer::bind(
                family,
                SocketAddr::new(addr, config.port),
                self.inner.identity.clone(),
                config.clone(),
                routing.clone(),
                sibling.clone(),
                self.inner.storage.clone(),
                self.inner.tokens.clone(),
                cmd_rx,
                event_tx.clone(),
            )
            .await?;
            let bound_addr = server.bound_addr();
            let join = tokio::spawn(server.run());
            handles.push(DhtHandle {
                family,
                cmd_tx,
                bound_addr,
                routing,
                cache_path,
                join,
            });
        }
        if handles.is_empty() {
            return Err(Error::IllegalState("no address family configured"));
        }

        let events = self.inner.events.clone();
        let event_pump = tokio::spawn(async move {
            while let Some(ReactorEvent::ConnectionState(family, state)) = event_rx.recv().await
            {
                let _ = events.send(NodeEvent::Connection(family, state));
            }
        });

        let node = self.clone();
        let reannounce = tokio::spawn(async move {
            node.reannounce_loop().await;
        });

        Ok(Running {
            handles,
            event_pump,
            reannounce,
        })
    }

    /// Cancel tasks, persist routing tables, stop the reactors.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != NodeState::Running {
                return;
            }
            *state = NodeState::Stopping;
        }
        let _ = self
            .inner
            .events
            .send(NodeEvent::StateChanged(NodeState::Stopping));

        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            running.reannounce.abort();
            for handle in &running.handles {
                if let Some(path) = &handle.cache_path {
                    let (reply, rx) = oneshot::channel();
                    let cmd = Command::PersistCache {
                        path: path.clone(),
                        reply,
                    };
                    if handle.cmd_tx.send(cmd).await.is_ok() {
                        if let Ok(Err(e)) = rx.await {
                            warn!("persisting {} failed: {}", path.display(), e);
                        }
                    }
                }
            }
            // dropping the senders ends the reactor loops
            for handle in running.handles {
                drop(handle.cmd_tx);
                let _ = handle.join.await;
            }
            running.event_pump.abort();
        }

        self.set_state(NodeState::Stopped);
        info!("node {} stopped", self.id());
    }

    // =========================================================================
    // OVERLAY OPERATIONS
    // =========================================================================

    /// Populate the routing tables from operator-supplied seeds.
    pub async fn bootstrap(&self, seeds: &[NodeInfo]) -> Result<()> {
        self.require_running()?;
        if seeds.is_empty() {
            return Err(Error::InvalidArgument("no bootstrap seeds given".into()));
        }

        let mut replies = Vec::new();
        for (family, cmd_tx) in self.channels()? {
            let family_seeds: Vec<NodeInfo> = seeds
                .iter()
                .filter(|s| family.contains(&s.addr))
                .cloned()
                .collect();
            if family_seeds.is_empty() {
                continue;
            }
            let (reply, rx) = oneshot::channel();
            cmd_tx
                .send(Command::Bootstrap {
                    seeds: family_seeds,
                    reply,
                })
                .await
                .map_err(|_| Error::IllegalState("reactor gone"))?;
            replies.push(rx);
        }

        let mut last_err = None;
        let mut succeeded = false;
        for rx in replies {
            match rx.await {
                Ok(Ok(())) => succeeded = true,
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some(Error::Cancelled),
            }
        }
        match (succeeded, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::InvalidArgument(
                "no seed matched a configured address family".into(),
            )),
        }
    }

    /// Locate the node with the given id; per family the exact match, if
    /// the lookup saw one.
    pub async fn find_node(&self, target: &Id, option: Option<LookupOption>) -> Result<FoundNode> {
        self.require_running()?;
        let option = option.unwrap_or(self.inner.config.default_lookup_option);

        if option == LookupOption::Local {
            let mut found = FoundNode::default();
            for handle in self.handles_snapshot()? {
                let hit = handle
                    .1
                    .read()
                    .get_closest(target, 1, Eligibility::LocalLookup)
                    .into_iter()
                    .find(|n| n.id == *target);
                match handle.0 {
                    Family::V4 => found.v4 = hit,
                    Family::V6 => found.v6 = hit,
                }
            }
            return Ok(found);
        }

        let outcomes = self
            .lookup_all(
                *target,
                LookupKind::Node { want_token: false },
                option,
                |outcome| match outcome {
                    TaskOutcome::Nodes { exact, .. } => exact.is_none(),
                    _ => true,
                },
            )
            .await?;

        let mut found = FoundNode::default();
        for (family, outcome) in outcomes {
            if let TaskOutcome::Nodes { exact, .. } = outcome {
                match family {
                    Family::V4 => found.v4 = found.v4.take().or(exact),
                    Family::V6 => found.v6 = found.v6.take().or(exact),
                }
            }
        }
        Ok(found)
    }

    /// Retrieve a value. For mutable values the highest valid sequence
    /// seen wins; results are written back to local storage.
    pub async fn find_value(
        &self,
        id: &Id,
        expected_seq: Option<i32>,
        option: Option<LookupOption>,
    ) -> Result<Option<Value>> {
        self.require_running()?;
        let option = option.unwrap_or(self.inner.config.default_lookup_option);

        if option == LookupOption::Local {
            return self.get_value(id).await;
        }

        let outcomes = self
            .lookup_all(
                *id,
                LookupKind::Value { expected_seq },
                option,
                |outcome| matches!(outcome, TaskOutcome::Value(None)),
            )
            .await?;

        let mut best: Option<Value> = None;
        for (_, outcome) in outcomes {
            if let TaskOutcome::Value(Some(value)) = outcome {
                let better = best
                    .as_ref()
                    .is_none_or(|held| value.sequence_number > held.sequence_number);
                if better {
                    best = Some(value);
                }
            }
        }

        if let Some(value) = &best {
            let storage = self.inner.storage.clone();
            let value = value.clone();
            // write-back so future local lookups are served
            let _ = tokio::task::spawn_blocking(move || {
                storage.put_value(&value, false, None)
            })
            .await;
        }
        Ok(best)
    }

    /// Store a value locally and announce it to the K closest nodes.
    pub async fn store_value(&self, value: &Value, persistent: bool) -> Result<()> {
        self.require_running()?;
        value.validate()?;

        {
            let storage = self.inner.storage.clone();
            let value = value.clone();
            self.blocking(move || storage.put_value(&value, persistent, None))
                .await?;
        }

        self.announce_all(AnnouncePayload::Value(value.clone()))
            .await?;

        let storage = self.inner.storage.clone();
        let id = value.id();
        self.blocking(move || storage.update_value_announced(&id))
            .await
    }

    /// Collect service peers under an id, deduplicated across families.
    pub async fn find_peer(
        &self,
        id: &Id,
        expected: usize,
        option: Option<LookupOption>,
    ) -> Result<Vec<PeerInfo>> {
        self.require_running()?;
        let option = option.unwrap_or(self.inner.config.default_lookup_option);

        if option == LookupOption::Local {
            let storage = self.inner.storage.clone();
            let id = *id;
            return self
                .blocking(move || storage.get_peers(&id, expected))
                .await;
        }

        let outcomes = self
            .lookup_all(
                *id,
                LookupKind::Peer { expected },
                option,
                |outcome| matches!(outcome, TaskOutcome::Peers(p) if p.is_empty()),
            )
            .await?;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (_, outcome) in outcomes {
            if let TaskOutcome::Peers(peers) = outcome {
                for peer in peers {
                    if seen.insert(peer.dedup_key()) {
                        merged.push(peer);
                    }
                }
            }
        }

        if !merged.is_empty() {
            let storage = self.inner.storage.clone();
            let peers = merged.clone();
            let _ = tokio::task::spawn_blocking(move || -> Result<()> {
                for peer in &peers {
                    storage.put_peer(peer, false)?;
                }
                Ok(())
            })
            .await;
        }
        Ok(merged)
    }

    /// Store a peer announcement locally and announce it to the overlay.
    pub async fn announce_peer(&self, peer: &PeerInfo, persistent: bool) -> Result<()> {
        self.require_running()?;
        peer.validate()?;

        {
            let storage = self.inner.storage.clone();
            let peer = peer.clone();
            self.blocking(move || storage.put_peer(&peer, persistent))
                .await?;
        }

        self.announce_all(AnnouncePayload::Peer(peer.clone())).await?;

        let storage = self.inner.storage.clone();
        let (peer_id, node_id) = peer.storage_key();
        self.blocking(move || storage.update_peer_announced(&peer_id, &node_id))
            .await
    }

    // =========================================================================
    // LOCAL STORAGE AND CRYPTO HELPERS
    // =========================================================================

    pub async fn get_value(&self, id: &Id) -> Result<Option<Value>> {
        let storage = self.inner.storage.clone();
        let id = *id;
        self.blocking(move || storage.get_value(&id)).await
    }

    pub async fn remove_value(&self, id: &Id) -> Result<bool> {
        let storage = self.inner.storage.clone();
        let id = *id;
        self.blocking(move || storage.remove_value(&id)).await
    }

    pub async fn get_peer(&self, id: &Id) -> Result<Option<PeerInfo>> {
        let storage = self.inner.storage.clone();
        let id = *id;
        self.blocking(move || storage.get_peer(&id)).await
    }

    pub async fn remove_peer(&self, id: &Id) -> Result<bool> {
        let storage = self.inner.storage.clone();
        let id = *id;
        self.blocking(move || storage.remove_peer(&id)).await
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.inner.identity.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        crypto::verify(self.id(), data, signature).is_ok()
    }

    pub fn encrypt(&self, recipient: &Id, plaintext: &[u8]) -> Result<Vec<u8>> {
        crypto::encrypt(&self.inner.identity, recipient, plaintext)
    }

    pub fn decrypt(&self, sender: &Id, ciphertext: &[u8]) -> Result<Vec<u8>> {
        crypto::decrypt(&self.inner.identity, sender, ciphertext)
    }

    /// Open an encrypted value addressed to this node.
    pub fn decrypt_value(&self, value: &Value) -> Result<Vec<u8>> {
        value.decrypt_data(&self.inner.identity)
    }

    pub async fn stats(&self) -> Result<Vec<ServerStats>> {
        self.require_running()?;
        let mut all = Vec::new();
        for (_, cmd_tx) in self.channels()? {
            let (reply, rx) = oneshot::channel();
            if cmd_tx.send(Command::Stats { reply }).await.is_ok() {
                if let Ok(stats) = rx.await {
                    all.push(stats);
                }
            }
        }
        Ok(all)
    }

    /// Bound addresses of the active reactors.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.handles.iter().map(|h| h.bound_addr).collect())
            .unwrap_or_default()
    }

    /// This node as a NodeInfo per bound family.
    pub fn node_infos(&self) -> Vec<NodeInfo> {
        self.addresses()
            .into_iter()
            .map(|addr| NodeInfo::new(*self.id(), addr))
            .collect()
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    async fn blocking<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Result<T> {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Error::Storage(format!("storage worker: {}", e)))?
    }

    fn channels(&self) -> Result<Vec<(Family, mpsc::Sender<Command>)>> {
        let running = self.inner.running.lock();
        let running = running
            .as_ref()
            .ok_or(Error::IllegalState("node is not running"))?;
        Ok(running
            .handles
            .iter()
            .map(|h| (h.family, h.cmd_tx.clone()))
            .collect())
    }

    fn handles_snapshot(&self) -> Result<Vec<(Family, Arc<RwLock<RoutingTable>>)>> {
        let running = self.inner.running.lock();
        let running = running
            .as_ref()
            .ok_or(Error::IllegalState("node is not running"))?;
        Ok(running
            .handles
            .iter()
            .map(|h| (h.family, h.routing.clone()))
            .collect())
    }

    /// Fork a lookup across the active families and merge per the lookup
    /// option. `is_empty` classifies outcomes for `optimistic`.
    async fn lookup_all(
        &self,
        target: Id,
        kind: LookupKind,
        option: LookupOption,
        is_empty: impl Fn(&TaskOutcome) -> bool,
    ) -> Result<Vec<(Family, TaskOutcome)>> {
        let mut pending = Vec::new();
        for (family, cmd_tx) in self.channels()? {
            let (reply, rx) = oneshot::channel();
            cmd_tx
                .send(Command::Lookup {
                    target,
                    kind: kind.clone(),
                    option,
                    reply,
                })
                .await
                .map_err(|_| Error::IllegalState("reactor gone"))?;
            pending.push((family, rx));
        }

        match option {
            LookupOption::Conservative | LookupOption::Local => {
                // all families run to completion, results merged
                let mut outcomes = Vec::new();
                let mut last_err = None;
                for (family, rx) in pending {
                    match rx.await {
                        Ok(Ok(outcome)) => outcomes.push((family, outcome)),
                        Ok(Err(e)) => last_err = Some(e),
                        Err(_) => last_err = Some(Error::Cancelled),
                    }
                }
                if outcomes.is_empty() {
                    if let Some(e) = last_err {
                        return Err(e);
                    }
                }
                Ok(outcomes)
            }
            LookupOption::Arbitrary | LookupOption::Optimistic => {
                // race the families; optimistic keeps waiting past empty
                // first finishers
                enum Wait {
                    Done(std::result::Result<Result<TaskOutcome>, oneshot::error::RecvError>),
                    Pending(oneshot::Receiver<Result<TaskOutcome>>),
                }

                let mut ordered: Vec<(Family, Wait)> = Vec::with_capacity(pending.len());
                if pending.len() == 2 {
                    if let (Some((family_b, mut rx_b)), Some((family_a, mut rx_a))) =
                        (pending.pop(), pending.pop())
                    {
                        tokio::select! {
                            r = &mut rx_a => {
                                ordered.push((family_a, Wait::Done(r)));
                                ordered.push((family_b, Wait::Pending(rx_b)));
                            }
                            r = &mut rx_b => {
                                ordered.push((family_b, Wait::Done(r)));
                                ordered.push((family_a, Wait::Pending(rx_a)));
                            }
                        }
                    }
                } else {
                    for (family, rx) in pending {
                        ordered.push((family, Wait::Pending(rx)));
                    }
                }

                let mut outcomes = Vec::new();
                let mut last_err = None;
                for (family, wait) in ordered {
                    let received = match wait {
                        Wait::Done(r) => r,
                        Wait::Pending(rx) => rx.await,
                    };
                    match received {
                        Ok(Ok(outcome)) => {
                            let empty = is_empty(&outcome);
                            outcomes.push((family, outcome));
                            if option == LookupOption::Arbitrary || !empty {
                                break;
                            }
                        }
                        Ok(Err(e)) => last_err = Some(e),
                        Err(_) => last_err = Some(Error::Cancelled),
                    }
                }
                if outcomes.is_empty() {
                    if let Some(e) = last_err {
                        return Err(e);
                    }
                }
                Ok(outcomes)
            }
        }
    }

    async fn announce_all(&self, payload: AnnouncePayload) -> Result<()> {
        let mut replies = Vec::new();
        for (_, cmd_tx) in self.channels()? {
            let (reply, rx) = oneshot::channel();
            cmd_tx
                .send(Command::Announce {
                    payload: payload.clone(),
                    reply,
                })
                .await
                .map_err(|_| Error::IllegalState("reactor gone"))?;
            replies.push(rx);
        }
        for rx in replies {
            match rx.await {
                Ok(Ok(TaskOutcome::Announced { stored, conflicts })) => {
                    debug!(
                        "announce {}: stored at {}, {} conflicts",
                        payload.target(),
                        stored,
                        conflicts
                    );
                }
                Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {}
            }
        }
        Ok(())
    }

    /// Periodic re-announce of persistent entries whose last announcement
    /// is nearing the TTL.
    async fn reannounce_loop(&self) {
        let mut tick = tokio::time::interval(REANNOUNCE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if !self.is_running() {
                continue;
            }
            let cutoff = now().saturating_sub(
                VALUE_TTL.as_secs() - 2 * REANNOUNCE_INTERVAL.as_secs(),
            );

            let storage = self.inner.storage.clone();
            let due_values = tokio::task::spawn_blocking(move || {
                storage.values_to_announce(cutoff)
            })
            .await;
            if let Ok(Ok(values)) = due_values {
                for value in values {
                    debug!("re-announcing value {}", value.id());
                    if self
                        .announce_all(AnnouncePayload::Value(value.clone()))
                        .await
                        .is_ok()
                    {
                        let storage = self.inner.storage.clone();
                        let id = value.id();
                        let _ = self
                            .blocking(move || storage.update_value_announced(&id))
                            .await;
                    }
                }
            }

            let storage = self.inner.storage.clone();
            let due_peers =
                tokio::task::spawn_blocking(move || storage.peers_to_announce(cutoff)).await;
            if let Ok(Ok(peers)) = due_peers {
                for peer in peers {
                    debug!("re-announcing peer {}", peer.peer_id);
                    if self
                        .announce_all(AnnouncePayload::Peer(peer.clone()))
                        .await
                        .is_ok()
                    {
                        let storage = self.inner.storage.clone();
                        let (peer_id, node_id) = peer.storage_key();
                        let _ = self
                            .blocking(move || {
                                storage.update_peer_announced(&peer_id, &node_id)
                            })
                            .await;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            addr4: Some("127.0.0.1".parse().unwrap()),
            port: 0,
            data_dir: Some(dir.to_path_buf()),
            developer_mode: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lifecycle_and_illegal_state() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        assert_eq!(node.state(), NodeState::Stopped);

        let target = Id::random();
        assert!(matches!(
            node.find_node(&target, None).await,
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            node.bootstrap(&[NodeInfo::new(Id::random(), "127.0.0.1:1".parse().unwrap())])
                .await,
            Err(Error::IllegalState(_))
        ));

        node.start().await.unwrap();
        assert!(node.is_running());
        assert_eq!(node.addresses().len(), 1);
        assert!(matches!(
            node.start().await,
            Err(Error::IllegalState(_))
        ));

        node.stop().await;
        assert_eq!(node.state(), NodeState::Stopped);
        assert!(matches!(
            node.find_value(&target, None, None).await,
            Err(Error::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn identity_persists_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = {
            let node = Node::new(test_config(dir.path())).unwrap();
            *node.id()
        };
        let node = Node::new(test_config(dir.path())).unwrap();
        assert_eq!(*node.id(), id1);

        let id_file = std::fs::read_to_string(dir.path().join("id")).unwrap();
        assert_eq!(id_file.trim(), id1.to_base58());
    }

    #[tokio::test]
    async fn explicit_key_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.private_key = Some([3u8; 32]);
        let node = Node::new(config).unwrap();
        let expected = Identity::from_private_key(&[3u8; 32]);
        assert_eq!(node.id(), expected.id());
    }

    #[tokio::test]
    async fn sign_verify_encrypt_work_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let a = Node::new(test_config(dir.path())).unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let b = Node::new(test_config(dir_b.path())).unwrap();

        let sig = a.sign(b"offline");
        assert!(a.verify(b"offline", &sig));
        assert!(!a.verify(b"other", &sig));

        let ct = a.encrypt(b.id(), b"psst").unwrap();
        assert_eq!(b.decrypt(a.id(), &ct).unwrap(), b"psst");
    }

    #[tokio::test]
    async fn local_value_round_trip_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        node.start().await.unwrap();

        let value = Value::immutable(b"local".to_vec()).unwrap();
        // no peers: the announce finds nobody, but local storage serves
        node.store_value(&value, false).await.unwrap();
        let got = node
            .find_value(&value.id(), None, Some(LookupOption::Local))
            .await
            .unwrap();
        assert_eq!(got, Some(value.clone()));

        assert!(node.remove_value(&value.id()).await.unwrap());
        assert_eq!(node.get_value(&value.id()).await.unwrap(), None);

        node.stop().await;
    }
}
