//! The per-family RPC reactor.
//!
//! One reactor task owns the UDP socket, the routing table's write side,
//! the transaction table, the throttle, the suspicious-node detector and
//! the task manager for its address family. Everything mutable is touched
//! only from inside [`RpcServer::run`]; the facade talks to it through
//! [`Command`]s, and other components read the routing table through its
//! shared lock. The loop suspends only on socket reads, timers and the
//! command channel.

use super::codec::{self, Body, Message, MessageKind, Method, Request, Response};
use super::entry::KBucketEntry;
use super::sentinel::{Observation, Sentinel};
use super::table::{Eligibility, RoutingTable};
use super::task::{
    AnnouncePayload, AnnounceTask, CallRequest, CandidateFilter, Family, LookupKind, LookupTask,
    PingRefreshTask, Task, TaskId, TaskManager, TaskOutcome,
};
use super::throttle::Throttle;
use super::token::TokenManager;
use super::{
    ALPHA, BOOTSTRAP_MIN_INTERVAL, CALL_TIMEOUT_MAX, CALL_TIMEOUT_MIN, K, MAINTENANCE_INTERVAL,
    MTU,
};
use crate::config::NodeConfig;
use crate::crypto::Identity;
use crate::error::{Error, ErrorCode, Result};
use crate::id::Id;
use crate::storage::Storage;
use crate::types::{LookupOption, NodeInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Peer records served in one find_peer response; keeps worst-case
/// responses inside the MTU.
const MAX_PEERS_SERVED: usize = 4;

/// Outstanding reachability probes at any time.
const MAX_PROBES: usize = 8;

/// Per-family connection substate, surfaced as node events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Routing table considered fully populated after bootstrap.
    Profound,
}

/// Event pushed from a reactor to the node facade.
#[derive(Debug, Clone)]
pub enum ReactorEvent {
    ConnectionState(Family, ConnectionState),
}

/// Facade-to-reactor commands. Dropping the sender shuts the reactor
/// down.
pub enum Command {
    Lookup {
        target: Id,
        kind: LookupKind,
        option: LookupOption,
        reply: oneshot::Sender<Result<TaskOutcome>>,
    },
    Announce {
        payload: AnnouncePayload,
        reply: oneshot::Sender<Result<TaskOutcome>>,
    },
    Bootstrap {
        seeds: Vec<NodeInfo>,
        reply: oneshot::Sender<Result<()>>,
    },
    PersistCache {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<ServerStats>,
    },
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub family: Family,
    pub bound_addr: SocketAddr,
    pub entries: usize,
    pub buckets: usize,
    pub pending_calls: usize,
    pub active_tasks: usize,
    pub banned_hosts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOrigin {
    Task(TaskId),
    Probe,
}

#[derive(Debug)]
struct RpcCall {
    method: Method,
    target: NodeInfo,
    origin: CallOrigin,
    sent_at: Instant,
    stall_at: Instant,
    deadline: Instant,
    stalled: bool,
}

struct DelayedSend {
    due: Instant,
    addr: SocketAddr,
    bytes: Vec<u8>,
}

pub struct RpcServer {
    family: Family,
    identity: Arc<Identity>,
    config: Arc<NodeConfig>,
    socket: UdpSocket,
    bound_addr: SocketAddr,
    routing: Arc<RwLock<RoutingTable>>,
    sibling: Option<Arc<RwLock<RoutingTable>>>,
    storage: Arc<dyn Storage>,
    tokens: Arc<TokenManager>,
    tasks: TaskManager,
    calls: HashMap<u32, RpcCall>,
    next_txid: u32,
    throttle: Throttle,
    sentinel: Sentinel,
    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ReactorEvent>,
    conn_state: ConnectionState,
    last_bootstrap: Option<Instant>,
    bootstrap_task: Option<(TaskId, oneshot::Sender<Result<()>>)>,
    out_queue: Vec<(SocketAddr, Vec<u8>)>,
    delayed: Vec<DelayedSend>,
}

impl RpcServer {
    /// Bind the socket and assemble a reactor. `sibling` is the other
    /// family's routing table, read for cross-family node hints.
    pub async fn bind(
        family: Family,
        bind_addr: SocketAddr,
        identity: Arc<Identity>,
        config: Arc<NodeConfig>,
        routing: Arc<RwLock<RoutingTable>>,
        sibling: Option<Arc<RwLock<RoutingTable>>>,
        storage: Arc<dyn Storage>,
        tokens: Arc<TokenManager>,
        cmd_rx: mpsc::Receiver<Command>,
        events: mpsc::UnboundedSender<ReactorEvent>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let bound_addr = socket.local_addr()?;
        info!("rpc {} listening on {}", family.name(), bound_addr);
        Ok(Self {
            family,
            identity,
            throttle: Throttle::new(
                config.enable_spam_throttling,
                config.throttle_rate,
                config.throttle_burst,
            ),
            sentinel: Sentinel::new(
                config.enable_suspicious_node_detector,
                config.sentinel_threshold,
            ),
            config,
            socket,
            bound_addr,
            routing,
            sibling,
            storage,
            tokens,
            tasks: TaskManager::new(),
            calls: HashMap::new(),
            next_txid: rand::random::<u32>() | 1,
            cmd_rx,
            events,
            conn_state: ConnectionState::Disconnected,
            last_bootstrap: None,
            bootstrap_task: None,
            out_queue: Vec::new(),
            delayed: Vec::new(),
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    fn filter(&self) -> CandidateFilter {
        CandidateFilter {
            family: self.family,
            local_id: *self.identity.id(),
            developer_mode: self.config.developer_mode,
        }
    }

    /// The reactor loop. Runs until the command channel closes.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, remote)) => self.on_datagram(&buf[..len], remote),
                    Err(e) => debug!("rpc {} recv error: {}", self.family.name(), e),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
                _ = maintenance.tick() => self.on_maintenance(),
            }
            self.drive_tasks();
            self.flush().await;
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tasks.cancel_all();
        if let Some((_, reply)) = self.bootstrap_task.take() {
            let _ = reply.send(Err(Error::Cancelled));
        }
        self.set_conn_state(ConnectionState::Disconnected);
        info!("rpc {} stopped", self.family.name());
    }

    fn set_conn_state(&mut self, state: ConnectionState) {
        if self.conn_state != state {
            self.conn_state = state;
            let _ = self
                .events
                .send(ReactorEvent::ConnectionState(self.family, state));
        }
    }

    async fn flush(&mut self) {
        for (addr, bytes) in std::mem::take(&mut self.out_queue) {
            if let Err(e) = self.socket.send_to(&bytes, addr).await {
                debug!("rpc {} send to {} failed: {}", self.family.name(), addr, e);
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn on_datagram(&mut self, bytes: &[u8], remote: SocketAddr) {
        if self.sentinel.is_banned(remote.ip()) {
            trace!("dropping datagram from banned {}", remote);
            return;
        }
        if bytes.len() > MTU {
            self.sentinel.observe(remote.ip(), Observation::Malformed);
            return;
        }
        let message = match codec::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!("undecodable datagram from {}: {}", remote, e);
                self.sentinel.observe(remote.ip(), Observation::Malformed);
                return;
            }
        };
        if message.sender == *self.identity.id() {
            return;
        }

        match message.kind() {
            MessageKind::Request => {
                if !self.throttle.inbound_allowed(remote.ip()) {
                    trace!("throttled request from {}", remote);
                    return;
                }
                self.handle_request(message, remote);
            }
            MessageKind::Response | MessageKind::Error => self.handle_reply(message, remote),
        }
    }

    fn handle_request(&mut self, message: Message, remote: SocketAddr) {
        // id/address consistency checks before the sender may enter the
        // routing table
        let known_by_addr = self.routing.read().find_by_addr(&remote);
        let mut admit = true;
        if let Some(known) = known_by_addr {
            if known.id != message.sender {
                self.sentinel.observe(remote.ip(), Observation::Inconsistent);
                let to_verify = self.routing.write().on_id_change(&remote, &message.sender);
                for node in to_verify {
                    self.send_probe(node);
                }
                admit = false;
            }
        }
        if let Some(known) = self.routing.read().get(&message.sender) {
            if known.addr != remote {
                self.sentinel.observe(remote.ip(), Observation::Inconsistent);
                admit = false;
            }
        }

        let sender_info =
            NodeInfo::with_version(message.sender, remote, message.version);
        if admit && self.filter().allows(&sender_info) {
            self.admit_candidate(sender_info.clone());
        }

        let Body::Request(request) = &message.body else {
            return;
        };
        trace!(
            "request {} from {}",
            request.method(),
            sender_info
        );

        let reply = match self.dispatch_request(request, &message.sender, &remote) {
            Ok(response) => Message::response(message.txid, *self.identity.id(), response),
            Err(e) => {
                let code = e.wire_code().unwrap_or(ErrorCode::ServerError);
                debug!("request {} from {} failed: {}", message.txid, remote, e);
                Message::error(message.txid, *self.identity.id(), code)
            }
        };
        match codec::encode(&reply) {
            Ok(bytes) => self.out_queue.push((remote, bytes)),
            Err(e) => warn!("response encode failed: {}", e),
        }
    }

    fn dispatch_request(
        &mut self,
        request: &Request,
        sender: &Id,
        remote: &SocketAddr,
    ) -> Result<Response> {
        match request {
            Request::Ping {} => Ok(Response::Ping {}),

            Request::FindNode {
                target,
                want4,
                want6,
                want_token,
            } => Ok(Response::FindNode {
                nodes4: self.closest_nodes(Family::V4, target, *want4),
                nodes6: self.closest_nodes(Family::V6, target, *want6),
                token: want_token.then(|| self.tokens.generate(sender, remote, target)),
            }),

            Request::FindValue {
                target,
                want4,
                want6,
                want_token,
                expected_seq,
            } => {
                let value = self
                    .storage
                    .get_value(target)?
                    .filter(|v| match expected_seq {
                        Some(seq) => !v.is_mutable() || v.sequence_number >= *seq,
                        None => true,
                    });
                // node hints are elided next to a value so the response
                // stays inside the MTU
                let (nodes4, nodes6) = if value.is_some() {
                    (None, None)
                } else {
                    (
                        self.closest_nodes(Family::V4, target, *want4),
                        self.closest_nodes(Family::V6, target, *want6),
                    )
                };
                Ok(Response::FindValue {
                    nodes4,
                    nodes6,
                    token: want_token.then(|| self.tokens.generate(sender, remote, target)),
                    value,
                })
            }

            Request::StoreValue {
                token,
                value,
                expected_seq,
            } => {
                let id = value.id();
                if !self.tokens.verify(*token, sender, remote, &id) {
                    return Err(Error::Protocol("bad write token".into()));
                }
                value.validate()?;
                self.storage.put_value(value, false, *expected_seq)?;
                debug!("stored value {} from {}", id, remote);
                Ok(Response::StoreValue {})
            }

            Request::FindPeer {
                target,
                want4,
                want6,
                want_token,
            } => {
                let peers = self.storage.get_peers(target, MAX_PEERS_SERVED)?;
                Ok(Response::FindPeer {
                    nodes4: self.closest_nodes(Family::V4, target, *want4),
                    nodes6: self.closest_nodes(Family::V6, target, *want6),
                    token: want_token.then(|| self.tokens.generate(sender, remote, target)),
                    peers: (!peers.is_empty()).then_some(peers),
                })
            }

            Request::AnnouncePeer { token, peer } => {
                if !self.tokens.verify(*token, sender, remote, &peer.peer_id) {
                    return Err(Error::Protocol("bad write token".into()));
                }
                peer.validate()?;
                // the announcement must come from the node it names, or
                // from the delegating origin
                let authorized = match &peer.origin {
                    Some(origin) => origin == sender,
                    None => peer.node_id == *sender,
                };
                if !authorized {
                    return Err(Error::Protocol(
                        "announcement not from the named node".into(),
                    ));
                }
                self.storage.put_peer(peer, false)?;
                debug!("stored peer {} from {}", peer.peer_id, remote);
                Ok(Response::AnnouncePeer {})
            }
        }
    }

    fn closest_nodes(
        &self,
        family: Family,
        target: &Id,
        wanted: bool,
    ) -> Option<Vec<NodeInfo>> {
        if !wanted {
            return None;
        }
        let table = if family == self.family {
            Some(&self.routing)
        } else {
            self.sibling.as_ref()
        };
        table.map(|t| t.read().get_closest(target, K, Eligibility::NodesList))
    }

    fn handle_reply(&mut self, message: Message, remote: SocketAddr) {
        let Some(call) = self.calls.get(&message.txid) else {
            trace!("reply with unknown txid {} from {}", message.txid, remote);
            return;
        };
        if call.target.addr != remote || call.target.id != message.sender {
            self.sentinel.observe(remote.ip(), Observation::Inconsistent);
            debug!(
                "reply {} from {} does not match call target {}",
                message.txid, remote, call.target
            );
            return;
        }
        let call = match self.calls.remove(&message.txid) {
            Some(call) => call,
            None => return,
        };

        let rtt_ms = call.sent_at.elapsed().as_millis() as u64;
        let info = NodeInfo::with_version(message.sender, remote, message.version);
        self.routing
            .write()
            .put(KBucketEntry::verified(info.clone(), rtt_ms));

        if matches!(
            self.conn_state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        ) {
            self.set_conn_state(ConnectionState::Connected);
        }

        let mut out = Vec::new();
        match &message.body {
            Body::Response(response) => {
                if response.method() != call.method {
                    self.sentinel.observe(remote.ip(), Observation::Inconsistent);
                    if let CallOrigin::Task(tid) = call.origin {
                        self.tasks.on_timeout(tid, &info.id, &mut out);
                    }
                } else if let CallOrigin::Task(tid) = call.origin {
                    self.tasks.on_response(tid, &info, response, &mut out);
                }
            }
            Body::Error(wire_error) => {
                let error = Error::from_remote(wire_error.code, wire_error.message.clone());
                debug!("call {} answered with error: {}", message.txid, error);
                if let CallOrigin::Task(tid) = call.origin {
                    self.tasks.on_error(tid, &info.id, &error, &mut out);
                }
            }
            Body::Request(_) => {}
        }
        self.dispatch(out);
    }

    // =========================================================================
    // COMMANDS AND TIMERS
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Lookup {
                target,
                kind,
                option,
                reply,
            } => {
                let seeds = self
                    .routing
                    .read()
                    .get_closest(&target, ALPHA + K, Eligibility::LocalLookup);
                let task = LookupTask::new(target, kind, option, self.filter(), seeds);
                self.tasks.submit(Task::Lookup(task), Some(reply));
            }

            Command::Announce { payload, reply } => {
                let target = payload.target();
                let seeds = self
                    .routing
                    .read()
                    .get_closest(&target, ALPHA + K, Eligibility::LocalLookup);
                let task = AnnounceTask::new(payload, self.filter(), seeds);
                self.tasks.submit(Task::Announce(task), Some(reply));
            }

            Command::Bootstrap { seeds, reply } => self.start_bootstrap(seeds, reply),

            Command::PersistCache { path, reply } => {
                let _ = reply.send(self.routing.read().save(&path));
            }

            Command::Stats { reply } => {
                let routing = self.routing.read();
                let _ = reply.send(ServerStats {
                    family: self.family,
                    bound_addr: self.bound_addr,
                    entries: routing.entry_count(),
                    buckets: routing.bucket_count(),
                    pending_calls: self.calls.len(),
                    active_tasks: self.tasks.len(),
                    banned_hosts: self.sentinel.banned_count(),
                });
            }
        }
    }

    fn start_bootstrap(&mut self, seeds: Vec<NodeInfo>, reply: oneshot::Sender<Result<()>>) {
        if let Some(last) = self.last_bootstrap {
            if last.elapsed() < BOOTSTRAP_MIN_INTERVAL {
                debug!("bootstrap suppressed, last run {:?} ago", last.elapsed());
                let _ = reply.send(Ok(()));
                return;
            }
        }
        if self.bootstrap_task.is_some() {
            let _ = reply.send(Err(Error::IllegalState("bootstrap already running")));
            return;
        }
        self.last_bootstrap = Some(Instant::now());
        self.set_conn_state(ConnectionState::Connecting);

        let filter = self.filter();
        let mut all_seeds: Vec<NodeInfo> =
            seeds.into_iter().filter(|s| filter.allows(s)).collect();
        for seed in &all_seeds {
            self.routing.write().put_candidate(seed.clone());
        }
        all_seeds.extend(self.routing.read().get_closest(
            self.identity.id(),
            K,
            Eligibility::LocalLookup,
        ));

        let task = LookupTask::new(
            *self.identity.id(),
            LookupKind::Node { want_token: false },
            LookupOption::Conservative,
            filter,
            all_seeds,
        );
        let id = self.tasks.submit(Task::Lookup(task), None);
        self.bootstrap_task = Some((id, reply));
        info!("rpc {} bootstrap started", self.family.name());
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        // release sends whose throttle delay elapsed
        let mut still_delayed = Vec::new();
        for send in self.delayed.drain(..) {
            if send.due <= now {
                self.out_queue.push((send.addr, send.bytes));
            } else {
                still_delayed.push(send);
            }
        }
        self.delayed = still_delayed;

        // stalls and timeouts
        let mut stalled = Vec::new();
        let mut timed_out = Vec::new();
        for (txid, call) in &mut self.calls {
            if now >= call.deadline {
                timed_out.push(*txid);
            } else if now >= call.stall_at && !call.stalled {
                call.stalled = true;
                stalled.push(*txid);
            }
        }

        let mut out = Vec::new();
        for txid in stalled {
            if let Some(call) = self.calls.get(&txid) {
                trace!("call {} to {} stalled", txid, call.target);
                if let CallOrigin::Task(tid) = call.origin {
                    let id = call.target.id;
                    self.tasks.on_stall(tid, &id, &mut out);
                }
            }
        }
        for txid in timed_out {
            if let Some(call) = self.calls.remove(&txid) {
                debug!("call {} to {} timed out", txid, call.target);
                self.routing.write().on_timeout(&call.target.id);
                if let CallOrigin::Task(tid) = call.origin {
                    self.tasks.on_timeout(tid, &call.target.id, &mut out);
                }
            }
        }
        self.dispatch(out);
    }

    fn on_maintenance(&mut self) {
        let work = self.routing.write().maintenance();
        for target in work.refresh_targets {
            let seeds =
                self.routing
                    .read()
                    .get_closest(&target, ALPHA + K, Eligibility::LocalLookup);
            let task = LookupTask::new(
                target,
                LookupKind::Node { want_token: false },
                LookupOption::Conservative,
                self.filter(),
                seeds,
            );
            self.tasks.submit(Task::Lookup(task), None);
        }
        let pings: Vec<NodeInfo> = work
            .ping_candidates
            .into_iter()
            .filter(|n| self.filter().allows(n))
            .collect();
        if !pings.is_empty() {
            self.tasks
                .submit(Task::Ping(PingRefreshTask::new(pings)), None);
        }

        self.sentinel.purge();
        self.throttle.purge();
        if let Err(e) = self.storage.purge() {
            warn!("storage purge failed: {}", e);
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    fn drive_tasks(&mut self) {
        let mut out = Vec::new();
        self.tasks.drive(&mut out);
        self.dispatch(out);

        // bootstrap completion: lookup task gone from the manager
        if let Some((tid, _)) = &self.bootstrap_task {
            if !self.tasks.contains(*tid) {
                if let Some((_, reply)) = self.bootstrap_task.take() {
                    let entries = self.routing.read().entry_count();
                    info!(
                        "rpc {} bootstrap complete, {} entries",
                        self.family.name(),
                        entries
                    );
                    self.set_conn_state(ConnectionState::Profound);
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    fn dispatch(&mut self, calls: Vec<(TaskId, CallRequest)>) {
        let mut queue: std::collections::VecDeque<(TaskId, CallRequest)> = calls.into();
        while let Some((tid, call)) = queue.pop_front() {
            if let Err(e) = self.send_call(CallOrigin::Task(tid), &call.target, call.request) {
                // feed the failure back; the task may emit follow-ups
                let mut more = Vec::new();
                self.tasks.on_error(tid, &call.target.id, &e, &mut more);
                queue.extend(more);
            }
        }
    }

    fn admit_candidate(&mut self, info: NodeInfo) {
        self.routing.write().put_candidate(info.clone());
        let probe_due = self
            .routing
            .read()
            .bucket_of(&info.id)
            .find(&info.id)
            .is_some_and(|e| e.needs_probe());
        if probe_due {
            self.send_probe(info);
        }
    }

    fn send_probe(&mut self, target: NodeInfo) {
        let outstanding = self
            .calls
            .values()
            .filter(|c| c.origin == CallOrigin::Probe)
            .count();
        if outstanding >= MAX_PROBES {
            return;
        }
        let _ = self.send_call(CallOrigin::Probe, &target, Request::Ping {});
    }

    fn next_txid(&mut self) -> u32 {
        loop {
            let txid = self.next_txid;
            self.next_txid = self.next_txid.wrapping_add(1);
            if txid != 0 && !self.calls.contains_key(&txid) {
                return txid;
            }
        }
    }

    fn send_call(
        &mut self,
        origin: CallOrigin,
        target: &NodeInfo,
        request: Request,
    ) -> Result<()> {
        let txid = self.next_txid();
        let method = request.method();
        let message = Message::request(txid, *self.identity.id(), request);
        let bytes = codec::encode(&message)?;

        // adaptive timeout: EWMA RTT doubled, clamped
        let rtt = self
            .routing
            .read()
            .bucket_of(&target.id)
            .find(&target.id)
            .and_then(|e| e.rtt_ewma());
        let timeout = match rtt {
            Some(rtt) => Duration::from_millis((rtt * 2.0) as u64)
                .clamp(CALL_TIMEOUT_MIN, CALL_TIMEOUT_MAX),
            None => CALL_TIMEOUT_MIN,
        };

        let delay = self.throttle.outbound_delay(target.addr.ip());
        let now = Instant::now();
        let sent_at = now + delay;
        self.calls.insert(
            txid,
            RpcCall {
                method,
                target: target.clone(),
                origin,
                sent_at,
                stall_at: sent_at + timeout / 2,
                deadline: sent_at + timeout,
                stalled: false,
            },
        );
        self.routing.write().on_send(&target.id);

        if delay.is_zero() {
            self.out_queue.push((target.addr, bytes));
        } else {
            trace!("delaying call {} to {} by {:?}", txid, target.addr, delay);
            self.delayed.push(DelayedSend {
                due: now + delay,
                addr: target.addr,
                bytes,
            });
        }
        trace!("call {} {} -> {}", txid, method, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    async fn test_server() -> (
        RpcServer,
        mpsc::Sender<Command>,
        mpsc::UnboundedReceiver<ReactorEvent>,
    ) {
        let identity = Arc::new(Identity::generate());
        let config = Arc::new(NodeConfig {
            addr4: Some("127.0.0.1".parse().unwrap()),
            developer_mode: true,
            ..Default::default()
        });
        let routing = Arc::new(RwLock::new(RoutingTable::new(*identity.id())));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let server = RpcServer::bind(
            Family::V4,
            "127.0.0.1:0".parse().unwrap(),
            identity,
            config,
            routing,
            None,
            Arc::new(MemoryStorage::new()),
            Arc::new(TokenManager::new()),
            cmd_rx,
            ev_tx,
        )
        .await
        .unwrap();
        (server, cmd_tx, ev_rx)
    }

    #[tokio::test]
    async fn txids_are_nonzero_and_unique() {
        let (mut server, _tx, _rx) = test_server().await;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let txid = server.next_txid();
            assert_ne!(txid, 0);
            assert!(seen.insert(txid));
        }
    }

    #[tokio::test]
    async fn ping_request_is_answered() {
        let (mut server, _tx, _rx) = test_server().await;
        let peer = Identity::generate();
        let response = server
            .dispatch_request(
                &Request::Ping {},
                peer.id(),
                &"127.0.0.1:5555".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(response, Response::Ping {});
    }

    #[tokio::test]
    async fn store_value_requires_valid_token() {
        let (mut server, _tx, _rx) = test_server().await;
        let peer = Identity::generate();
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let value = crate::value::Value::immutable(b"tokened".to_vec()).unwrap();

        let err = server
            .dispatch_request(
                &Request::StoreValue {
                    token: 12345,
                    value: value.clone(),
                    expected_seq: None,
                },
                peer.id(),
                &remote,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let token = server.tokens.generate(peer.id(), &remote, &value.id());
        let response = server
            .dispatch_request(
                &Request::StoreValue {
                    token,
                    value: value.clone(),
                    expected_seq: None,
                },
                peer.id(),
                &remote,
            )
            .unwrap();
        assert_eq!(response, Response::StoreValue {});
        assert_eq!(server.storage.get_value(&value.id()).unwrap(), Some(value));
    }

    #[tokio::test]
    async fn announce_peer_checks_authorization() {
        let (mut server, _tx, _rx) = test_server().await;
        let owner = Identity::generate();
        let announcer = Identity::generate();
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        // record names a different node than the sender
        let peer =
            crate::peer::PeerInfo::new(&owner, Id::random(), None, 8888, None).unwrap();
        let token = server
            .tokens
            .generate(announcer.id(), &remote, &peer.peer_id);
        let err = server
            .dispatch_request(
                &Request::AnnouncePeer { token, peer },
                announcer.id(),
                &remote,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // record naming the sender is accepted
        let peer =
            crate::peer::PeerInfo::new(&owner, *announcer.id(), None, 8888, None).unwrap();
        let token = server
            .tokens
            .generate(announcer.id(), &remote, &peer.peer_id);
        let response = server
            .dispatch_request(
                &Request::AnnouncePeer { token, peer: peer.clone() },
                announcer.id(),
                &remote,
            )
            .unwrap();
        assert_eq!(response, Response::AnnouncePeer {});
        assert_eq!(
            server.storage.get_peers(&peer.peer_id, 0).unwrap(),
            vec![peer]
        );
    }

    #[tokio::test]
    async fn find_value_elides_nodes_next_to_value() {
        let (mut server, _tx, _rx) = test_server().await;
        let peer = Identity::generate();
        let remote: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let value = crate::value::Value::immutable(b"present".to_vec()).unwrap();
        server.storage.put_value(&value, false, None).unwrap();

        let response = server
            .dispatch_request(
                &Request::FindValue {
                    target: value.id(),
                    want4: true,
                    want6: false,
                    want_token: false,
                    expected_seq: None,
                },
                peer.id(),
                &remote,
            )
            .unwrap();
        match response {
            Response::FindValue { value: Some(v), nodes4, .. } => {
                assert_eq!(v, value);
                assert!(nodes4.is_none());
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
