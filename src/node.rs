//! The Diameter node: connection manager, router and request correlator.
//!
//! A single coordinator task owns the peer table, the pending-request table
//! and all connection state. Listener tasks and per-connection reader and
//! writer tasks communicate with it exclusively through channels, so no
//! shared state needs locking. A periodic wakeup tick (default one second)
//! drives timer checks, outbound queue drains, peer reconnects and the
//! one-minute statistics snapshots; worst-case timer latency is one tick.
//!
//! Base protocol commands (CER/CEA, DWR/DWA, DPR/DPA) are handled here and
//! never reach applications. Everything else is routed: answers complete
//! the matching pending request, requests go to the application registered
//! for their application id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::application::{self, Application, Dispatch, RequestHandler};
use crate::avp::{find_all_avps, Avp, AvpValue};
use crate::common::{
    avp_code, base_cmd, DisconnectCause, VendorSpecificApplicationId, BASE_APPLICATION_ID,
    RELAY_APPLICATION_ID,
};
use crate::config::{NodeConfig, PeerSettings};
use crate::dictionary;
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::message::{cmd_flags, DiameterMessage};
use crate::peer::{Direction, DisconnectReason, Peer, PeerConnection, PeerCounters, PeerState};
use crate::session::{EndToEndGenerator, SessionIdGenerator};
use crate::stats::{self, NodeStats, StatsHistory, StatsSnapshot};
use crate::transport::{Listener, Transport, TransportKind};
use crate::uri::DiameterUri;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const CMD_CHANNEL_LEN: usize = 256;
const EVENT_CHANNEL_LEN: usize = 1024;

/// A Diameter node under construction. Configure peers and applications,
/// then [`Node::start`] it to obtain a [`NodeHandle`].
pub struct Node {
    cfg: NodeConfig,
    peers: HashMap<String, Peer>,
    applications: Vec<Application>,
}

impl Node {
    /// Create a node from its configuration
    pub fn new(cfg: NodeConfig) -> Self {
        Self {
            cfg,
            peers: HashMap::new(),
            applications: Vec::new(),
        }
    }

    /// Add a known peer from its DiameterURI
    /// (`aaa://fqdn[:port][;transport=tcp|sctp]`). Adding an already known
    /// peer returns the existing entry unchanged.
    pub fn add_peer(&mut self, peer_uri: &str, settings: PeerSettings) -> DiameterResult<&mut Peer> {
        let uri: DiameterUri = peer_uri.parse()?;
        if !self.peers.contains_key(&uri.fqdn) {
            let peer = Peer::new(&uri.fqdn, uri.transport, uri.port, &self.cfg.realm, settings);
            self.peers.insert(uri.fqdn.clone(), peer);
        }
        Ok(self.peers.get_mut(&uri.fqdn).expect("peer just inserted"))
    }

    /// Register an application. Applications sharing an application id must
    /// have disjoint peer sets.
    pub fn add_application(&mut self, app: Application) -> DiameterResult<()> {
        for existing in &self.applications {
            if !existing.disjoint_with(&app) {
                return Err(DiameterError::CapabilityMismatch(format!(
                    "application id {} is already registered for an overlapping peer set",
                    app.application_id
                )));
            }
        }
        self.applications.push(app);
        Ok(())
    }

    /// Bind listeners, spawn the coordinator and connect persistent peers.
    pub async fn start(self) -> DiameterResult<NodeHandle> {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_LEN);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_LEN);

        let mut tcp_addrs = Vec::new();
        let mut sctp_addrs = Vec::new();
        let mut listener_tasks = Vec::new();
        if let Some(port) = self.cfg.tcp_port {
            for ip in &self.cfg.ip_addresses {
                let listener = Listener::bind(*ip, port, TransportKind::Tcp).await?;
                tcp_addrs.push(listener.local_addr()?);
                listener_tasks.push(spawn_listener(listener, event_tx.clone()));
            }
        }
        if let Some(port) = self.cfg.sctp_port {
            for ip in &self.cfg.ip_addresses {
                let listener = Listener::bind(*ip, port, TransportKind::Sctp).await?;
                sctp_addrs.push(listener.local_addr()?);
                listener_tasks.push(spawn_listener(listener, event_tx.clone()));
            }
        }

        let session_gen = Arc::new(SessionIdGenerator::new(&self.cfg.origin_host));
        let origin_host = self.cfg.origin_host.clone();
        let realm = self.cfg.realm.clone();

        let runner = Runner::new(
            self.cfg,
            self.peers,
            self.applications,
            event_tx,
            listener_tasks,
        );
        tokio::spawn(runner.run(cmd_rx, event_rx));

        log::info!("node {origin_host} started");
        Ok(NodeHandle {
            cmd_tx,
            session_gen,
            origin_host,
            realm,
            tcp_addrs,
            sctp_addrs,
        })
    }
}

fn spawn_listener(listener: Listener, event_tx: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(transport) => {
                    if event_tx.send(Event::Accepted { transport }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

/// A snapshot of one peer's observable state
#[derive(Debug, Clone)]
pub struct PeerStatus {
    /// Connection state, `Closed` when no connection exists
    pub state: PeerState,
    /// Why the last connection ended
    pub disconnect_reason: Option<DisconnectReason>,
    /// Base protocol message counters
    pub counters: PeerCounters,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<Command>,
    session_gen: Arc<SessionIdGenerator>,
    origin_host: String,
    realm: String,
    tcp_addrs: Vec<SocketAddr>,
    sctp_addrs: Vec<SocketAddr>,
}

impl NodeHandle {
    /// Our DiameterIdentity
    pub fn origin_host(&self) -> &str {
        &self.origin_host
    }

    /// Our realm
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Bound TCP listener addresses
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    /// Bound SCTP listener addresses
    pub fn sctp_addrs(&self) -> &[SocketAddr] {
        &self.sctp_addrs
    }

    /// Generate a new Session-Id value
    pub fn session_id(&self) -> String {
        self.session_gen.next_id()
    }

    /// Send a request and wait for its answer.
    ///
    /// The end-to-end identifier is assigned from the node generator when
    /// unset, the hop-by-hop identifier from the selected connection. The
    /// call completes with exactly one of: the answer, `RequestTimeout`,
    /// `RequestCancelled`, `PeerDisconnected` or a routing error; no
    /// pending-request entry survives the call.
    pub async fn send_request(
        &self,
        msg: DiameterMessage,
        timeout: Duration,
    ) -> DiameterResult<DiameterMessage> {
        if !msg.header.is_request() {
            return Err(DiameterError::MalformedMessage(
                "send_request needs a request message".into(),
            ));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SendRequest {
                msg: Box::new(msg),
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DiameterError::RequestCancelled)?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(DiameterError::PeerDisconnected),
        }
    }

    /// Aggregated statistics over all peers
    pub async fn statistics(&self) -> DiameterResult<NodeStats> {
        self.roundtrip(|reply| Command::Statistics { reply }).await
    }

    /// Statistics snapshots, oldest first (one per minute, 24h retained)
    pub async fn statistics_history(&self) -> DiameterResult<Vec<StatsSnapshot>> {
        self.roundtrip(|reply| Command::History { reply }).await
    }

    /// Observable state of one peer
    pub async fn peer_status(&self, host: &str) -> DiameterResult<Option<PeerStatus>> {
        let host = host.to_ascii_lowercase();
        self.roundtrip(|reply| Command::PeerStatus { host, reply })
            .await
    }

    /// Stop the node: send DPR to every READY peer and wait up to
    /// `timeout` for the disconnects to complete. With `force`, close all
    /// connections unconditionally.
    pub async fn stop(&self, timeout: Duration, force: bool) -> DiameterResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop {
                timeout,
                force,
                done: done_tx,
            })
            .await
            .map_err(|_| DiameterError::RequestCancelled)?;
        let _ = done_rx.await;
        Ok(())
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DiameterResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| DiameterError::RequestCancelled)?;
        rx.await.map_err(|_| DiameterError::RequestCancelled)
    }
}

enum Command {
    SendRequest {
        msg: Box<DiameterMessage>,
        timeout: Duration,
        reply: oneshot::Sender<DiameterResult<DiameterMessage>>,
    },
    Statistics {
        reply: oneshot::Sender<NodeStats>,
    },
    History {
        reply: oneshot::Sender<Vec<StatsSnapshot>>,
    },
    PeerStatus {
        host: String,
        reply: oneshot::Sender<Option<PeerStatus>>,
    },
    Stop {
        timeout: Duration,
        force: bool,
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Accepted {
        transport: Transport,
    },
    Connected {
        host: String,
        transport: Transport,
    },
    ConnectFailed {
        host: String,
        error: DiameterError,
    },
    Received {
        conn: u64,
        msg: Box<DiameterMessage>,
    },
    Closed {
        conn: u64,
        reason: DisconnectReason,
    },
    Answer {
        conn: u64,
        msg: Box<DiameterMessage>,
    },
}

struct PendingRequest {
    deadline: Instant,
    end_to_end_id: u32,
    reply: oneshot::Sender<DiameterResult<DiameterMessage>>,
}

enum TimerAction {
    Close(u64, DisconnectReason),
    SendDwr(u64),
}

struct Runner {
    cfg: NodeConfig,
    peers: HashMap<String, Peer>,
    applications: Vec<Application>,
    /// Accepted connections whose CER has not arrived yet
    half_open: HashMap<u64, PeerConnection>,
    /// Connection ident to peer host, for attached connections
    conn_index: HashMap<u64, String>,
    /// Outstanding requests keyed by (connection, hop-by-hop id)
    pending: HashMap<(u64, u32), PendingRequest>,
    /// Inbound requests being processed: receive time and requester host
    recv_stamp: HashMap<(u64, u32), (Instant, Option<String>)>,
    /// Answered end-to-end ids per origin host, for T-flag duplicates
    sent_answers: HashMap<String, VecDeque<u32>>,
    end_to_end_seq: EndToEndGenerator,
    history: StatsHistory,
    event_tx: mpsc::Sender<Event>,
    listener_tasks: Vec<JoinHandle<()>>,
    next_conn_ident: u64,
    rr_counter: u64,
    state_id: u32,
    last_snapshot: Instant,
    stopping: bool,
    stop_deadline: Option<Instant>,
    stop_done: Vec<oneshot::Sender<()>>,
}

impl Runner {
    fn new(
        cfg: NodeConfig,
        peers: HashMap<String, Peer>,
        applications: Vec<Application>,
        event_tx: mpsc::Sender<Event>,
        listener_tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            cfg,
            peers,
            applications,
            half_open: HashMap::new(),
            conn_index: HashMap::new(),
            pending: HashMap::new(),
            recv_stamp: HashMap::new(),
            sent_answers: HashMap::new(),
            end_to_end_seq: EndToEndGenerator::new(now_unix),
            history: StatsHistory::new(),
            event_tx,
            listener_tasks,
            next_conn_ident: 1,
            rr_counter: 1,
            state_id: now_unix as u32,
            last_snapshot: Instant::now(),
            stopping: false,
            stop_deadline: None,
            stop_done: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::Receiver<Event>,
    ) {
        let hosts: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.persistent)
            .map(|(h, _)| h.clone())
            .collect();
        for host in hosts {
            self.start_connect(&host);
        }

        let mut tick = tokio::time::interval(self.cfg.wakeup_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // every handle dropped: nobody can stop us politely
                        self.stopping = true;
                        self.shutdown_now(DisconnectReason::LocalShutdown);
                    }
                },
                Some(ev) = event_rx.recv() => self.handle_event(ev),
                _ = tick.tick() => self.handle_tick(),
            }
            if self.stop_complete() {
                break;
            }
        }

        for task in &self.listener_tasks {
            task.abort();
        }
        self.fail_all_pending(|| DiameterError::RequestCancelled);
        for done in self.stop_done.drain(..) {
            let _ = done.send(());
        }
        log::info!("node {} stopped", self.cfg.origin_host);
    }

    fn stop_complete(&self) -> bool {
        self.stopping
            && self.half_open.is_empty()
            && self.peers.values().all(|p| p.connection.is_none())
    }

    // ---- commands ------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendRequest {
                msg,
                timeout,
                reply,
            } => self.handle_send_request(*msg, timeout, reply),
            Command::Statistics { reply } => {
                let _ = reply.send(self.node_stats());
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.snapshots());
            }
            Command::PeerStatus { host, reply } => {
                let status = self.peers.get(&host).map(|p| PeerStatus {
                    state: p.state(),
                    disconnect_reason: p.disconnect_reason,
                    counters: p.counters,
                });
                let _ = reply.send(status);
            }
            Command::Stop {
                timeout,
                force,
                done,
            } => self.handle_stop(timeout, force, done),
        }
    }

    fn handle_send_request(
        &mut self,
        mut msg: DiameterMessage,
        timeout: Duration,
        reply: oneshot::Sender<DiameterResult<DiameterMessage>>,
    ) {
        if self.stopping {
            let _ = reply.send(Err(DiameterError::RequestCancelled));
            return;
        }
        if msg.header.end_to_end_id == 0 {
            msg.header.end_to_end_id = self.end_to_end_seq.next_sequence();
        }
        let host = match self.route_request(&msg) {
            Ok(host) => host,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let rr_stamp = self.rr_counter;
        self.rr_counter += 1;

        let peer = self.peers.get_mut(&host).expect("routed peer exists");
        peer.last_picked = rr_stamp;
        peer.counters.requests += 1;
        let conn = peer.connection.as_mut().expect("routed connection exists");
        if msg.header.hop_by_hop_id == 0 {
            msg.header.hop_by_hop_id = conn.hop_by_hop_seq.next_sequence();
        }
        let key = (conn.ident, msg.header.hop_by_hop_id);
        conn.enqueue(msg.encode().freeze());
        conn.in_flight += 1;
        log::debug!(
            "request {:#010x} routed to {host}",
            msg.header.hop_by_hop_id
        );

        self.pending.insert(
            key,
            PendingRequest {
                deadline: Instant::now() + timeout,
                end_to_end_id: msg.header.end_to_end_id,
                reply,
            },
        );
    }

    /// Select a peer for an outbound request: READY connections whose
    /// negotiated application set covers the message's application id. A
    /// matching Destination-Host wins outright; otherwise candidates are
    /// narrowed by Destination-Realm and the least-loaded one is chosen,
    /// round-robin on ties.
    fn route_request(&self, msg: &DiameterMessage) -> DiameterResult<String> {
        let app_id = msg.header.application_id;
        let mut candidates: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| {
                p.connection
                    .as_ref()
                    .is_some_and(|c| c.is_ready() && c.supports_application(app_id))
            })
            .collect();

        if let Some(dest_host) = msg.destination_host() {
            if let Some(peer) = candidates
                .iter()
                .find(|p| p.host_identity.eq_ignore_ascii_case(dest_host))
            {
                return Ok(peer.host_identity.clone());
            }
        }
        if let Some(dest_realm) = msg.destination_realm() {
            candidates.retain(|p| p.realm.eq_ignore_ascii_case(dest_realm));
        }
        candidates
            .into_iter()
            .min_by_key(|p| {
                let in_flight = p
                    .connection
                    .as_ref()
                    .map(|c| c.in_flight)
                    .unwrap_or(u32::MAX);
                (in_flight, p.last_picked)
            })
            .map(|p| p.host_identity.clone())
            .ok_or_else(|| {
                DiameterError::NoRoute(format!("no ready peer for application {app_id}"))
            })
    }

    fn handle_stop(&mut self, timeout: Duration, force: bool, done: oneshot::Sender<()>) {
        self.stop_done.push(done);
        if self.stopping {
            return;
        }
        log::info!("stopping node {}", self.cfg.origin_host);
        self.stopping = true;
        self.fail_all_pending(|| DiameterError::RequestCancelled);

        if force {
            self.shutdown_now(DisconnectReason::LocalShutdown);
            return;
        }
        self.stop_deadline = Some(Instant::now() + timeout);

        // half-open connections have nothing to say goodbye to
        let idents: Vec<u64> = self.half_open.keys().copied().collect();
        for ident in idents {
            self.close_connection(ident, DisconnectReason::LocalShutdown);
        }

        let hosts: Vec<String> = self.peers.keys().cloned().collect();
        for host in hosts {
            let slot = self
                .peers
                .get(&host)
                .and_then(|p| p.connection.as_ref().map(|c| (c.state, c.ident)));
            match slot {
                Some((state, _)) if state.is_ready() => self.send_dpr(&host),
                Some((PeerState::Closing, _)) => {}
                Some((_, ident)) => {
                    self.close_connection(ident, DisconnectReason::LocalShutdown)
                }
                None => {}
            }
        }
    }

    // ---- events --------------------------------------------------------

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted { transport } => self.handle_accepted(transport),
            Event::Connected { host, transport } => self.handle_connected(host, transport),
            Event::ConnectFailed { host, error } => {
                if let Some(peer) = self.peers.get_mut(&host) {
                    peer.connecting = false;
                    peer.last_disconnect = Some(Instant::now());
                    peer.disconnect_reason = Some(DisconnectReason::FailedConnect);
                }
                log::warn!("failed to connect to {host}: {error}");
            }
            Event::Received { conn, msg } => self.handle_received(conn, *msg),
            Event::Closed { conn, reason } => self.close_connection(conn, reason),
            Event::Answer { conn, msg } => self.answer_request(conn, *msg),
        }
    }

    fn handle_accepted(&mut self, transport: Transport) {
        if self.stopping {
            log::warn!(
                "rejecting a connection attempt from {}, node is shutting down",
                transport.peer_addr()
            );
            return;
        }
        let peer_addr = transport.peer_addr();
        let conn = self.spawn_connection(transport, Direction::Receiver);
        log::info!(
            "incoming {} connection {} from {peer_addr}, waiting for CER",
            conn.kind,
            conn.ident
        );
        self.half_open.insert(conn.ident, conn);
    }

    fn handle_connected(&mut self, host: String, transport: Transport) {
        let Some(peer) = self.peers.get_mut(&host) else {
            return;
        };
        peer.connecting = false;
        if peer.connection.is_some() {
            log::warn!("a connection to {host} exists already, dropping the new one");
            return;
        }

        let mut conn = self.spawn_connection(transport, Direction::Sender);
        let ident = conn.ident;
        let local_ip = conn.local_ip;
        log::info!("connection {ident} to {host} established, sending CER");

        let mut cer = self.build_cer(local_ip);
        self.conn_index.insert(ident, host.clone());
        let peer = self.peers.get_mut(&host).expect("peer looked up above");
        peer.disconnect_reason = None;
        peer.last_connect = Some(Instant::now());
        cer.header.hop_by_hop_id = conn.hop_by_hop_seq.next_sequence();
        conn.enqueue(cer.encode().freeze());
        peer.counters.requests += 1;
        peer.connection = Some(conn);
    }

    fn handle_received(&mut self, ident: u64, msg: DiameterMessage) {
        {
            let Some(conn) = self.conn_mut(ident) else {
                return;
            };
            conn.last_recv = Instant::now();
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.statistics.add_received();
            }
        }

        if !msg.header.has_valid_flags() {
            log::warn!(
                "connection {ident}: invalid header bits {:#04x}, closing",
                msg.header.flags
            );
            if msg.header.is_request() {
                let answer = application::error_answer(
                    &msg,
                    &self.cfg.origin_host,
                    &self.cfg.realm,
                    ResultCode::InvalidHdrBits,
                );
                self.refuse(ident, answer, DisconnectReason::Transport);
            } else {
                self.close_connection(ident, DisconnectReason::Transport);
            }
            return;
        }

        match (msg.header.is_request(), msg.header.command_code) {
            (true, base_cmd::CAPABILITIES_EXCHANGE) => self.handle_cer(ident, msg),
            (false, base_cmd::CAPABILITIES_EXCHANGE) => self.handle_cea(ident, msg),
            (true, base_cmd::DEVICE_WATCHDOG) => self.handle_dwr(ident, msg),
            (false, base_cmd::DEVICE_WATCHDOG) => self.handle_dwa(ident),
            (true, base_cmd::DISCONNECT_PEER) => self.handle_dpr(ident, msg),
            (false, base_cmd::DISCONNECT_PEER) => self.handle_dpa(ident),
            (true, _) => self.handle_app_request(ident, msg),
            (false, _) => self.handle_app_answer(ident, msg),
        }
    }

    // ---- base protocol -------------------------------------------------

    fn handle_cer(&mut self, ident: u64, msg: DiameterMessage) {
        let Some((direction, state)) = self.conn_view(ident) else {
            return;
        };
        if direction != Direction::Receiver || state != PeerState::WaitCer {
            log::warn!("connection {ident}: unexpected CER in state {state:?}, ignoring");
            return;
        }

        let Some(origin_host) = msg.origin_host().map(|s| s.to_ascii_lowercase()) else {
            log::warn!("connection {ident}: CER without Origin-Host");
            let mut answer = application::error_answer(
                &msg,
                &self.cfg.origin_host,
                &self.cfg.realm,
                ResultCode::MissingAvp,
            );
            answer.add_avp(failed_avp(&[avp_code::ORIGIN_HOST]));
            self.refuse(ident, answer, DisconnectReason::CerRejected);
            return;
        };

        let known = self.peers.contains_key(&origin_host);
        if !known && !self.cfg.accept_unknown_peers {
            log::warn!("CER from unknown peer {origin_host}, closing this connection");
            let answer = self.build_cea(&msg, ResultCode::UnknownPeer);
            self.refuse(ident, answer, DisconnectReason::CerRejected);
            return;
        }
        let occupied = self
            .peers
            .get(&origin_host)
            .map(|p| p.connection.is_some())
            .unwrap_or(false);
        if occupied {
            // one connection slot per peer; the established one stays
            log::warn!("{origin_host} is already connected, refusing the second connection");
            let answer = self.build_cea(&msg, ResultCode::ElectionLost);
            self.refuse(ident, answer, DisconnectReason::CerRejected);
            return;
        }

        let (peer_auth, peer_acct, relay) = advertised_applications(&msg);
        let auth: Vec<u32> = self
            .local_auth_ids()
            .into_iter()
            .filter(|id| peer_auth.contains(id))
            .collect();
        let acct: Vec<u32> = self
            .local_acct_ids()
            .into_iter()
            .filter(|id| peer_acct.contains(id))
            .collect();
        if auth.is_empty() && acct.is_empty() && !relay {
            log::warn!("{origin_host}: no common applications, refusing");
            let answer = self.build_cea(&msg, ResultCode::NoCommonApplication);
            self.refuse(ident, answer, DisconnectReason::CerRejected);
            return;
        }

        let answer = self.build_cea(&msg, ResultCode::Success);
        let realm = msg
            .origin_realm()
            .unwrap_or(self.cfg.realm.as_str())
            .to_string();

        let Some(mut conn) = self.half_open.remove(&ident) else {
            return;
        };
        conn.host_identity = origin_host.clone();
        conn.auth_application_ids = auth.clone();
        conn.acct_application_ids = acct.clone();
        conn.relay = relay;
        conn.state = PeerState::Open;
        conn.enqueue(answer.encode().freeze());

        if !known {
            log::info!("discovered peer {origin_host} in realm {realm}");
            let settings = PeerSettings {
                realm: Some(realm),
                ..PeerSettings::default()
            };
            let peer = Peer::new(
                &origin_host,
                conn.kind,
                conn.peer_addr.port(),
                &self.cfg.realm,
                settings,
            );
            self.peers.insert(origin_host.clone(), peer);
        }
        self.conn_index.insert(ident, origin_host.clone());
        let peer = self.peers.get_mut(&origin_host).expect("peer exists");
        peer.counters.cer += 1;
        peer.counters.cea += 1;
        peer.counters.requests += 1;
        peer.counters.answers += 1;
        peer.disconnect_reason = None;
        peer.last_connect = Some(Instant::now());
        peer.connection = Some(conn);
        log::info!(
            "{origin_host} is now READY, auth applications {auth:?}, acct applications {acct:?}"
        );
    }

    fn handle_cea(&mut self, ident: u64, msg: DiameterMessage) {
        let Some((direction, state)) = self.conn_view(ident) else {
            return;
        };
        if direction != Direction::Sender || state != PeerState::WaitCea {
            log::warn!("connection {ident}: unexpected CEA in state {state:?}, ignoring");
            return;
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.counters.answers += 1;
            }
        }

        let result = msg.result_code();
        if !matches!(result.map(ResultCode::from), Some(rc) if rc.is_success()) {
            log::warn!("connection {ident}: CER rejected with {result:?}, closing");
            self.close_connection(ident, DisconnectReason::CerRejected);
            return;
        }

        let (peer_auth, peer_acct, relay) = advertised_applications(&msg);
        let auth: Vec<u32> = self
            .local_auth_ids()
            .into_iter()
            .filter(|id| peer_auth.contains(id))
            .collect();
        let acct: Vec<u32> = self
            .local_acct_ids()
            .into_iter()
            .filter(|id| peer_acct.contains(id))
            .collect();
        if auth.is_empty() && acct.is_empty() && !relay {
            log::warn!("connection {ident}: CEA advertises no common application, closing");
            self.close_connection(ident, DisconnectReason::CerRejected);
            return;
        }

        let origin_host = msg
            .origin_host()
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        if let Some(conn) = self.conn_mut(ident) {
            conn.host_identity = origin_host;
            conn.auth_application_ids = auth.clone();
            conn.acct_application_ids = acct.clone();
            conn.relay = relay;
            conn.state = PeerState::Open;
        }
        if let Some(host) = self.conn_index.get(&ident) {
            log::info!(
                "{host} is now READY, auth applications {auth:?}, acct applications {acct:?}"
            );
        }
    }

    fn handle_dwr(&mut self, ident: u64, msg: DiameterMessage) {
        let Some((_, state)) = self.conn_view(ident) else {
            return;
        };
        if !state.is_ready() {
            log::warn!("connection {ident}: DWR in state {state:?}, ignoring");
            return;
        }
        let mut dwa = application::answer_from(&msg, &self.cfg.origin_host, &self.cfg.realm);
        dwa.add_avp(Avp::mandatory(
            avp_code::RESULT_CODE,
            AvpValue::Unsigned32(ResultCode::Success as u32),
        ));
        dwa.add_avp(Avp::mandatory(
            avp_code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.state_id),
        ));
        log::debug!("connection {ident}: DWR, answering DWA");
        if let Some(conn) = self.conn_mut(ident) {
            conn.enqueue(dwa.encode().freeze());
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.counters.dwr += 1;
                peer.counters.dwa += 1;
                peer.counters.requests += 1;
                peer.counters.answers += 1;
            }
        }
    }

    fn handle_dwa(&mut self, ident: u64) {
        if let Some(conn) = self.conn_mut(ident) {
            if conn.state == PeerState::OpenPendingDwa {
                conn.state = PeerState::Open;
            }
            conn.dwr_sent = None;
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            log::debug!("{host}: DWA received");
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.counters.answers += 1;
            }
        }
    }

    fn handle_dpr(&mut self, ident: u64, msg: DiameterMessage) {
        let cause = msg
            .find_avp(avp_code::DISCONNECT_CAUSE)
            .and_then(Avp::as_i32);
        log::info!("connection {ident}: DPR (cause {cause:?}), answering DPA");

        let mut dpa = application::answer_from(&msg, &self.cfg.origin_host, &self.cfg.realm);
        dpa.add_avp(Avp::mandatory(
            avp_code::RESULT_CODE,
            AvpValue::Unsigned32(ResultCode::Success as u32),
        ));
        if let Some(conn) = self.conn_mut(ident) {
            conn.enqueue(dpa.encode().freeze());
            conn.start_closing(false);
            conn.close_reason = Some(DisconnectReason::PeerDpr);
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.disconnect_reason = Some(DisconnectReason::PeerDpr);
                peer.counters.dpr += 1;
                peer.counters.dpa += 1;
                peer.counters.requests += 1;
                peer.counters.answers += 1;
            }
        }
    }

    fn handle_dpa(&mut self, ident: u64) {
        let closing = self
            .conn_mut(ident)
            .map(|c| c.state == PeerState::Closing && c.await_dpa)
            .unwrap_or(false);
        if closing {
            log::info!("connection {ident}: DPA received, closing");
            self.close_connection(ident, DisconnectReason::LocalShutdown);
        }
    }

    // ---- application traffic -------------------------------------------

    fn handle_app_request(&mut self, ident: u64, msg: DiameterMessage) {
        let Some(conn_host) = self.conn_mut(ident).and_then(|c| {
            if c.is_ready() {
                Some(c.host_identity.clone())
            } else {
                None
            }
        }) else {
            log::warn!("connection {ident}: application request before READY, dropping");
            return;
        };
        if let Some(peer) = self.peers.get_mut(&conn_host) {
            peer.counters.requests += 1;
        }

        let requester = msg.origin_host().map(|s| s.to_ascii_lowercase());
        self.recv_stamp.insert(
            (ident, msg.header.hop_by_hop_id),
            (Instant::now(), requester.clone()),
        );

        // rfc6733 5.5.4: reject retransmits of already answered requests
        if msg.header.is_retransmit() {
            let duplicate = requester
                .as_ref()
                .and_then(|host| self.sent_answers.get(host))
                .map(|history| history.contains(&msg.header.end_to_end_id))
                .unwrap_or(false);
            if duplicate {
                log::warn!(
                    "connection {ident}: retransmission of an answered request, rejecting"
                );
                let answer = application::error_answer(
                    &msg,
                    &self.cfg.origin_host,
                    &self.cfg.realm,
                    ResultCode::UnableToComply,
                );
                self.answer_request(ident, answer);
                return;
            }
        }

        if self.cfg.validate_inbound {
            let mut missing = Vec::new();
            if msg.origin_host().is_none() {
                missing.push(avp_code::ORIGIN_HOST);
            }
            if msg.origin_realm().is_none() {
                missing.push(avp_code::ORIGIN_REALM);
            }
            if !missing.is_empty() {
                log::warn!("connection {ident}: request missing mandatory AVPs {missing:?}");
                let mut answer = application::error_answer(
                    &msg,
                    &self.cfg.origin_host,
                    &self.cfg.realm,
                    ResultCode::MissingAvp,
                );
                answer.add_avp(failed_avp(&missing));
                self.answer_request(ident, answer);
                return;
            }
        }

        let app_id = msg.header.application_id;
        let dispatch = self
            .applications
            .iter()
            .find(|a| a.application_id == app_id && a.accepts_peer(&conn_host))
            .map(|a| match &a.dispatch {
                Dispatch::Inline(handler) => (Some(handler.clone()), None),
                Dispatch::Pool { handler, permits } => {
                    (None, Some((handler.clone(), permits.clone())))
                }
            });
        let Some((inline, pool)) = dispatch else {
            log::warn!("no application for id {app_id}, answering 3007");
            let answer = application::error_answer(
                &msg,
                &self.cfg.origin_host,
                &self.cfg.realm,
                ResultCode::ApplicationUnsupported,
            );
            self.answer_request(ident, answer);
            return;
        };

        if let Some(handler) = inline {
            let answer = handler(msg.clone()).unwrap_or_else(|| {
                application::error_answer(
                    &msg,
                    &self.cfg.origin_host,
                    &self.cfg.realm,
                    ResultCode::UnableToComply,
                )
            });
            self.answer_request(ident, answer);
            return;
        }

        let (handler, permits) = pool.expect("either inline or pool");
        let event_tx = self.event_tx.clone();
        let origin_host = self.cfg.origin_host.clone();
        let realm = self.cfg.realm.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let request = msg.clone();
            let outcome = run_pool_handler(handler, msg).await;
            let answer = outcome.unwrap_or_else(|| {
                application::error_answer(
                    &request,
                    &origin_host,
                    &realm,
                    ResultCode::UnableToComply,
                )
            });
            let _ = event_tx
                .send(Event::Answer {
                    conn: ident,
                    msg: Box::new(answer),
                })
                .await;
        });
    }

    fn handle_app_answer(&mut self, ident: u64, msg: DiameterMessage) {
        let key = (ident, msg.header.hop_by_hop_id);
        match self.pending.get(&key) {
            None => {
                log::warn!(
                    "connection {ident}: answer {:#010x} with nobody expecting it, dropping",
                    msg.header.hop_by_hop_id
                );
            }
            Some(p) if p.end_to_end_id != msg.header.end_to_end_id => {
                log::warn!(
                    "connection {ident}: answer {:#010x} end-to-end id mismatch, dropping",
                    msg.header.hop_by_hop_id
                );
            }
            Some(_) => {
                let p = self.pending.remove(&key).expect("entry matched above");
                if let Some(conn) = self.conn_mut(ident) {
                    conn.in_flight = conn.in_flight.saturating_sub(1);
                }
                if let Some(host) = self.conn_index.get(&ident).cloned() {
                    if let Some(peer) = self.peers.get_mut(&host) {
                        peer.counters.answers += 1;
                    }
                }
                if p.reply.send(Ok(msg)).is_err() {
                    log::debug!("connection {ident}: waiter gone, late answer dropped");
                }
            }
        }
    }

    /// Send an answer for an inbound request and record its statistics
    fn answer_request(&mut self, ident: u64, answer: DiameterMessage) {
        self.record_answer(ident, &answer);
        if let Some(conn) = self.conn_mut(ident) {
            conn.enqueue(answer.encode().freeze());
        }
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.counters.answers += 1;
            }
        }
    }

    fn record_answer(&mut self, ident: u64, answer: &DiameterMessage) {
        let key = (ident, answer.header.hop_by_hop_id);
        let Some((received_at, requester)) = self.recv_stamp.remove(&key) else {
            return;
        };
        if let Some(requester) = requester {
            let history = self.sent_answers.entry(requester).or_default();
            if history.len() == self.cfg.retransmit_history {
                history.pop_front();
            }
            history.push_back(answer.header.end_to_end_id);
        }
        let name = dictionary::command_name(answer.header.command_code);
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.statistics.add_processed(&name, received_at.elapsed());
                if let Some(rc) = answer.result_code() {
                    peer.statistics.add_result_code(rc);
                }
            }
        }
    }

    // ---- timers and housekeeping ---------------------------------------

    fn handle_tick(&mut self) {
        if !self.stopping && self.last_snapshot.elapsed() >= SNAPSHOT_INTERVAL {
            self.last_snapshot = Instant::now();
            let snapshot = self.node_stats();
            self.history.push(snapshot);
        }
        self.check_timers();
        for conn in self.half_open.values_mut() {
            conn.drain();
        }
        for peer in self.peers.values_mut() {
            if let Some(conn) = peer.connection.as_mut() {
                conn.drain();
            }
        }
        self.expire_pending();
        self.reconnect_peers();
        if let Some(deadline) = self.stop_deadline {
            if Instant::now() >= deadline && !self.stop_complete() {
                log::warn!("shutdown timeout reached, forcing connections to close");
                self.shutdown_now(DisconnectReason::LocalShutdown);
            }
        }
    }

    fn check_timers(&mut self) {
        let mut actions = Vec::new();

        for (ident, conn) in &self.half_open {
            let timers = self.cfg.timers.clone();
            match conn.state {
                PeerState::WaitCer if conn.idle_for() > timers.cer => {
                    actions.push(TimerAction::Close(*ident, DisconnectReason::CerTimeout));
                }
                PeerState::Closing if conn.flushed() => {
                    actions.push(TimerAction::Close(
                        *ident,
                        conn.close_reason.unwrap_or(DisconnectReason::LocalShutdown),
                    ));
                }
                _ => {}
            }
        }

        for peer in self.peers.values() {
            let Some(conn) = peer.connection.as_ref() else {
                continue;
            };
            let timers = peer.effective_timers(&self.cfg.timers);
            match conn.state {
                PeerState::WaitCea if conn.idle_for() > timers.cea => {
                    log::warn!("{}: CEA timeout, closing connection", peer.host_identity);
                    actions.push(TimerAction::Close(conn.ident, DisconnectReason::CeaTimeout));
                }
                PeerState::WaitCer if conn.idle_for() > timers.cer => {
                    log::warn!("{}: CER timeout, closing connection", peer.host_identity);
                    actions.push(TimerAction::Close(conn.ident, DisconnectReason::CerTimeout));
                }
                PeerState::OpenPendingDwa => {
                    if conn.dwa_wait().is_some_and(|w| w > timers.dwa) {
                        log::warn!("{}: DWA timeout, closing connection", peer.host_identity);
                        actions
                            .push(TimerAction::Close(conn.ident, DisconnectReason::DwaTimeout));
                    }
                }
                PeerState::Open if !self.stopping && conn.idle_for() > timers.idle => {
                    actions.push(TimerAction::SendDwr(conn.ident));
                }
                PeerState::Closing => {
                    let waited = conn
                        .closing_since
                        .map(|t| t.elapsed())
                        .unwrap_or_default();
                    if conn.await_dpa {
                        if waited > timers.dwa {
                            log::warn!(
                                "{}: DPA timeout, closing connection",
                                peer.host_identity
                            );
                            actions.push(TimerAction::Close(
                                conn.ident,
                                DisconnectReason::DpaTimeout,
                            ));
                        }
                    } else if conn.flushed() || waited > timers.dwa {
                        actions.push(TimerAction::Close(
                            conn.ident,
                            conn.close_reason.unwrap_or(DisconnectReason::LocalShutdown),
                        ));
                    }
                }
                _ => {}
            }
        }

        for action in actions {
            match action {
                TimerAction::Close(ident, reason) => self.close_connection(ident, reason),
                TimerAction::SendDwr(ident) => self.send_dwr(ident),
            }
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<(u64, u32)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(p) = self.pending.remove(&key) {
                log::debug!("request {:#010x} timed out", key.1);
                if p.reply.send(Err(DiameterError::RequestTimeout)).is_err() {
                    log::debug!("request {:#010x} was cancelled by the caller", key.1);
                }
            }
            if let Some(conn) = self.conn_mut(key.0) {
                conn.in_flight = conn.in_flight.saturating_sub(1);
            }
        }
    }

    fn reconnect_peers(&mut self) {
        if self.stopping {
            return;
        }
        let hosts: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.persistent && p.connection.is_none() && !p.connecting)
            .filter(|(_, p)| {
                !(p.disconnect_reason == Some(DisconnectReason::PeerDpr) && !p.always_reconnect)
            })
            .filter(|(_, p)| match p.last_disconnect {
                None => true,
                Some(t) => t.elapsed() >= p.effective_timers(&self.cfg.timers).reconnect_wait,
            })
            .map(|(h, _)| h.clone())
            .collect();
        for host in hosts {
            if let Some(since) = self.peers.get(&host).and_then(Peer::disconnected_since) {
                log::info!(
                    "connection to {host} has been lost for {}s, reconnecting",
                    since.as_secs()
                );
            }
            self.start_connect(&host);
        }
    }

    fn start_connect(&mut self, host: &str) {
        let Some(peer) = self.peers.get_mut(host) else {
            return;
        };
        if peer.connection.is_some() || peer.connecting {
            return;
        }
        if peer.ip_addresses.is_empty() {
            log::warn!("{host} has no addresses configured, cannot connect");
            return;
        }
        peer.connecting = true;
        let addrs = peer.ip_addresses.clone();
        let port = peer.port;
        let kind = peer.transport;
        let host = host.to_string();
        let event_tx = self.event_tx.clone();
        log::info!("connecting to {host}:{port} over {kind}");
        tokio::spawn(async move {
            match Transport::connect(addrs, port, kind).await {
                Ok(transport) => {
                    let _ = event_tx.send(Event::Connected { host, transport }).await;
                }
                Err(error) => {
                    let _ = event_tx.send(Event::ConnectFailed { host, error }).await;
                }
            }
        });
    }

    fn send_dwr(&mut self, ident: u64) {
        let mut dwr = self.base_request(base_cmd::DEVICE_WATCHDOG);
        dwr.add_avp(Avp::mandatory(
            avp_code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.state_id),
        ));
        let Some(conn) = self.conn_mut(ident) else {
            return;
        };
        dwr.header.hop_by_hop_id = conn.hop_by_hop_seq.next_sequence();
        conn.state = PeerState::OpenPendingDwa;
        conn.dwr_sent = Some(Instant::now());
        conn.enqueue(dwr.encode().freeze());
        if let Some(host) = self.conn_index.get(&ident).cloned() {
            log::debug!("{host}: idle, sending DWR");
            if let Some(peer) = self.peers.get_mut(&host) {
                peer.counters.requests += 1;
            }
        }
    }

    fn send_dpr(&mut self, host: &str) {
        let mut dpr = self.base_request(base_cmd::DISCONNECT_PEER);
        dpr.add_avp(Avp::mandatory(
            avp_code::DISCONNECT_CAUSE,
            AvpValue::Enumerated(DisconnectCause::Rebooting as i32),
        ));
        let Some(peer) = self.peers.get_mut(host) else {
            return;
        };
        let Some(conn) = peer.connection.as_mut() else {
            return;
        };
        log::info!("{host}: sending DPR");
        dpr.header.hop_by_hop_id = conn.hop_by_hop_seq.next_sequence();
        conn.enqueue(dpr.encode().freeze());
        conn.start_closing(true);
        conn.close_reason = Some(DisconnectReason::LocalShutdown);
        peer.disconnect_reason = Some(DisconnectReason::LocalShutdown);
        peer.counters.requests += 1;
    }

    // ---- connection lifecycle ------------------------------------------

    fn spawn_connection(&mut self, transport: Transport, direction: Direction) -> PeerConnection {
        let ident = self.next_conn_ident;
        self.next_conn_ident += 1;
        let kind = transport.kind();
        let peer_addr = transport.peer_addr();
        let local_ip = transport.local_addr().ok().map(|a| a.ip());
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(self.cfg.outbound_queue_len.max(1));
        let (mut reader, mut writer) = transport.into_split();

        let event_tx = self.event_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(msg)) => {
                        let event = Event::Received {
                            conn: ident,
                            msg: Box::new(msg),
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx
                            .send(Event::Closed {
                                conn: ident,
                                reason: DisconnectReason::Transport,
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        log::warn!("connection {ident}: receive failed: {e}");
                        let _ = event_tx
                            .send(Event::Closed {
                                conn: ident,
                                reason: DisconnectReason::Transport,
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send_bytes(&frame).await {
                    log::warn!("connection {ident}: send failed: {e}");
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        PeerConnection::new(
            ident,
            direction,
            kind,
            peer_addr,
            local_ip,
            out_tx,
            reader_task,
            writer_task,
        )
    }

    fn close_connection(&mut self, ident: u64, reason: DisconnectReason) {
        self.recv_stamp.retain(|(c, _), _| *c != ident);

        if let Some(conn) = self.half_open.remove(&ident) {
            let reason = conn.close_reason.unwrap_or(reason);
            conn.close(abortive(reason));
            log::info!("connection {ident} closed before CER/CEA: {reason:?}");
            return;
        }

        let Some(host) = self.conn_index.get(&ident).cloned() else {
            return;
        };
        let Some(peer) = self.peers.get_mut(&host) else {
            return;
        };
        if peer
            .connection
            .as_ref()
            .map(|c| c.ident != ident)
            .unwrap_or(true)
        {
            self.conn_index.remove(&ident);
            return;
        }
        let conn = peer.connection.take().expect("checked above");
        let reason = conn.close_reason.unwrap_or(reason);
        conn.close(abortive(reason));
        peer.last_disconnect = Some(Instant::now());
        if peer.disconnect_reason.is_none() {
            peer.disconnect_reason = Some(reason);
        }
        self.conn_index.remove(&ident);
        log::info!("{host} disconnected: {reason:?}");
        drop(conn);

        // connection-bound requests can never complete now
        let keys: Vec<(u64, u32)> = self
            .pending
            .keys()
            .filter(|(c, _)| *c == ident)
            .copied()
            .collect();
        for key in keys {
            if let Some(p) = self.pending.remove(&key) {
                let _ = p.reply.send(Err(DiameterError::PeerDisconnected));
            }
        }
    }

    fn shutdown_now(&mut self, reason: DisconnectReason) {
        let idents: Vec<u64> = self.half_open.keys().copied().collect();
        for ident in idents {
            if let Some(conn) = self.half_open.remove(&ident) {
                conn.close(true);
            }
        }
        let hosts: Vec<String> = self.peers.keys().cloned().collect();
        for host in hosts {
            let Some(peer) = self.peers.get_mut(&host) else {
                continue;
            };
            if let Some(conn) = peer.connection.take() {
                self.conn_index.remove(&conn.ident);
                conn.close(true);
                peer.last_disconnect = Some(Instant::now());
                if peer.disconnect_reason.is_none() {
                    peer.disconnect_reason = Some(reason);
                }
            }
        }
        self.fail_all_pending(|| DiameterError::PeerDisconnected);
    }

    fn fail_all_pending(&mut self, make_error: impl Fn() -> DiameterError) {
        for (_, p) in self.pending.drain() {
            let _ = p.reply.send(Err(make_error()));
        }
    }

    // ---- helpers -------------------------------------------------------

    fn conn_mut(&mut self, ident: u64) -> Option<&mut PeerConnection> {
        if self.half_open.contains_key(&ident) {
            return self.half_open.get_mut(&ident);
        }
        let host = self.conn_index.get(&ident)?.clone();
        self.peers
            .get_mut(&host)?
            .connection
            .as_mut()
            .filter(|c| c.ident == ident)
    }

    fn conn_view(&mut self, ident: u64) -> Option<(Direction, PeerState)> {
        self.conn_mut(ident).map(|c| (c.direction, c.state))
    }

    fn local_auth_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .applications
            .iter()
            .filter(|a| a.is_auth)
            .map(|a| a.application_id)
            .collect();
        ids.dedup();
        ids
    }

    fn local_acct_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .applications
            .iter()
            .filter(|a| a.is_acct)
            .map(|a| a.application_id)
            .collect();
        ids.dedup();
        ids
    }

    fn node_stats(&self) -> NodeStats {
        stats::aggregate(self.peers.values().map(|p| &p.statistics))
    }

    fn base_request(&mut self, command_code: u32) -> DiameterMessage {
        let mut msg = DiameterMessage::new_request(command_code, BASE_APPLICATION_ID);
        msg.header.flags = cmd_flags::REQUEST;
        msg.header.end_to_end_id = self.end_to_end_seq.next_sequence();
        msg.add_avp(Avp::mandatory(
            avp_code::ORIGIN_HOST,
            AvpValue::Identity(self.cfg.origin_host.clone()),
        ));
        msg.add_avp(Avp::mandatory(
            avp_code::ORIGIN_REALM,
            AvpValue::Identity(self.cfg.realm.clone()),
        ));
        msg
    }

    fn build_cer(&mut self, local_ip: Option<IpAddr>) -> DiameterMessage {
        let mut cer = self.base_request(base_cmd::CAPABILITIES_EXCHANGE);
        let addresses: Vec<IpAddr> = if self.cfg.ip_addresses.is_empty() {
            local_ip.into_iter().collect()
        } else {
            self.cfg.ip_addresses.clone()
        };
        for ip in addresses {
            cer.add_avp(Avp::mandatory(
                avp_code::HOST_IP_ADDRESS,
                AvpValue::Address(ip),
            ));
        }
        self.add_capabilities(&mut cer);
        cer
    }

    fn build_cea(&self, request: &DiameterMessage, result: ResultCode) -> DiameterMessage {
        let mut cea = application::answer_from(request, &self.cfg.origin_host, &self.cfg.realm);
        cea.add_avp(Avp::mandatory(
            avp_code::RESULT_CODE,
            AvpValue::Unsigned32(result as u32),
        ));
        if result.is_protocol_error() {
            cea.header.set_error();
        }
        for ip in &self.cfg.ip_addresses {
            cea.add_avp(Avp::mandatory(
                avp_code::HOST_IP_ADDRESS,
                AvpValue::Address(*ip),
            ));
        }
        self.add_capabilities(&mut cea);
        cea
    }

    fn add_capabilities(&self, msg: &mut DiameterMessage) {
        msg.add_avp(Avp::mandatory(
            avp_code::VENDOR_ID,
            AvpValue::Unsigned32(self.cfg.vendor_id),
        ));
        msg.add_avp(Avp::new(
            avp_code::PRODUCT_NAME,
            0,
            None,
            AvpValue::Utf8String(self.cfg.product_name.clone()),
        ));
        msg.add_avp(Avp::mandatory(
            avp_code::ORIGIN_STATE_ID,
            AvpValue::Unsigned32(self.state_id),
        ));
        for vendor in &self.cfg.supported_vendor_ids {
            msg.add_avp(Avp::mandatory(
                avp_code::SUPPORTED_VENDOR_ID,
                AvpValue::Unsigned32(*vendor),
            ));
        }
        for id in self.local_auth_ids() {
            msg.add_avp(Avp::mandatory(
                avp_code::AUTH_APPLICATION_ID,
                AvpValue::Unsigned32(id),
            ));
        }
        for id in self.local_acct_ids() {
            msg.add_avp(Avp::mandatory(
                avp_code::ACCT_APPLICATION_ID,
                AvpValue::Unsigned32(id),
            ));
        }
    }

    fn refuse(&mut self, ident: u64, answer: DiameterMessage, reason: DisconnectReason) {
        let frame = answer.encode().freeze();
        if let Some(conn) = self.conn_mut(ident) {
            conn.enqueue(frame);
            conn.start_closing(false);
            conn.close_reason = Some(reason);
        }
    }
}

async fn run_pool_handler(
    handler: Arc<RequestHandler>,
    msg: DiameterMessage,
) -> Option<DiameterMessage> {
    match tokio::task::spawn_blocking(move || handler(msg)).await {
        Ok(answer) => answer,
        Err(e) => {
            log::warn!("request handler failed: {e}");
            None
        }
    }
}

/// Abortive closes tear the socket down immediately; graceful ones let the
/// writer drain its queue first.
fn abortive(reason: DisconnectReason) -> bool {
    matches!(
        reason,
        DisconnectReason::Transport
            | DisconnectReason::FailedConnect
            | DisconnectReason::CeaTimeout
            | DisconnectReason::CerTimeout
            | DisconnectReason::DwaTimeout
            | DisconnectReason::DpaTimeout
    )
}

fn failed_avp(codes: &[u32]) -> Avp {
    let inner: Vec<Avp> = codes
        .iter()
        .map(|code| Avp::build(*code, 0, AvpValue::OctetString(Bytes::new())))
        .collect();
    Avp::mandatory(avp_code::FAILED_AVP, AvpValue::Grouped(inner))
}

fn advertised_applications(msg: &DiameterMessage) -> (HashSet<u32>, HashSet<u32>, bool) {
    let mut auth: HashSet<u32> = find_all_avps(&msg.avps, avp_code::AUTH_APPLICATION_ID)
        .iter()
        .filter_map(|a| a.as_u32())
        .collect();
    let mut acct: HashSet<u32> = find_all_avps(&msg.avps, avp_code::ACCT_APPLICATION_ID)
        .iter()
        .filter_map(|a| a.as_u32())
        .collect();
    for avp in find_all_avps(&msg.avps, avp_code::VENDOR_SPECIFIC_APPLICATION_ID) {
        if let Some(vsa) = VendorSpecificApplicationId::from_avp(avp) {
            if let Some(id) = vsa.auth_application_id {
                auth.insert(id);
            }
            if let Some(id) = vsa.acct_application_id {
                acct.insert(id);
            }
        }
    }
    let relay = auth.contains(&RELAY_APPLICATION_ID) || acct.contains(&RELAY_APPLICATION_ID);
    (auth, acct, relay)
}
