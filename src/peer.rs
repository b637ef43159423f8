//! Peer and peer connection state per RFC 6733 Section 5.6
//!
//! A [`Peer`] is a configured or discovered remote node; it exists whether
//! or not a connection is up and carries configuration, counters and
//! statistics. A [`PeerConnection`] is one live connection occupying the
//! peer's single connection slot.
//!
//! Connection state machine:
//! ```text
//!   sender:    Closed -> WaitConnAck -> WaitCea -> Open
//!   receiver:  Closed -> WaitCer -> Open
//!   Open -> OpenPendingDwa (DWR sent)  -> Open (DWA) | Closed (timeout)
//!   Open -> Closing (DPR sent or received) -> Closed
//! ```
//! READY = Open or OpenPendingDwa; only READY connections carry
//! application traffic.

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{PeerSettings, PeerTimerOverrides, TimerConfig};
use crate::session::SequenceGenerator;
use crate::stats::PeerStats;
use crate::transport::TransportKind;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No connection
    Closed,
    /// Outbound socket connect in progress
    WaitConnAck,
    /// Responder waiting for the peer's CER
    WaitCer,
    /// Initiator sent CER, waiting for CEA
    WaitCea,
    /// Capabilities exchanged, connection carries traffic
    Open,
    /// A DWR is outstanding; still carries traffic
    OpenPendingDwa,
    /// Winding down: DPR in flight or final flush before close
    Closing,
}

impl PeerState {
    /// READY states are eligible for application traffic
    pub fn is_ready(self) -> bool {
        matches!(self, PeerState::Open | PeerState::OpenPendingDwa)
    }
}

/// Direction of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We initiated the connection
    Sender,
    /// The peer connected to us
    Receiver,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Socket error or unexpected close
    Transport,
    /// The outbound socket never connected
    FailedConnect,
    /// No CEA within the configured timeout
    CeaTimeout,
    /// No CER within the configured timeout
    CerTimeout,
    /// Our CER was rejected by the peer
    CerRejected,
    /// No DWA within the configured timeout
    DwaTimeout,
    /// No DPA within the configured timeout
    DpaTimeout,
    /// We disconnected on purpose (DPR sent, or node shutdown)
    LocalShutdown,
    /// The peer sent a DPR
    PeerDpr,
}

/// Base protocol message counters for a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounters {
    /// CER messages received
    pub cer: u64,
    /// CEA messages sent
    pub cea: u64,
    /// DWR messages received
    pub dwr: u64,
    /// DWA messages sent
    pub dwa: u64,
    /// DPR messages received
    pub dpr: u64,
    /// DPA messages sent
    pub dpa: u64,
    /// Total requests, sent and received
    pub requests: u64,
    /// Total answers, sent and received
    pub answers: u64,
}

/// A configured or discovered remote Diameter node
#[derive(Debug)]
pub struct Peer {
    /// Peer FQDN (DiameterIdentity), lowercase
    pub host_identity: String,
    /// Peer realm
    pub realm: String,
    /// Transport used for outgoing connections
    pub transport: TransportKind,
    /// Port for outgoing connections
    pub port: u16,
    /// Addresses for outgoing connections; empty for accept-only peers
    pub ip_addresses: Vec<IpAddr>,
    /// Connect at startup and reconnect after connection loss
    pub persistent: bool,
    /// Reconnect even after a clean DPR/DPA disconnect
    pub always_reconnect: bool,
    /// Per-peer timer overrides
    pub timers: PeerTimerOverrides,
    /// Message counters
    pub counters: PeerCounters,
    /// Request processing statistics
    pub statistics: PeerStats,
    /// The single connection slot; `None` while disconnected
    pub connection: Option<PeerConnection>,
    /// Set while an outbound connect attempt is in flight
    pub(crate) connecting: bool,
    /// When the peer last connected
    pub last_connect: Option<Instant>,
    /// When the peer last disconnected
    pub last_disconnect: Option<Instant>,
    /// Why the last connection ended; cleared on reconnect
    pub disconnect_reason: Option<DisconnectReason>,
    /// Round-robin stamp for routing tie-breaks
    pub(crate) last_picked: u64,
}

impl Peer {
    /// Create a peer from its identity and connection settings
    pub fn new(
        host_identity: &str,
        transport: TransportKind,
        port: u16,
        default_realm: &str,
        settings: PeerSettings,
    ) -> Self {
        Self {
            host_identity: host_identity.to_ascii_lowercase(),
            realm: settings
                .realm
                .unwrap_or_else(|| default_realm.to_string()),
            transport,
            port,
            ip_addresses: settings.ip_addresses,
            persistent: settings.persistent,
            always_reconnect: settings.always_reconnect,
            timers: settings.timers,
            counters: PeerCounters::default(),
            statistics: PeerStats::new(),
            connection: None,
            connecting: false,
            last_connect: None,
            last_disconnect: None,
            disconnect_reason: None,
            last_picked: 0,
        }
    }

    /// Time since the last disconnect, if the peer ever disconnected
    pub fn disconnected_since(&self) -> Option<Duration> {
        self.last_disconnect.map(|t| t.elapsed())
    }

    /// Observable state: the connection state, or the connect attempt, or
    /// Closed
    pub fn state(&self) -> PeerState {
        match &self.connection {
            Some(conn) => conn.state,
            None if self.connecting => PeerState::WaitConnAck,
            None => PeerState::Closed,
        }
    }

    /// Effective timers: peer overrides over node defaults
    pub fn effective_timers(&self, defaults: &TimerConfig) -> TimerConfig {
        TimerConfig {
            cea: self.timers.cea.unwrap_or(defaults.cea),
            cer: self.timers.cer.unwrap_or(defaults.cer),
            dwa: self.timers.dwa.unwrap_or(defaults.dwa),
            idle: self.timers.idle.unwrap_or(defaults.idle),
            reconnect_wait: self
                .timers
                .reconnect_wait
                .unwrap_or(defaults.reconnect_wait),
        }
    }
}

/// One live connection to a peer
#[derive(Debug)]
pub struct PeerConnection {
    /// Node-unique connection identifier
    pub ident: u64,
    /// Who initiated the connection
    pub direction: Direction,
    /// Current state
    pub state: PeerState,
    /// Transport protocol
    pub kind: TransportKind,
    /// Remote socket address
    pub peer_addr: SocketAddr,
    /// Local address of the socket, advertised in CER/CEA
    pub local_ip: Option<IpAddr>,
    /// Peer Origin-Host, learned from CER/CEA; empty until then
    pub host_identity: String,
    /// Negotiated auth application ids (local ∩ advertised)
    pub auth_application_ids: Vec<u32>,
    /// Negotiated acct application ids (local ∩ advertised)
    pub acct_application_ids: Vec<u32>,
    /// The peer advertised the relay application
    pub relay: bool,
    /// Hop-by-hop identifier generator, randomly seeded
    pub hop_by_hop_seq: SequenceGenerator,
    /// Outstanding requests sent on this connection
    pub in_flight: u32,
    pub(crate) out_tx: mpsc::Sender<Bytes>,
    pub(crate) backlog: VecDeque<Bytes>,
    pub(crate) last_recv: Instant,
    pub(crate) dwr_sent: Option<Instant>,
    pub(crate) closing_since: Option<Instant>,
    /// In Closing because we sent a DPR and owe the peer time for a DPA
    pub(crate) await_dpa: bool,
    /// Reason to record when the Closing flush completes
    pub(crate) close_reason: Option<DisconnectReason>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PeerConnection {
    /// Assemble a connection around its writer queue and I/O tasks
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ident: u64,
        direction: Direction,
        kind: TransportKind,
        peer_addr: SocketAddr,
        local_ip: Option<IpAddr>,
        out_tx: mpsc::Sender<Bytes>,
        reader_task: JoinHandle<()>,
        writer_task: JoinHandle<()>,
    ) -> Self {
        Self {
            ident,
            direction,
            state: match direction {
                Direction::Sender => PeerState::WaitCea,
                Direction::Receiver => PeerState::WaitCer,
            },
            kind,
            peer_addr,
            local_ip,
            host_identity: String::new(),
            auth_application_ids: Vec::new(),
            acct_application_ids: Vec::new(),
            relay: false,
            hop_by_hop_seq: SequenceGenerator::new(),
            in_flight: 0,
            out_tx,
            backlog: VecDeque::new(),
            last_recv: Instant::now(),
            dwr_sent: None,
            closing_since: None,
            await_dpa: false,
            close_reason: None,
            reader_task,
            writer_task,
        }
    }

    /// READY connections carry application traffic
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Whether the negotiated application set covers `app_id`
    pub fn supports_application(&self, app_id: u32) -> bool {
        self.relay
            || self.auth_application_ids.contains(&app_id)
            || self.acct_application_ids.contains(&app_id)
    }

    /// Queue an encoded frame for the writer, preserving order
    pub(crate) fn enqueue(&mut self, frame: Bytes) {
        self.backlog.push_back(frame);
        self.drain();
    }

    /// Move backlogged frames into the writer queue until it fills up
    pub(crate) fn drain(&mut self) {
        while let Some(frame) = self.backlog.pop_front() {
            match self.out_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    self.backlog.push_front(frame);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }

    /// True when every queued frame has been handed to the writer
    pub(crate) fn flushed(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Time since the last received message
    pub fn idle_for(&self) -> Duration {
        self.last_recv.elapsed()
    }

    /// How long a DWR has gone unanswered
    pub fn dwa_wait(&self) -> Option<Duration> {
        self.dwr_sent.map(|t| t.elapsed())
    }

    /// Mark entry into the Closing state
    pub(crate) fn start_closing(&mut self, await_dpa: bool) {
        self.state = PeerState::Closing;
        self.closing_since = Some(Instant::now());
        self.await_dpa = await_dpa;
    }

    /// Tear down the connection tasks. The writer naturally drains and
    /// closes when the queue sender is dropped; `force` aborts it instead.
    pub(crate) fn close(&self, force: bool) {
        self.reader_task.abort();
        if force {
            self.writer_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_states() {
        assert!(PeerState::Open.is_ready());
        assert!(PeerState::OpenPendingDwa.is_ready());
        assert!(!PeerState::WaitCea.is_ready());
        assert!(!PeerState::Closing.is_ready());
        assert!(!PeerState::Closed.is_ready());
    }

    #[test]
    fn test_effective_timers_fall_back_to_defaults() {
        let mut settings = PeerSettings::default();
        settings.timers.idle = Some(Duration::from_secs(5));
        let peer = Peer::new("hss.example.net", TransportKind::Tcp, 3868, "example.net", settings);
        let timers = peer.effective_timers(&TimerConfig::default());
        assert_eq!(timers.idle, Duration::from_secs(5));
        assert_eq!(timers.dwa, Duration::from_secs(4));
    }

    #[test]
    fn test_peer_identity_lowercased() {
        let peer = Peer::new(
            "HSS.Example.NET",
            TransportKind::Tcp,
            3868,
            "example.net",
            PeerSettings::default(),
        );
        assert_eq!(peer.host_identity, "hss.example.net");
        assert_eq!(peer.realm, "example.net");
        assert_eq!(peer.state(), PeerState::Closed);
    }

    fn test_connection(queue_len: usize) -> (PeerConnection, mpsc::Receiver<Bytes>) {
        let (out_tx, out_rx) = mpsc::channel(queue_len);
        let conn = PeerConnection::new(
            7,
            Direction::Sender,
            TransportKind::Tcp,
            "10.0.0.1:3868".parse().unwrap(),
            None,
            out_tx,
            tokio::spawn(async {}),
            tokio::spawn(async {}),
        );
        (conn, out_rx)
    }

    #[tokio::test]
    async fn test_backlog_preserves_order_under_backpressure() {
        let (mut conn, mut out_rx) = test_connection(2);
        for i in 0..5u8 {
            conn.enqueue(Bytes::copy_from_slice(&[i]));
        }
        // queue holds two frames, the rest waits in the backlog
        assert_eq!(conn.backlog.len(), 3);
        assert!(!conn.flushed());

        let mut received = Vec::new();
        while let Ok(frame) = out_rx.try_recv() {
            received.push(frame[0]);
            conn.drain();
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(conn.flushed());
    }

    #[tokio::test]
    async fn test_supports_application() {
        let (mut conn, _rx) = test_connection(4);
        conn.auth_application_ids = vec![4];
        assert!(conn.supports_application(4));
        assert!(!conn.supports_application(5));
        conn.relay = true;
        assert!(conn.supports_application(5));
    }
}
