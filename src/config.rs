//! Node and peer configuration types

use std::net::IpAddr;
use std::time::Duration;

/// Node timer defaults. Individual peers may override any of them through
/// [`PeerSettings::timers`].
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Timeout waiting for a CEA after sending a CER
    pub cea: Duration,
    /// Timeout waiting for a CER after accepting a connection
    pub cer: Duration,
    /// Timeout waiting for a DWA after sending a DWR; also bounds the wait
    /// for a DPA after sending a DPR
    pub dwa: Duration,
    /// Time spent idle before a DWR is triggered
    pub idle: Duration,
    /// Wait before reconnecting a persistent peer after a disconnect
    pub reconnect_wait: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            cea: Duration::from_secs(4),
            cer: Duration::from_secs(4),
            dwa: Duration::from_secs(4),
            idle: Duration::from_secs(30),
            reconnect_wait: Duration::from_secs(30),
        }
    }
}

/// Per-peer timer overrides; unset fields fall back to the node defaults
#[derive(Debug, Clone, Default)]
pub struct PeerTimerOverrides {
    pub cea: Option<Duration>,
    pub cer: Option<Duration>,
    pub dwa: Option<Duration>,
    pub idle: Option<Duration>,
    pub reconnect_wait: Option<Duration>,
}

/// Settings for a peer added to a node
#[derive(Debug, Clone, Default)]
pub struct PeerSettings {
    /// Peer realm; defaults to the node realm when unset
    pub realm: Option<String>,
    /// Addresses for outgoing connections. For TCP the addresses are tried
    /// in order; for SCTP they form the multi-homed address set. Without
    /// addresses the peer is accept-only.
    pub ip_addresses: Vec<IpAddr>,
    /// Automatically connect at startup and reconnect after a disconnect
    pub persistent: bool,
    /// Reconnect even after a clean DPR/DPA disconnect
    pub always_reconnect: bool,
    /// Timer overrides
    pub timers: PeerTimerOverrides,
}

/// Diameter node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local DiameterIdentity (FQDN, must include the realm)
    pub origin_host: String,
    /// Local realm
    pub realm: String,
    /// Product name advertised in CER/CEA
    pub product_name: String,
    /// Our vendor id advertised in CER/CEA
    pub vendor_id: u32,
    /// Supported vendor ids advertised in CER/CEA
    pub supported_vendor_ids: Vec<u32>,
    /// Addresses to listen on; empty for a client-only node
    pub ip_addresses: Vec<IpAddr>,
    /// TCP listen port; `None` disables TCP listening
    pub tcp_port: Option<u16>,
    /// SCTP listen port; `None` disables SCTP listening
    pub sctp_port: Option<u16>,
    /// Timer defaults
    pub timers: TimerConfig,
    /// Event loop wakeup interval; bounds worst-case timer latency
    pub wakeup_interval: Duration,
    /// Accept CERs from peers that were never added; a discovered peer is
    /// created on the fly. Otherwise unknown peers get Result-Code 3010.
    pub accept_unknown_peers: bool,
    /// Answer 5005 to inbound requests missing universally mandatory AVPs
    pub validate_inbound: bool,
    /// Per-connection outbound queue length before the coordinator-side
    /// backlog takes over
    pub outbound_queue_len: usize,
    /// End-to-end identifiers remembered per origin host for duplicate
    /// (T flag) detection
    pub retransmit_history: usize,
}

impl NodeConfig {
    /// Configuration with defaults for everything but the identities
    pub fn new(origin_host: &str, realm: &str) -> Self {
        Self {
            origin_host: origin_host.to_string(),
            realm: realm.to_string(),
            product_name: "diabase".to_string(),
            vendor_id: 99999,
            supported_vendor_ids: Vec::new(),
            ip_addresses: Vec::new(),
            tcp_port: None,
            sctp_port: None,
            timers: TimerConfig::default(),
            wakeup_interval: Duration::from_secs(1),
            accept_unknown_peers: false,
            validate_inbound: true,
            outbound_queue_len: 64,
            retransmit_history: 10240,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::new("node.example.net", "example.net");
        assert_eq!(cfg.origin_host, "node.example.net");
        assert_eq!(cfg.timers.idle, Duration::from_secs(30));
        assert_eq!(cfg.wakeup_interval, Duration::from_secs(1));
        assert!(cfg.tcp_port.is_none());
        assert!(!cfg.accept_unknown_peers);
        assert!(cfg.validate_inbound);
    }
}
