//! Diameter applications
//!
//! An application owns the user-level semantics of one application id.
//! Requests arriving for that id are dispatched to the application's
//! handler; its return value becomes the answer on the wire. Two dispatch
//! variants exist:
//!
//! - **inline**: the handler runs on the node's coordinator task and must
//!   return quickly; meant for tests and benchmarks;
//! - **worker pool**: the handler runs on a bounded blocking worker pool;
//!   a failing or empty handler yields a default 5012 answer.
//!
//! Several applications may share an application id as long as their
//! allowed peer sets are disjoint.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::avp::{Avp, AvpValue};
use crate::common::avp_code;
use crate::error::ResultCode;
use crate::message::DiameterMessage;

/// Request handler signature. Returning `None` makes the runtime produce
/// a default UNABLE_TO_COMPLY answer.
pub type RequestHandler = dyn Fn(DiameterMessage) -> Option<DiameterMessage> + Send + Sync;

pub(crate) enum Dispatch {
    Inline(Arc<RequestHandler>),
    Pool {
        handler: Arc<RequestHandler>,
        permits: Arc<Semaphore>,
    },
}

/// An application registered with a node
pub struct Application {
    /// Application id carried in message headers
    pub application_id: u32,
    /// Advertised as an auth application in CER/CEA
    pub is_auth: bool,
    /// Advertised as an acct application in CER/CEA
    pub is_acct: bool,
    /// Peers this application serves; empty means any peer
    pub peer_hosts: Vec<String>,
    pub(crate) dispatch: Dispatch,
}

impl Application {
    /// An application whose handler runs inline on the node's I/O task.
    /// The handler must return quickly.
    pub fn inline<H>(application_id: u32, is_auth: bool, is_acct: bool, handler: H) -> Self
    where
        H: Fn(DiameterMessage) -> Option<DiameterMessage> + Send + Sync + 'static,
    {
        Self {
            application_id,
            is_auth,
            is_acct,
            peer_hosts: Vec::new(),
            dispatch: Dispatch::Inline(Arc::new(handler)),
        }
    }

    /// An application whose handler runs on a bounded worker pool with at
    /// most `max_concurrency` requests in flight.
    pub fn worker_pool<H>(
        application_id: u32,
        is_auth: bool,
        is_acct: bool,
        max_concurrency: usize,
        handler: H,
    ) -> Self
    where
        H: Fn(DiameterMessage) -> Option<DiameterMessage> + Send + Sync + 'static,
    {
        Self {
            application_id,
            is_auth,
            is_acct,
            peer_hosts: Vec::new(),
            dispatch: Dispatch::Pool {
                handler: Arc::new(handler),
                permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            },
        }
    }

    /// Restrict the application to the given peers
    pub fn with_peers(mut self, peer_hosts: Vec<String>) -> Self {
        self.peer_hosts = peer_hosts
            .into_iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        self
    }

    /// Whether this application serves requests arriving from `host`
    pub fn accepts_peer(&self, host: &str) -> bool {
        self.peer_hosts.is_empty()
            || self
                .peer_hosts
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Whether two applications may coexist on one node
    pub fn disjoint_with(&self, other: &Application) -> bool {
        if self.application_id != other.application_id {
            return true;
        }
        // an empty peer set means "any peer" and collides with everything
        if self.peer_hosts.is_empty() || other.peer_hosts.is_empty() {
            return false;
        }
        !self
            .peer_hosts
            .iter()
            .any(|h| other.peer_hosts.contains(h))
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("application_id", &self.application_id)
            .field("is_auth", &self.is_auth)
            .field("is_acct", &self.is_acct)
            .field("peer_hosts", &self.peer_hosts)
            .finish()
    }
}

/// Derive an answer from a request per RFC 6733: identifiers are copied by
/// the header derivation; Session-Id, Proxy-Info and Route-Record are
/// echoed; local Origin-Host and Origin-Realm are stamped.
pub fn answer_from(request: &DiameterMessage, origin_host: &str, origin_realm: &str) -> DiameterMessage {
    let mut answer = DiameterMessage::new_answer(request);
    if let Some(session_id) = request.find_avp(avp_code::SESSION_ID) {
        answer.add_avp(session_id.clone());
    }
    answer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_HOST,
        AvpValue::Identity(origin_host.to_string()),
    ));
    answer.add_avp(Avp::mandatory(
        avp_code::ORIGIN_REALM,
        AvpValue::Identity(origin_realm.to_string()),
    ));
    for avp in &request.avps {
        if avp.code == avp_code::PROXY_INFO || avp.code == avp_code::ROUTE_RECORD {
            answer.add_avp(avp.clone());
        }
    }
    answer
}

/// An `answer_from` carrying a Result-Code, used for error answers
pub fn error_answer(
    request: &DiameterMessage,
    origin_host: &str,
    origin_realm: &str,
    result_code: ResultCode,
) -> DiameterMessage {
    let mut answer = answer_from(request, origin_host, origin_realm);
    answer.add_avp(Avp::mandatory(
        avp_code::RESULT_CODE,
        AvpValue::Unsigned32(result_code as u32),
    ));
    if result_code.is_protocol_error() {
        answer.header.set_error();
    }
    answer
}
