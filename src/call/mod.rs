//! Call membership
//!
//! A peer is `Idle`, `Hosting` (it anchors the call) or `Joined`. The
//! controller owns the membership set and keeps the sender's destination
//! set in step with it: every remote member is a destination, self never is.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{CallError, Result, SignalingError};
use crate::network::Destinations;
use crate::packet::{ControlMessage, Origin};
use crate::signaling::RequestHandler;

/// Notified of membership changes so per-peer sinks can be torn down
pub trait PeerListener: Send + Sync {
    fn peer_left(&self, origin: Origin);

    /// `origin` is (again) a member of the local call
    fn peer_joined(&self, _origin: Origin) {}
}

/// One media session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: Origin,
    pub members: BTreeSet<Origin>,
}

impl Call {
    fn hosted_by(host: Origin) -> Self {
        Self {
            host,
            members: BTreeSet::from([host]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Hosting,
    Joined,
}

/// Membership state machine for one participant
pub struct CallController {
    local: Origin,
    call: Mutex<Option<Call>>,
    destinations: Destinations,
    listeners: RwLock<Vec<Arc<dyn PeerListener>>>,
}

impl CallController {
    pub fn new(local_addr: SocketAddr, destinations: Destinations) -> Result<Self> {
        let local = Origin::from_socket_addr(local_addr).ok_or(CallError::UnsupportedAddress(local_addr))?;
        Ok(Self {
            local,
            call: Mutex::new(None),
            destinations,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn local(&self) -> Origin {
        self.local
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn add_listener(&self, listener: Arc<dyn PeerListener>) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> CallState {
        match &*self.call.lock() {
            None => CallState::Idle,
            Some(call) if call.host == self.local => CallState::Hosting,
            Some(_) => CallState::Joined,
        }
    }

    pub fn call(&self) -> Option<Call> {
        self.call.lock().clone()
    }

    /// Current members, self included; empty when idle
    pub fn members(&self) -> Vec<Origin> {
        self.call
            .lock()
            .as_ref()
            .map(|call| call.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop any previous call and start a new one anchored here
    pub fn host(&self) {
        let previous = self.call.lock().replace(Call::hosted_by(self.local));
        self.destinations.clear();
        if let Some(previous) = previous {
            self.notify_left(previous.members.into_iter());
        }
        tracing::info!(host = %self.local, "Hosting call");
    }

    /// Fail unless idle; a join must not replace an existing call
    pub fn ensure_idle(&self) -> Result<()> {
        match &*self.call.lock() {
            None => Ok(()),
            Some(call) => Err(CallError::AlreadyInCall(call.host.to_string()).into()),
        }
    }

    /// Adopt the membership from the JOIN reply sent by `host_addr`, which
    /// may be the anchor or any other member.
    ///
    /// Returns the members other than `host_addr` and self, who have not
    /// heard of this peer yet. Local state is untouched on error.
    pub fn apply_join_reply(&self, host_addr: SocketAddr, reply: ControlMessage) -> Result<Vec<Origin>> {
        let (host, members) = match reply {
            ControlMessage::JoinReply { host, members } => (host, members),
            other => {
                return Err(SignalingError::UnexpectedReply(format!("{:?}", other.kind())).into());
            }
        };
        if members.is_empty() {
            return Err(SignalingError::Rejected(host_addr).into());
        }

        let mut call = Call {
            host,
            members: members.into_iter().collect(),
        };
        call.members.insert(host);
        call.members.insert(self.local);

        let mut slot = self.call.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(CallError::AlreadyInCall(existing.host.to_string()).into());
        }
        for member in &call.members {
            self.add_destination(*member);
        }
        self.notify_joined(call.members.iter().copied());
        let contacted = Origin::from_socket_addr(host_addr);
        let unannounced = call
            .members
            .iter()
            .copied()
            .filter(|member| Some(*member) != contacted && *member != self.local)
            .collect();
        tracing::info!(%host, members = call.members.len(), "Joined call");
        *slot = Some(call);

        Ok(unannounced)
    }

    /// Admit `origin` and reply with the membership. An idle peer answers
    /// with an empty member list.
    pub fn handle_join(&self, origin: Origin) -> ControlMessage {
        let mut slot = self.call.lock();
        let Some(call) = slot.as_mut() else {
            tracing::info!(%origin, "Refusing JOIN while idle");
            return ControlMessage::JoinReply {
                host: self.local,
                members: Vec::new(),
            };
        };

        if call.members.insert(origin) {
            self.add_destination(origin);
            self.notify_joined(std::iter::once(origin));
            tracing::info!(%origin, members = call.members.len(), "Peer joined");
        }
        ControlMessage::JoinReply {
            host: call.host,
            members: call.members.iter().copied().collect(),
        }
    }

    /// Forget `origin`, tear down its sinks and acknowledge by echo.
    ///
    /// When the anchor leaves, the lowest remaining origin takes over. Every
    /// member holds the same set, so they all pick the same one.
    pub fn handle_leave(&self, origin: Origin, timestamp: u64) -> ControlMessage {
        let removed = match self.call.lock().as_mut() {
            Some(call) => {
                let removed = call.members.remove(&origin);
                if removed && call.host == origin {
                    if let Some(next) = call.members.first().copied() {
                        call.host = next;
                        tracing::info!(departed = %origin, host = %next, "Call anchor moved");
                    }
                }
                removed
            }
            None => false,
        };
        if let Some(addr) = origin.to_socket_addr() {
            self.destinations.remove(&addr);
        }
        if removed {
            tracing::info!(%origin, "Peer left");
        }
        self.notify_left(std::iter::once(origin));

        ControlMessage::Leave { origin, timestamp }
    }

    /// Remote members to notify before leaving
    pub fn leave_targets(&self) -> Vec<SocketAddr> {
        self.members()
            .into_iter()
            .filter(|member| *member != self.local)
            .filter_map(Origin::to_socket_addr)
            .collect()
    }

    /// End the local call and tear down every remote member's sinks
    pub fn clear(&self) -> Option<Call> {
        let previous = self.call.lock().take();
        self.destinations.clear();
        if let Some(call) = &previous {
            self.notify_left(call.members.iter().copied());
            tracing::info!(host = %call.host, "Left call");
        }
        previous
    }

    fn add_destination(&self, member: Origin) {
        if member == self.local {
            return;
        }
        match member.to_socket_addr() {
            Some(addr) => {
                self.destinations.insert(addr);
            }
            None => tracing::warn!(%member, "Member has no socket address"),
        }
    }

    fn notify_joined(&self, origins: impl Iterator<Item = Origin>) {
        let listeners = self.listeners.read();
        for origin in origins.filter(|origin| *origin != self.local) {
            for listener in listeners.iter() {
                listener.peer_joined(origin);
            }
        }
    }

    fn notify_left(&self, origins: impl Iterator<Item = Origin>) {
        let listeners = self.listeners.read();
        for origin in origins.filter(|origin| *origin != self.local) {
            for listener in listeners.iter() {
                listener.peer_left(origin);
            }
        }
    }
}

impl RequestHandler for CallController {
    fn handle(&self, request: ControlMessage) -> ControlMessage {
        match request {
            ControlMessage::Join { origin } => self.handle_join(origin),
            ControlMessage::Leave { origin, timestamp } => self.handle_leave(origin, timestamp),
            ControlMessage::JoinReply { host, .. } => {
                tracing::warn!(%host, "Unsolicited JOIN_REPLY");
                ControlMessage::JoinReply {
                    host: self.local,
                    members: Vec::new(),
                }
            }
        }
    }
}
