//! Per-connection routing state machine.
//!
//! One [`Router`] lives in each server connection task. [`Router::handle`]
//! is synchronous: every side effect is a non-blocking
//! [`Connection::try_send`] or a directory/mapper update, so a slow peer can
//! never stall the task reading from another.
//!
//! ```text
//! Unregistered ──(Handshake + role)──► Registered ──(disconnect)──► torn down
//!        │                                  │
//!        └── anything else: Error, close    ├── Handshake+REQUEST: peer probe
//!                                           ├── BROADCAST: fan out to channel
//!                                           ├── REQUEST:   Start picks a peer, rest follow it
//!                                           └── RESPONSE:  first frame resolves the originator
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::ServerState;
use crate::connection::Connection;
use crate::error::{RelaywireError, Result};
use crate::protocol::{flags, Frame, FrameType, Header, Role};

/// Reported to a sender whose peer is connected but not keeping up.
const QUEUE_FULL: &str = "peer queue full";

/// Identity established by the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub client_id: Uuid,
    pub channel_id: Uuid,
    pub role: Role,
}

enum Session {
    Unregistered,
    Registered(Registration),
}

pub(crate) struct Router {
    connection: Connection,
    state: Arc<ServerState>,
    session: Session,
    /// Requests this connection is streaming out: request id → target peer.
    requests: HashMap<Uuid, (Uuid, Connection)>,
    /// Responses this connection is streaming back: request id → originator.
    responses: HashMap<Uuid, Connection>,
}

impl Router {
    pub fn new(connection: Connection, state: Arc<ServerState>) -> Self {
        Self {
            connection,
            state,
            session: Session::Unregistered,
            requests: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    /// Process one inbound frame.
    ///
    /// An `Err` is connection-fatal: the peer has already been sent an
    /// error frame and the caller should tear the router down.
    pub fn handle(&mut self, frame: Frame) -> Result<()> {
        match self.session {
            Session::Unregistered => self.register(frame),
            Session::Registered(registration) => self.route(registration, frame),
        }
    }

    /// Identity of this connection, once registered.
    #[cfg(test)]
    pub fn registration(&self) -> Option<Registration> {
        match self.session {
            Session::Registered(registration) => Some(registration),
            Session::Unregistered => None,
        }
    }

    /// Unregister, notify affected peers and close the connection.
    pub fn teardown(&mut self) {
        if let Session::Registered(registration) = self.session {
            self.state
                .directory
                .unregister(registration.channel_id, registration.role, registration.client_id);

            let cut_off: Vec<_> = self.requests.drain().collect();
            for (request_id, (_, target)) in cut_off {
                self.state.mapper.cancel(request_id);
                target.try_send(self.error_frame(request_id, flags::REQUEST, "originator disconnected"));
            }

            let peer_gone = flags::RESPONSE | flags::PEER_NOT_AVAILABLE;
            let mut orphaned: Vec<_> = self.responses.drain().collect();
            orphaned.extend(self.state.mapper.drain_target(registration.client_id));
            for (request_id, originator) in orphaned {
                originator.try_send(self.error_frame(request_id, peer_gone, "peer disconnected"));
            }

            tracing::info!(
                "Unregistered {} {} from channel {}",
                registration.role,
                registration.client_id,
                registration.channel_id
            );
            self.session = Session::Unregistered;
        }
        self.connection.close();
    }

    fn register(&mut self, frame: Frame) -> Result<()> {
        let header = frame.header;
        if header.frame_type != FrameType::Handshake || !header.is_handshake() || header.is_request() {
            return self.reject(header.request_id, "expected registration handshake");
        }
        let role = match Role::from_payload(frame.payload()) {
            Ok(role) => role,
            Err(e) => return self.reject(header.request_id, &e.to_string()),
        };
        if header.client_id.is_nil() {
            return self.reject(header.request_id, "registration without client id");
        }

        let registration = Registration {
            client_id: header.client_id,
            channel_id: header.channel_id,
            role,
        };
        if !self.state.directory.register(
            registration.channel_id,
            role,
            registration.client_id,
            self.connection.clone(),
        ) {
            return self.reject(header.request_id, "client id already registered");
        }

        tracing::info!(
            "Registered {} {} on channel {}",
            role,
            registration.client_id,
            registration.channel_id
        );
        self.session = Session::Registered(registration);
        self.send_ack(registration, header.request_id);
        Ok(())
    }

    fn route(&mut self, registration: Registration, mut frame: Frame) -> Result<()> {
        if frame.frame_type() == FrameType::Handshake {
            if frame.header.is_handshake() && frame.header.is_request() {
                self.send_ack(registration, frame.request_id());
                return Ok(());
            }
            return self.reject(frame.request_id(), "duplicate registration");
        }

        // The registered identity wins over whatever the frame claims.
        frame.header.client_id = registration.client_id;
        frame.header.channel_id = registration.channel_id;

        if frame.is_broadcast() {
            self.broadcast(registration, frame);
        } else if frame.is_request() {
            self.route_request(registration, frame);
        } else if frame.is_response() {
            self.route_response(frame);
        } else {
            tracing::warn!(
                "Dropping {:?} frame without routing flags from {}",
                frame.frame_type(),
                registration.client_id
            );
        }
        Ok(())
    }

    fn route_request(&mut self, registration: Registration, mut frame: Frame) {
        let request_id = frame.request_id();
        match frame.frame_type() {
            FrameType::Start => {
                let Some((target_id, target)) = self.pick_peer(registration, frame.header.peer()) else {
                    tracing::debug!("No peer for request {} on channel {}", request_id, registration.channel_id);
                    self.send_error(
                        request_id,
                        flags::RESPONSE | flags::PEER_NOT_AVAILABLE,
                        "peer not available",
                    );
                    return;
                };

                let deadline = Instant::now() + self.state.pending_ttl;
                if self.requests.contains_key(&request_id)
                    || !self.state.mapper.set_pending(request_id, self.connection.clone(), target_id, deadline)
                {
                    self.send_error(request_id, flags::RESPONSE, "duplicate request id");
                    return;
                }

                frame.header.peer_client_id = target_id;
                if !target.try_send(frame) {
                    self.state.mapper.cancel(request_id);
                    self.send_error(request_id, flags::RESPONSE, QUEUE_FULL);
                    return;
                }
                tracing::debug!("Request {} routed to {}", request_id, target_id);
                self.requests.insert(request_id, (target_id, target));
            }
            FrameType::Chunk | FrameType::End | FrameType::Error => {
                let Some((_, target)) = self.requests.get(&request_id).cloned() else {
                    tracing::debug!("Dropping {:?} for abandoned request {}", frame.frame_type(), request_id);
                    return;
                };
                let frame_type = frame.frame_type();
                if !target.try_send(frame) {
                    self.requests.remove(&request_id);
                    self.state.mapper.cancel(request_id);
                    target.try_send(self.error_frame(request_id, flags::REQUEST, "request aborted"));
                    self.send_error(request_id, flags::RESPONSE, QUEUE_FULL);
                    return;
                }
                if frame_type == FrameType::Error {
                    self.state.mapper.cancel(request_id);
                }
                if frame_type.is_terminal() {
                    self.requests.remove(&request_id);
                }
            }
            other => {
                tracing::warn!("Dropping {:?} frame flagged as request {}", other, request_id);
            }
        }
    }

    fn route_response(&mut self, frame: Frame) {
        let request_id = frame.request_id();
        let terminal = frame.frame_type().is_terminal();

        let originator = match self.responses.get(&request_id) {
            Some(originator) => originator.clone(),
            None => match self.state.mapper.resolve(request_id) {
                Some(originator) => {
                    if !terminal {
                        self.responses.insert(request_id, originator.clone());
                    }
                    originator
                }
                None => {
                    tracing::debug!("Dropping late or duplicate response for {}", request_id);
                    return;
                }
            },
        };

        if terminal {
            self.responses.remove(&request_id);
        }
        if !originator.try_send(frame) {
            tracing::warn!("Originator queue full, dropping response for {}", request_id);
            self.responses.remove(&request_id);
        }
    }

    fn broadcast(&self, registration: Registration, frame: Frame) {
        for (peer_id, peer) in self
            .state
            .directory
            .channel_peers(registration.channel_id, registration.client_id)
        {
            if !peer.try_send(frame.clone()) {
                tracing::debug!("Broadcast frame to {} dropped", peer_id);
            }
        }
    }

    fn pick_peer(&self, registration: Registration, directed: Option<Uuid>) -> Option<(Uuid, Connection)> {
        let directory = &self.state.directory;
        if let Some(peer_id) = directed {
            if let Some(peer) = directory.get(registration.channel_id, registration.role.opposite(), peer_id) {
                return Some((peer_id, peer));
            }
        }
        directory.get_peer(registration.channel_id, registration.role)
    }

    fn send_ack(&self, registration: Registration, request_id: Uuid) {
        let peer = self
            .state
            .directory
            .get_peer(registration.channel_id, registration.role)
            .map(|(id, _)| id)
            .unwrap_or_else(Uuid::nil);
        let header = Header::new(FrameType::Handshake, flags::HANDSHAKE | flags::RESPONSE, request_id)
            .with_peer(peer)
            .with_channel(registration.channel_id);
        if !self.connection.try_send(Frame::empty(header)) {
            tracing::warn!("Handshake ack to {} dropped", registration.client_id);
        }
    }

    fn error_frame(&self, request_id: Uuid, error_flags: u16, message: &str) -> Frame {
        Frame::error(request_id, error_flags, message, self.state.max_frame_size as usize)
    }

    fn send_error(&self, request_id: Uuid, error_flags: u16, message: &str) {
        if !self.connection.try_send(self.error_frame(request_id, error_flags, message)) {
            tracing::debug!("Error frame for {} dropped: {}", request_id, message);
        }
    }

    fn reject(&self, request_id: Uuid, message: &str) -> Result<()> {
        self.send_error(request_id, flags::RESPONSE, message);
        Err(RelaywireError::Protocol(message.to_string()))
    }
}
