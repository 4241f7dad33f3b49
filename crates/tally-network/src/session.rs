//! Per-peer protocol state machine.
//!
//! `Disconnected → Connecting → Connected → Ready → Syncing`, with `Banned`
//! reachable from anywhere. The machine is sans-io: callers feed it decoded
//! messages and caller-supplied timestamps, and it returns the actions to
//! take ([`SessionEvent`]). The transport loop in the service module owns
//! the socket.
//!
//! Outbound requests correlate to their responses by nonce; a request whose
//! response kind does not arrive within its timeout is surfaced by
//! [`check_timeouts`](PeerSession::check_timeouts). Latency is the mean of
//! the last ten ping round-trips inside a 60-second window.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use tally_core::constants::{MAX_BAN_SCORE, MESSAGE_TIMEOUT_MS, MIN_PROTOCOL_VERSION, RATE_WINDOW_MS};

use crate::message::{Message, MessageKind, VersionPayload};
use crate::rate_limiter::RateWindow;

/// Bounded inbound queue size per peer.
pub const INBOUND_QUEUE_CAP: usize = 128;

/// RTT samples kept for the latency estimate.
const RTT_SAMPLES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Syncing,
    Banned,
}

/// Why a session was banned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BanCause {
    /// Peer advertised a protocol version below the supported minimum.
    ProtocolVersion,
    /// Accumulated ban score reached the threshold.
    ScoreExceeded,
}

/// Action produced by the state machine for the transport loop.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Write this message to the peer.
    Send(Message),
    /// Hand this message to the node (block, tx, vote, or peer request).
    Deliver(Message),
    StateChanged(SessionState),
    Banned(BanCause),
    Disconnected(String),
}

#[derive(Clone, Debug)]
struct PendingRequest {
    expect: MessageKind,
    sent_at_ms: u64,
    timeout_ms: u64,
}

/// One peer's protocol state.
pub struct PeerSession {
    peer_id: String,
    state: SessionState,
    local_version: VersionPayload,
    peer_version: Option<VersionPayload>,
    sent_version: bool,
    got_verack: bool,
    handshake_started_ms: Option<u64>,
    ban_score: u32,
    rate: RateWindow,
    pending: HashMap<u64, PendingRequest>,
    next_nonce: u64,
    /// Outstanding pings: nonce → sent time.
    pings: HashMap<u64, u64>,
    /// Completed RTT samples: (completed_at_ms, rtt_ms).
    rtt_samples: VecDeque<(u64, u64)>,
    inbound: VecDeque<Message>,
}

impl PeerSession {
    pub fn new(peer_id: impl Into<String>, local_version: VersionPayload) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: SessionState::Disconnected,
            local_version,
            peer_version: None,
            sent_version: false,
            got_verack: false,
            handshake_started_ms: None,
            ban_score: 0,
            rate: RateWindow::new(),
            pending: HashMap::new(),
            next_nonce: 1,
            pings: HashMap::new(),
            rtt_samples: VecDeque::new(),
            inbound: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn ban_score(&self) -> u32 {
        self.ban_score
    }

    /// The peer's advertised chain height, once the handshake completed.
    pub fn peer_height(&self) -> Option<u64> {
        self.peer_version.as_ref().map(|v| v.height)
    }

    pub fn peer_version(&self) -> Option<&VersionPayload> {
        self.peer_version.as_ref()
    }

    /// An outbound dial was initiated.
    pub fn on_dial(&mut self) -> Vec<SessionEvent> {
        self.transition(SessionState::Connecting)
    }

    /// The transport connected (either direction): advertise our version
    /// and start the handshake timer.
    pub fn on_transport_connected(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = self.transition(SessionState::Connected);
        self.handshake_started_ms = Some(now_ms);
        self.sent_version = true;
        events.push(SessionEvent::Send(Message::Version(self.local_version.clone())));
        events
    }

    /// The synchronizer selected this peer.
    pub fn start_sync(&mut self) -> Vec<SessionEvent> {
        if self.state == SessionState::Ready {
            self.transition(SessionState::Syncing)
        } else {
            Vec::new()
        }
    }

    /// The synchronizer released this peer.
    pub fn end_sync(&mut self) -> Vec<SessionEvent> {
        if self.state == SessionState::Syncing {
            self.transition(SessionState::Ready)
        } else {
            Vec::new()
        }
    }

    /// The socket closed or the transport failed.
    pub fn on_closed(&mut self, reason: &str) -> Vec<SessionEvent> {
        if self.state == SessionState::Banned {
            return Vec::new();
        }
        let mut events = self.transition(SessionState::Disconnected);
        events.push(SessionEvent::Disconnected(reason.to_string()));
        events
    }

    /// Add ban-score points. Returns the ban event when the threshold is
    /// crossed.
    pub fn add_ban_score(&mut self, points: u32) -> Option<SessionEvent> {
        self.ban_score = self.ban_score.saturating_add(points);
        if self.ban_score >= MAX_BAN_SCORE && self.state != SessionState::Banned {
            warn!(peer = %self.peer_id, score = self.ban_score, "session: peer banned");
            self.state = SessionState::Banned;
            return Some(SessionEvent::Banned(BanCause::ScoreExceeded));
        }
        None
    }

    /// Register an outbound request and return its correlation nonce plus
    /// the send event. The response is matched by `expect` kind.
    pub fn begin_request(
        &mut self,
        request: Message,
        expect: MessageKind,
        now_ms: u64,
    ) -> (u64, Vec<SessionEvent>) {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.pending.insert(
            nonce,
            PendingRequest {
                expect,
                sent_at_ms: now_ms,
                timeout_ms: MESSAGE_TIMEOUT_MS,
            },
        );
        (nonce, vec![SessionEvent::Send(request)])
    }

    /// Send a ping, tracked for the latency estimate.
    pub fn ping(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.pings.insert(nonce, now_ms);
        vec![SessionEvent::Send(Message::Ping(nonce))]
    }

    /// Requests whose responses did not arrive in time. Each entry is the
    /// request nonce; the caller converts these to timeouts and demotes the
    /// peer per the retry policy. Also enforces the handshake timer.
    pub fn check_timeouts(&mut self, now_ms: u64) -> (Vec<u64>, Vec<SessionEvent>) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, req)| now_ms.saturating_sub(req.sent_at_ms) >= req.timeout_ms)
            .map(|(&nonce, _)| nonce)
            .collect();
        for nonce in &expired {
            self.pending.remove(nonce);
        }

        let mut events = Vec::new();
        if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            if let Some(started) = self.handshake_started_ms {
                if now_ms.saturating_sub(started) >= MESSAGE_TIMEOUT_MS {
                    events = self.on_closed("handshake timeout");
                }
            }
        }
        (expired, events)
    }

    /// Mean round-trip time over the last ten samples within the rate
    /// window, in milliseconds.
    pub fn latency_ms(&self, now_ms: u64) -> Option<f64> {
        let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
        let recent: Vec<u64> = self
            .rtt_samples
            .iter()
            .filter(|(completed, _)| *completed > cutoff)
            .map(|(_, rtt)| *rtt)
            .collect();
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<u64>() as f64 / recent.len() as f64)
    }

    /// Queue an inbound message under back-pressure.
    ///
    /// When the queue is full the oldest non-critical entry (`Inv`,
    /// `Addr`) is dropped to make room; if nothing is droppable the new
    /// message is refused.
    pub fn enqueue_inbound(&mut self, message: Message) -> bool {
        if self.inbound.len() >= INBOUND_QUEUE_CAP {
            match self.inbound.iter().position(|m| !m.is_critical()) {
                Some(pos) => {
                    self.inbound.remove(pos);
                }
                None => return false,
            }
        }
        self.inbound.push_back(message);
        true
    }

    /// Drain the inbound queue for processing.
    pub fn drain_inbound(&mut self) -> Vec<Message> {
        self.inbound.drain(..).collect()
    }

    /// Process one decoded message of `size` bytes.
    pub fn on_message(&mut self, message: Message, size: usize, now_ms: u64) -> Vec<SessionEvent> {
        if matches!(self.state, SessionState::Banned | SessionState::Disconnected) {
            return Vec::new();
        }

        // Rate limits: a breach costs one ban-score point and drops the
        // message.
        if !self.rate.check(now_ms, size) {
            debug!(peer = %self.peer_id, "session: rate limit breached");
            return self.add_ban_score(1).into_iter().collect();
        }
        self.rate.record(now_ms, size);

        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                self.on_handshake_message(message)
            }
            SessionState::Ready | SessionState::Syncing => self.on_steady_message(message, now_ms),
            SessionState::Disconnected | SessionState::Banned => Vec::new(),
        }
    }

    fn on_handshake_message(&mut self, message: Message) -> Vec<SessionEvent> {
        match message {
            Message::Version(version) => {
                if version.protocol_version < MIN_PROTOCOL_VERSION {
                    warn!(
                        peer = %self.peer_id,
                        got = version.protocol_version,
                        min = MIN_PROTOCOL_VERSION,
                        "session: protocol version too old"
                    );
                    self.state = SessionState::Banned;
                    return vec![
                        SessionEvent::Banned(BanCause::ProtocolVersion),
                        SessionEvent::StateChanged(SessionState::Banned),
                    ];
                }
                self.peer_version = Some(version);
                let mut events = Vec::new();
                if !self.sent_version {
                    self.sent_version = true;
                    events.push(SessionEvent::Send(Message::Version(
                        self.local_version.clone(),
                    )));
                }
                events.push(SessionEvent::Send(Message::Verack));
                events.extend(self.maybe_ready());
                events
            }
            Message::Verack => {
                self.got_verack = true;
                self.maybe_ready()
            }
            // Anything else before the handshake completes is out of order.
            _ => self.add_ban_score(1).into_iter().collect(),
        }
    }

    fn on_steady_message(&mut self, message: Message, now_ms: u64) -> Vec<SessionEvent> {
        match message {
            Message::Ping(nonce) => vec![SessionEvent::Send(Message::Pong(nonce))],
            Message::Pong(nonce) => {
                if let Some(sent) = self.pings.remove(&nonce) {
                    let rtt = now_ms.saturating_sub(sent);
                    if self.rtt_samples.len() == RTT_SAMPLES {
                        self.rtt_samples.pop_front();
                    }
                    self.rtt_samples.push_back((now_ms, rtt));
                }
                Vec::new()
            }
            // A repeated handshake message in steady state is harmless.
            Message::Version(_) | Message::Verack => Vec::new(),
            other => {
                self.complete_pending(other.kind());
                vec![SessionEvent::Deliver(other)]
            }
        }
    }

    /// Complete the oldest pending request expecting this response kind.
    fn complete_pending(&mut self, kind: MessageKind) {
        let completed = self
            .pending
            .iter()
            .filter(|(_, req)| req.expect == kind)
            .min_by_key(|(_, req)| req.sent_at_ms)
            .map(|(&nonce, _)| nonce);
        if let Some(nonce) = completed {
            self.pending.remove(&nonce);
        }
    }

    fn maybe_ready(&mut self) -> Vec<SessionEvent> {
        if self.peer_version.is_some() && self.got_verack {
            self.handshake_started_ms = None;
            self.transition(SessionState::Ready)
        } else {
            Vec::new()
        }
    }

    fn transition(&mut self, next: SessionState) -> Vec<SessionEvent> {
        if self.state == next {
            return Vec::new();
        }
        debug!(peer = %self.peer_id, from = ?self.state, to = ?next, "session: transition");
        self.state = next;
        vec![SessionEvent::StateChanged(next)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::constants::{CURRENCY_SYMBOL, PROTOCOL_VERSION, RATE_LIMIT_MESSAGES};
    use tally_core::types::Hash256;

    fn version(height: u64) -> VersionPayload {
        VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            timestamp_ms: 1_700_000_000_000,
            height,
            user_agent: "/tally:0.1.0/".into(),
            currency_symbol: CURRENCY_SYMBOL.into(),
        }
    }

    /// Drive a session to `Ready`.
    fn ready_session() -> PeerSession {
        let mut session = PeerSession::new("peer-1", version(0));
        session.on_dial();
        session.on_transport_connected(1_000);
        session.on_message(Message::Version(version(50)), 100, 1_001);
        session.on_message(Message::Verack, 10, 1_002);
        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    #[test]
    fn dial_handshake_reaches_ready() {
        let mut session = PeerSession::new("peer-1", version(0));
        assert_eq!(session.state(), SessionState::Disconnected);

        let events = session.on_dial();
        assert_eq!(events, vec![SessionEvent::StateChanged(SessionState::Connecting)]);

        let events = session.on_transport_connected(1_000);
        assert!(events.contains(&SessionEvent::StateChanged(SessionState::Connected)));
        assert!(matches!(events.last(), Some(SessionEvent::Send(Message::Version(_)))));

        let events = session.on_message(Message::Version(version(50)), 100, 1_001);
        assert!(events.contains(&SessionEvent::Send(Message::Verack)));

        let events = session.on_message(Message::Verack, 10, 1_002);
        assert!(events.contains(&SessionEvent::StateChanged(SessionState::Ready)));
        assert_eq!(session.peer_height(), Some(50));
    }

    #[test]
    fn inbound_handshake_sends_version_in_reply() {
        let mut session = PeerSession::new("peer-2", version(7));
        // Accepted connection: transport connects without a dial.
        session.on_transport_connected(1_000);
        // Peer's version arrives; we already sent ours, so only verack goes out.
        let events = session.on_message(Message::Version(version(3)), 100, 1_001);
        let sends: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Send(_)))
            .collect();
        assert_eq!(sends.len(), 1);
        assert!(matches!(sends[0], SessionEvent::Send(Message::Verack)));
    }

    #[test]
    fn old_protocol_version_is_banned() {
        let mut session = PeerSession::new("peer-1", version(0));
        session.on_dial();
        session.on_transport_connected(1_000);

        let mut old = version(50);
        old.protocol_version = MIN_PROTOCOL_VERSION - 1;
        let events = session.on_message(Message::Version(old), 100, 1_001);
        assert!(events.contains(&SessionEvent::Banned(BanCause::ProtocolVersion)));
        assert_eq!(session.state(), SessionState::Banned);

        // Banned sessions ignore further traffic.
        assert!(session.on_message(Message::Ping(1), 10, 1_002).is_empty());
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut session = ready_session();
        let events = session.on_message(Message::Ping(42), 10, 2_000);
        assert_eq!(events, vec![SessionEvent::Send(Message::Pong(42))]);
    }

    #[test]
    fn pong_produces_latency_sample() {
        let mut session = ready_session();
        let events = session.ping(2_000);
        let nonce = match &events[0] {
            SessionEvent::Send(Message::Ping(n)) => *n,
            other => panic!("expected ping, got {other:?}"),
        };
        session.on_message(Message::Pong(nonce), 10, 2_080);
        assert_eq!(session.latency_ms(2_100), Some(80.0));
    }

    #[test]
    fn latency_averages_recent_samples_only() {
        let mut session = ready_session();
        for (sent, rtt) in [(2_000u64, 40u64), (3_000, 80), (4_000, 120)] {
            let events = session.ping(sent);
            let nonce = match &events[0] {
                SessionEvent::Send(Message::Ping(n)) => *n,
                _ => unreachable!(),
            };
            session.on_message(Message::Pong(nonce), 10, sent + rtt);
        }
        assert_eq!(session.latency_ms(5_000), Some(80.0));
        // A window later, all samples have aged out.
        assert_eq!(session.latency_ms(4_120 + RATE_WINDOW_MS + 1), None);
    }

    #[test]
    fn content_messages_are_delivered() {
        let mut session = ready_session();
        let events = session.on_message(Message::GetAddr, 10, 2_000);
        assert_eq!(events, vec![SessionEvent::Deliver(Message::GetAddr)]);
    }

    #[test]
    fn request_correlation_and_timeout() {
        let mut session = ready_session();
        let (nonce, _) = session.begin_request(
            Message::GetHeaders(crate::message::GetHeadersPayload { start_height: 1, count: 10 }),
            MessageKind::Headers,
            2_000,
        );

        // Response arrives: pending request completes, nothing times out.
        session.on_message(Message::Headers(vec![]), 10, 2_500);
        let (expired, _) = session.check_timeouts(2_000 + MESSAGE_TIMEOUT_MS + 1);
        assert!(expired.is_empty());

        // A second request gets no response.
        let (nonce2, _) = session.begin_request(
            Message::GetHeaders(crate::message::GetHeadersPayload { start_height: 1, count: 10 }),
            MessageKind::Headers,
            3_000,
        );
        assert_ne!(nonce, nonce2);
        let (expired, _) = session.check_timeouts(3_000 + MESSAGE_TIMEOUT_MS);
        assert_eq!(expired, vec![nonce2]);
    }

    #[test]
    fn handshake_timeout_disconnects() {
        let mut session = PeerSession::new("peer-1", version(0));
        session.on_dial();
        session.on_transport_connected(1_000);

        let (_, events) = session.check_timeouts(1_000 + MESSAGE_TIMEOUT_MS);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Disconnected(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn rate_limit_breach_scores_and_eventually_bans() {
        let mut session = ready_session();
        // Start past the handshake's window so its messages have aged out.
        let base = 70_000u64;
        for i in 0..RATE_LIMIT_MESSAGES {
            session.on_message(Message::Ping(i as u64), 10, base + i as u64);
        }
        // Every further message breaches and adds one point.
        for _ in 0..(MAX_BAN_SCORE - 1) {
            let events = session.on_message(Message::Ping(9_999), 10, base + 200);
            assert!(events.is_empty());
        }
        assert_eq!(session.ban_score(), MAX_BAN_SCORE - 1);

        let events = session.on_message(Message::Ping(9_999), 10, base + 201);
        assert!(events.contains(&SessionEvent::Banned(BanCause::ScoreExceeded)));
        assert_eq!(session.state(), SessionState::Banned);
    }

    #[test]
    fn sync_state_round_trip() {
        let mut session = ready_session();
        let events = session.start_sync();
        assert_eq!(events, vec![SessionEvent::StateChanged(SessionState::Syncing)]);
        let events = session.end_sync();
        assert_eq!(events, vec![SessionEvent::StateChanged(SessionState::Ready)]);
    }

    #[test]
    fn queue_drops_oldest_non_critical_when_full() {
        let mut session = ready_session();
        // Fill with one droppable announcement and then critical messages.
        assert!(session.enqueue_inbound(Message::Inv(vec![crate::message::InvItem {
            kind: crate::message::InvKind::Block,
            hash: Hash256([1; 32]),
        }])));
        for i in 0..(INBOUND_QUEUE_CAP - 1) {
            assert!(session.enqueue_inbound(Message::Ping(i as u64)));
        }

        // Full: a new critical message displaces the announcement.
        assert!(session.enqueue_inbound(Message::Ping(999)));
        let drained = session.drain_inbound();
        assert_eq!(drained.len(), INBOUND_QUEUE_CAP);
        assert!(!drained.iter().any(|m| matches!(m, Message::Inv(_))));

        // Full of critical messages only: new ones are refused.
        for i in 0..INBOUND_QUEUE_CAP {
            assert!(session.enqueue_inbound(Message::Ping(i as u64)));
        }
        assert!(!session.enqueue_inbound(Message::Ping(1_000)));
    }

    #[test]
    fn out_of_order_message_before_handshake_penalized() {
        let mut session = PeerSession::new("peer-1", version(0));
        session.on_dial();
        session.on_transport_connected(1_000);
        session.on_message(Message::GetAddr, 10, 1_001);
        assert_eq!(session.ban_score(), 1);
    }
}
