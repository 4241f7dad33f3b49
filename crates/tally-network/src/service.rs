//! Transport service: sockets, session driving, and request routing.
//!
//! Owns one tokio task pair (reader + writer) per peer. Decoded frames go
//! through the peer's [`PeerSession`] state machine; `Send` events flow to
//! the writer task, `Deliver` events either complete an awaited request or
//! flow to the node through the inbound channel. Framing errors cost ban
//! score and close the connection (a desynchronized stream cannot be
//! resynchronized).

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tally_core::constants::{MIN_PEER_BANDWIDTH_BPS, PROTOCOL_VERSION};
use tally_core::error::NetworkError;

use crate::config::NetworkConfig;
use crate::frame::{read_frame_sized, write_frame};
use crate::message::{InvItem, InvKind, Message, MessageKind, VersionPayload};
use crate::peer_score::BanScoreBoard;
use crate::session::{PeerSession, SessionEvent, SessionState};
use crate::sync::{PeerSnapshot, SyncClient};

/// Outbox depth per peer.
const OUTBOX_CAP: usize = 64;

/// Until a connection has transferred for this long, its bandwidth is
/// assumed adequate rather than measured.
const BANDWIDTH_WARMUP: Duration = Duration::from_secs(5);

struct Transfer {
    connected_at: Instant,
    bytes: u64,
}

/// The peer-to-peer transport service.
pub struct NetworkService {
    config: NetworkConfig,
    /// Produces the Version advertisement (height changes per handshake).
    version: Box<dyn Fn() -> VersionPayload + Send + Sync>,
    sessions: DashMap<String, Arc<Mutex<PeerSession>>>,
    outboxes: DashMap<String, mpsc::Sender<Message>>,
    /// One awaited response per `(peer, response kind)`.
    waiters: DashMap<(String, MessageKind), oneshot::Sender<Message>>,
    transfers: DashMap<String, Transfer>,
    scores: Mutex<BanScoreBoard>,
    inbound_tx: mpsc::Sender<(String, Message)>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl NetworkService {
    /// Build the service plus the channel on which the node receives
    /// delivered messages.
    pub fn new(
        config: NetworkConfig,
        version: impl Fn() -> VersionPayload + Send + Sync + 'static,
    ) -> (Arc<Self>, mpsc::Receiver<(String, Message)>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let mut scores = BanScoreBoard::new();
        for peer in &config.whitelisted_peers {
            scores.whitelist(peer);
        }
        let service = Arc::new(Self {
            config,
            version: Box::new(version),
            sessions: DashMap::new(),
            outboxes: DashMap::new(),
            waiters: DashMap::new(),
            transfers: DashMap::new(),
            scores: Mutex::new(scores),
            inbound_tx,
        });
        (service, inbound_rx)
    }

    /// A default version advertisement for a node at `height`.
    pub fn version_payload(height: u64) -> VersionPayload {
        VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            services: 1,
            timestamp_ms: now_ms() as i64,
            height,
            user_agent: concat!("/tally:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            currency_symbol: tally_core::constants::CURRENCY_SYMBOL.to_string(),
        }
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn listen(self: &Arc<Self>) -> Result<std::net::SocketAddr, NetworkError> {
        let listener = TcpListener::bind(self.config.listen_socket())
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        info!(%addr, "network: listening");

        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let peer_id = peer_addr.to_string();
                        if service.refused(&peer_id) {
                            debug!(peer = %peer_id, "network: refused connection");
                            continue;
                        }
                        let service = service.clone();
                        tokio::spawn(async move {
                            service.run_connection(stream, peer_id, false).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "network: accept failed");
                        break;
                    }
                }
            }
        });
        Ok(addr)
    }

    /// Dial a peer and run its connection.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), NetworkError> {
        if self.refused(addr) {
            return Err(NetworkError::Banned);
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))?;
        let service = self.clone();
        let peer_id = addr.to_string();
        tokio::spawn(async move {
            service.run_connection(stream, peer_id, true).await;
        });
        Ok(())
    }

    fn refused(&self, peer: &str) -> bool {
        self.config.blacklisted_peers.iter().any(|p| p == peer)
            || self.scores.lock().is_banned(peer, now_ms())
            || self.sessions.len() >= self.config.max_peers
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, peer_id: String, outbound: bool) {
        let magic = self.config.network.magic();
        let (mut read_half, write_half) = stream.into_split();

        let session = Arc::new(Mutex::new(PeerSession::new(&peer_id, (self.version)())));
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOX_CAP);
        self.sessions.insert(peer_id.clone(), session.clone());
        self.outboxes.insert(peer_id.clone(), out_tx.clone());
        self.transfers.insert(
            peer_id.clone(),
            Transfer { connected_at: Instant::now(), bytes: 0 },
        );

        let writer = tokio::spawn(write_loop(write_half, out_rx, magic));

        // Handshake kickoff.
        let initial = {
            let mut session = session.lock();
            let mut events = if outbound { session.on_dial() } else { Vec::new() };
            events.extend(session.on_transport_connected(now_ms()));
            events
        };
        self.process_events(&peer_id, initial, &out_tx).await;

        loop {
            match read_frame_sized(&mut read_half, magic).await {
                Ok((message, size)) => {
                    if let Some(mut transfer) = self.transfers.get_mut(&peer_id) {
                        transfer.bytes += size as u64;
                    }
                    let events = session.lock().on_message(message, size, now_ms());
                    self.process_events(&peer_id, events, &out_tx).await;
                    if session.lock().state() == SessionState::Banned {
                        self.scores.lock().ban(&peer_id, now_ms());
                        break;
                    }
                }
                Err(NetworkError::Io(reason)) => {
                    debug!(peer = %peer_id, reason, "network: connection closed");
                    break;
                }
                Err(e) => {
                    // Framing violation: penalize and drop the stream.
                    warn!(peer = %peer_id, error = %e, "network: bad frame");
                    if self.scores.lock().add_score(&peer_id, 20, now_ms()) {
                        let _ = session.lock().add_ban_score(u32::MAX);
                    }
                    break;
                }
            }
        }

        session.lock().on_closed("stream ended");
        self.sessions.remove(&peer_id);
        self.outboxes.remove(&peer_id);
        self.transfers.remove(&peer_id);
        writer.abort();
    }

    async fn process_events(
        &self,
        peer_id: &str,
        events: Vec<SessionEvent>,
        out_tx: &mpsc::Sender<Message>,
    ) {
        for event in events {
            match event {
                SessionEvent::Send(message) => {
                    if out_tx.send(message).await.is_err() {
                        break;
                    }
                }
                SessionEvent::Deliver(message) => {
                    let key = (peer_id.to_string(), message.kind());
                    if let Some((_, waiter)) = self.waiters.remove(&key) {
                        let _ = waiter.send(message);
                    } else {
                        let _ = self.inbound_tx.send((peer_id.to_string(), message)).await;
                    }
                }
                SessionEvent::Banned(cause) => {
                    warn!(peer = %peer_id, ?cause, "network: peer banned");
                    self.scores.lock().ban(peer_id, now_ms());
                }
                SessionEvent::StateChanged(state) => {
                    debug!(peer = %peer_id, ?state, "network: session state");
                }
                SessionEvent::Disconnected(reason) => {
                    debug!(peer = %peer_id, reason, "network: session disconnected");
                }
            }
        }
    }

    /// Send one message to one peer.
    pub fn send_to(&self, peer: &str, message: Message) -> Result<(), NetworkError> {
        let outbox = self
            .outboxes
            .get(peer)
            .ok_or_else(|| NetworkError::PeerUnavailable(peer.to_string()))?;
        outbox
            .try_send(message)
            .map_err(|_| NetworkError::PeerUnavailable(peer.to_string()))
    }

    /// Best-effort broadcast to every connected peer.
    pub fn broadcast(&self, message: &Message) {
        for outbox in self.outboxes.iter() {
            let _ = outbox.value().try_send(message.clone());
        }
    }

    /// Issue an outbound request and await its correlated response.
    pub async fn request(
        &self,
        peer: &str,
        request: Message,
        expect: MessageKind,
    ) -> Result<Message, NetworkError> {
        let (tx, rx) = oneshot::channel();
        let key = (peer.to_string(), expect);
        self.waiters.insert(key.clone(), tx);

        let events = {
            let session = self
                .sessions
                .get(peer)
                .ok_or_else(|| NetworkError::PeerUnavailable(peer.to_string()))?;
            let mut session = session.lock();
            let (_nonce, events) = session.begin_request(request, expect, now_ms());
            events
        };
        let outbox = self
            .outboxes
            .get(peer)
            .ok_or_else(|| NetworkError::PeerUnavailable(peer.to_string()))?
            .clone();
        for event in events {
            if let SessionEvent::Send(message) = event {
                outbox
                    .send(message)
                    .await
                    .map_err(|_| NetworkError::PeerUnavailable(peer.to_string()))?;
            }
        }

        match tokio::time::timeout(
            Duration::from_millis(self.config.message_timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => {
                self.waiters.remove(&key);
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Ready peers as the synchronizer sees them.
    pub fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
        let now = now_ms();
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.value().lock();
                if session.state() != SessionState::Ready {
                    return None;
                }
                let version = session.peer_version()?.clone();
                let bandwidth = self
                    .transfers
                    .get(entry.key())
                    .map(|t| {
                        let elapsed = t.connected_at.elapsed();
                        if elapsed < BANDWIDTH_WARMUP {
                            MIN_PEER_BANDWIDTH_BPS
                        } else {
                            t.bytes / elapsed.as_secs().max(1)
                        }
                    })
                    .unwrap_or(MIN_PEER_BANDWIDTH_BPS);
                Some(PeerSnapshot {
                    peer_id: entry.key().clone(),
                    height: version.height,
                    latency_ms: session.latency_ms(now).unwrap_or(0.0),
                    bandwidth_bps: bandwidth,
                    currency_symbol: version.currency_symbol,
                })
            })
            .collect()
    }

    /// Number of live sessions.
    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic upkeep: expire bans and enforce per-session timers.
    pub fn tick(&self) {
        let now = now_ms();
        self.scores.lock().unban_expired(now);
        for entry in self.sessions.iter() {
            let (_expired, _events) = entry.value().lock().check_timeouts(now);
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Message>,
    magic: u32,
) {
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, magic, &message).await {
            debug!(error = %e, "network: write failed");
            break;
        }
    }
}

#[async_trait::async_trait]
impl SyncClient for NetworkService {
    async fn request_headers(
        &self,
        peer: &str,
        start_height: u64,
        count: u64,
    ) -> Result<Vec<tally_core::types::BlockHeader>, NetworkError> {
        let request = Message::GetHeaders(crate::message::GetHeadersPayload {
            start_height,
            count,
        });
        match self.request(peer, request, MessageKind::Headers).await? {
            Message::Headers(headers) => Ok(headers),
            _ => Err(NetworkError::Serialization("unexpected response".into())),
        }
    }

    async fn request_block(
        &self,
        peer: &str,
        hash: tally_core::types::Hash256,
    ) -> Result<tally_core::types::Block, NetworkError> {
        let request = Message::GetData(vec![InvItem { kind: InvKind::Block, hash }]);
        match self.request(peer, request, MessageKind::Block).await? {
            Message::Block(block) => Ok(*block),
            _ => Err(NetworkError::Serialization("unexpected response".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devnet_config(port: u16) -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: port,
            ..NetworkConfig::devnet()
        }
    }

    async fn wait_ready(service: &Arc<NetworkService>) -> String {
        for _ in 0..100 {
            if let Some(entry) = service.sessions.iter().next() {
                if entry.value().lock().state() == SessionState::Ready {
                    return entry.key().clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer never became ready");
    }

    #[tokio::test]
    async fn handshake_over_real_sockets() {
        let (server, _server_rx) = NetworkService::new(devnet_config(0), || {
            NetworkService::version_payload(10)
        });
        let addr = server.listen().await.unwrap();

        let (client, _client_rx) = NetworkService::new(devnet_config(0), || {
            NetworkService::version_payload(0)
        });
        client.connect(&addr.to_string()).await.unwrap();

        let server_peer = wait_ready(&client).await;
        wait_ready(&server).await;

        // The client sees the server's advertised height.
        let snapshots = client.peer_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].peer_id, server_peer);
        assert_eq!(snapshots[0].height, 10);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (server, mut server_rx) = NetworkService::new(devnet_config(0), || {
            NetworkService::version_payload(10)
        });
        let addr = server.listen().await.unwrap();

        let (client, _client_rx) = NetworkService::new(devnet_config(0), || {
            NetworkService::version_payload(0)
        });
        client.connect(&addr.to_string()).await.unwrap();
        let server_peer = wait_ready(&client).await;
        wait_ready(&server).await;

        // Answer the first GetHeaders the server receives.
        let server_clone = server.clone();
        tokio::spawn(async move {
            while let Some((peer, message)) = server_rx.recv().await {
                if matches!(message, Message::GetHeaders(_)) {
                    let _ = server_clone.send_to(&peer, Message::Headers(vec![]));
                    break;
                }
            }
        });

        let headers = client
            .request_headers(&server_peer, 1, 10)
            .await
            .unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn blacklisted_peer_refused_on_dial() {
        let (service, _rx) = NetworkService::new(
            NetworkConfig {
                blacklisted_peers: vec!["1.2.3.4:9".into()],
                ..devnet_config(0)
            },
            || NetworkService::version_payload(0),
        );
        assert!(matches!(
            service.connect("1.2.3.4:9").await.unwrap_err(),
            NetworkError::Banned
        ));
    }
}
