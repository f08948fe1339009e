//! Per-connection session management.
//!
//! Each WebSocket gets a Session that authenticates the peer, registers a
//! push connection with the relay, and routes inbound packets until the
//! socket closes or a newer connection for the same peer replaces it.

use crate::auth::{AuthOutcome, Authenticator};
use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::{ConnectionHandle, Outbound};
use crate::server::WakeRelay;
use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wakelink_types::{
    ClientFrame, ErrorCode, Packet, PeerId, Role, ServerFrame, PROTOCOL_VERSION,
};

/// Session state machine states.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// Waiting for the auth frame.
    AwaitingAuth,
    /// Authenticated and registered with the relay.
    Active {
        /// The registered push connection.
        handle: ConnectionHandle,
    },
    /// Session is closing.
    Closing,
}

/// A data frame read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// JSON text frame.
    Text(String),
    /// MessagePack binary frame.
    Binary(Vec<u8>),
}

impl Inbound {
    fn len(&self) -> usize {
        match self {
            Inbound::Text(text) => text.len(),
            Inbound::Binary(bytes) => bytes.len(),
        }
    }
}

/// Decode a data frame into a packet.
///
/// Returns `Ok(None)` for a stray auth frame after authentication.
pub fn decode_frame(frame: &Inbound, max_frame_size: usize) -> ProtocolResult<Option<Packet>> {
    if frame.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            limit: max_frame_size,
        });
    }

    let packet = match frame {
        Inbound::Text(text) => {
            if let Some(ClientFrame::Auth { .. }) = ClientFrame::parse(text) {
                return Ok(None);
            }
            Packet::from_json(text)?
        }
        Inbound::Binary(bytes) => Packet::from_bytes(bytes)?,
    };
    packet.check_version()?;
    Ok(Some(packet))
}

/// Wire error code for a protocol error.
pub fn error_code(err: &ProtocolError) -> ErrorCode {
    match err {
        ProtocolError::Packet(e) => ErrorCode::from(e),
        ProtocolError::FrameTooLarge { .. } => ErrorCode::InvalidPacket,
        ProtocolError::AuthRequired | ProtocolError::AuthTimeout { .. } => ErrorCode::AuthRequired,
        ProtocolError::InvalidToken { .. } => ErrorCode::InvalidToken,
        ProtocolError::Connection(_) => ErrorCode::Internal,
    }
}

/// A per-connection session.
pub struct Session {
    relay: Arc<WakeRelay>,
    authenticator: Arc<dyn Authenticator>,
    peer: PeerId,
    header_token: Option<String>,
    state: SessionState,
    /// Tasks waiting on responses to this client's requests.
    waiters: Vec<JoinHandle<()>>,
    /// Peer last spoke MessagePack; answer in kind.
    binary: Arc<AtomicBool>,
}

impl Session {
    /// Create a new session for `peer`.
    ///
    /// `header_token` is a token taken from the upgrade request headers; when
    /// present the session does not wait for an auth frame.
    pub fn new(
        relay: Arc<WakeRelay>,
        authenticator: Arc<dyn Authenticator>,
        peer: PeerId,
        header_token: Option<String>,
    ) -> Self {
        Self {
            relay,
            authenticator,
            peer,
            header_token,
            state: SessionState::AwaitingAuth,
            waiters: Vec::new(),
            binary: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session until completion.
    pub async fn run<W, R, E>(mut self, mut sink: W, mut stream: R) -> ProtocolResult<()>
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        if let Err(e) = self.authenticate(&mut stream).await {
            tracing::warn!("Authentication failed for {}: {}", self.peer, e);
            if let Ok(text) = ServerFrame::error(error_code(&e), e.to_string()).to_json() {
                let _ = sink.send(Message::Text(text)).await;
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "authentication failed".into(),
                })))
                .await;
            return Err(e);
        }

        let (handle, rx) =
            ConnectionHandle::channel(self.peer.clone(), self.relay.config().relay.outbound_buffer);
        let writer = tokio::spawn(write_loop(sink, rx, handle.clone(), Arc::clone(&self.binary)));

        // Welcome goes into the channel ahead of any backlog.
        handle.send_frame(ServerFrame::Connected {
            peer_id: self.peer.id().to_string(),
            role: self.peer.role(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        });
        match self.relay.register_connection(handle.clone()).await {
            Ok(drained) => {
                tracing::info!("Session active for {} ({} queued packets delivered)", self.peer, drained)
            }
            Err(e) => tracing::warn!("Session for {} lost during backlog drain: {}", self.peer, e),
        }
        self.state = SessionState::Active {
            handle: handle.clone(),
        };

        loop {
            tokio::select! {
                _ = handle.closed() => {
                    tracing::debug!("Connection {:?} for {} closed by relay", handle.id(), self.peer);
                    break;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.binary.store(false, Ordering::Relaxed);
                        self.handle_frame(&handle, Inbound::Text(text)).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.binary.store(true, Ordering::Relaxed);
                        self.handle_frame(&handle, Inbound::Binary(bytes)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Socket error for {}: {}", self.peer, e);
                        break;
                    }
                },
            }
        }

        self.state = SessionState::Closing;
        for waiter in self.waiters.drain(..) {
            waiter.abort();
        }
        self.relay.unregister_connection(&self.peer, handle.id());
        handle.close();
        let _ = writer.await;

        tracing::info!("Session closed for {}", self.peer);
        Ok(())
    }

    /// Resolve the token (header first, then the first frame) and check it
    /// authenticates as exactly this session's peer.
    async fn authenticate<R, E>(&mut self, stream: &mut R) -> ProtocolResult<()>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let token = match self.header_token.take() {
            Some(token) => token,
            None => {
                let secs = self.relay.config().limits.auth_timeout_secs;
                let first = tokio::time::timeout(Duration::from_secs(secs), next_data_frame(stream))
                    .await
                    .map_err(|_| ProtocolError::AuthTimeout { secs })?
                    .ok_or_else(|| ProtocolError::Connection("closed before authentication".into()))?;

                match first {
                    Inbound::Text(text) => match ClientFrame::parse(&text) {
                        Some(ClientFrame::Auth { token }) => token,
                        None => return Err(ProtocolError::AuthRequired),
                    },
                    Inbound::Binary(_) => return Err(ProtocolError::AuthRequired),
                }
            }
        };

        match self.authenticator.authenticate(&token).await {
            AuthOutcome::Valid(peer) if peer == self.peer => Ok(()),
            _ => Err(ProtocolError::InvalidToken {
                peer: self.peer.clone(),
            }),
        }
    }

    async fn handle_frame(&mut self, handle: &ConnectionHandle, frame: Inbound) {
        let max = self.relay.config().limits.max_frame_size;
        let packet = match decode_frame(&frame, max) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                tracing::debug!("Ignoring repeated auth frame from {}", self.peer);
                return;
            }
            Err(e) => {
                tracing::debug!("Bad frame from {}: {}", self.peer, e);
                handle.send_frame(ServerFrame::error(error_code(&e), e.to_string()));
                return;
            }
        };

        if let Err(e) = self.relay.rate_limits().check_packet(&self.peer) {
            tracing::warn!("Rate limited {}: {}", self.peer, e);
            self.relay.record_rate_limit_hit();
            handle.send_frame(ServerFrame::Error {
                error: ErrorCode::RateLimited,
                message: e.to_string(),
                request_id: packet.request_id,
            });
            return;
        }

        match self.peer.role() {
            Role::Device => self.handle_response(handle, packet),
            Role::Client => self.handle_request(handle, packet).await,
        }
    }

    /// A device answering an earlier request.
    fn handle_response(&self, handle: &ConnectionHandle, packet: Packet) {
        let Some(request_id) = packet.request_id.clone() else {
            handle.send_frame(ServerFrame::error(
                ErrorCode::InvalidPacket,
                "response is missing request_id",
            ));
            return;
        };
        self.relay.deliver_response(&self.peer, &request_id, packet);
    }

    /// A client sending a request to a device.
    async fn handle_request(&mut self, handle: &ConnectionHandle, packet: Packet) {
        let target = PeerId::device(packet.peer_id.clone());
        let request_id = packet.request_id.clone();

        // Register the wait before sending so a fast reply cannot be missed.
        let pending = match &request_id {
            Some(id) => {
                let timeout = self.relay.config().relay.response_timeout();
                match self.relay.begin_await(&target, id.clone(), timeout) {
                    Ok(pending) => Some(pending),
                    Err(e) => {
                        handle.send_frame(ServerFrame::Error {
                            error: ErrorCode::DuplicateRequest,
                            message: e.to_string(),
                            request_id: Some(id.clone()),
                        });
                        return;
                    }
                }
            }
            None => None,
        };

        let capacity = self.relay.config().relay.queue_capacity;
        let outcome = match self.relay.send_to(&target, packet).await.into_result(&target, capacity) {
            Ok(outcome) => outcome,
            Err(e) => {
                handle.send_frame(ServerFrame::Error {
                    error: ErrorCode::QueueOverflow,
                    message: e.to_string(),
                    request_id,
                });
                return;
            }
        };

        handle.send_frame(ServerFrame::Success {
            peer_id: target.id().to_string(),
            mode: outcome.as_str().to_string(),
            delivered: outcome.is_delivered(),
            queued: outcome.is_queued(),
            request_id: request_id.clone(),
        });

        if let (Some(pending), Some(id)) = (pending, request_id) {
            let relay = Arc::clone(&self.relay);
            let peer = self.peer.clone();
            let handle = handle.clone();
            self.waiters.retain(|w| !w.is_finished());
            self.waiters.push(tokio::spawn(async move {
                match relay.resolve_wait(pending).await {
                    Ok(response) => {
                        relay.send_to(&peer, response).await;
                    }
                    Err(e) => {
                        handle.send_frame(ServerFrame::Error {
                            error: ErrorCode::Timeout,
                            message: e.to_string(),
                            request_id: Some(id),
                        });
                    }
                }
            }));
        }
    }
}

/// Next text or binary frame; `None` once the socket is closed.
async fn next_data_frame<R, E>(stream: &mut R) -> Option<Inbound>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(Inbound::Text(text)),
            Ok(Message::Binary(bytes)) => return Some(Inbound::Binary(bytes)),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

fn encode(outbound: Outbound, binary: bool) -> ProtocolResult<Message> {
    let message = match outbound {
        Outbound::Packet(packet) if binary => Message::Binary(packet.to_bytes()?),
        Outbound::Packet(packet) => Message::Text(packet.to_json()?),
        Outbound::Frame(frame) => Message::Text(frame.to_json()?),
    };
    Ok(message)
}

/// Drain the connection's outbound channel onto the socket.
async fn write_loop<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<Outbound>,
    handle: ConnectionHandle,
    binary: Arc<AtomicBool>,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    loop {
        let outbound = tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(outbound) => outbound,
                None => break,
            },
            _ = handle.closed() => break,
        };

        let message = match encode(outbound, binary.load(Ordering::Relaxed)) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to encode outbound frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!("Write to {} failed: {}", handle.peer(), e);
            handle.close();
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::config::Config;
    use crate::server::PeerStatus;
    use futures_util::stream::BoxStream;
    use std::pin::Pin;
    use wakelink_types::RequestId;

    type TestSink = Pin<Box<dyn Sink<Message, Error = String> + Send>>;

    /// In-memory socket: `to_session` feeds the session, `from_session` collects what it writes.
    struct Socket {
        to_session: mpsc::UnboundedSender<Message>,
        from_session: mpsc::UnboundedReceiver<Message>,
    }

    impl Socket {
        fn send_text(&self, text: &str) {
            self.to_session.send(Message::Text(text.to_string())).unwrap();
        }

        async fn recv_json(&mut self) -> serde_json::Value {
            self.recv_json_within(Duration::from_secs(1)).await
        }

        async fn recv_json_within(&mut self, window: Duration) -> serde_json::Value {
            loop {
                let message = tokio::time::timeout(window, self.from_session.recv())
                    .await
                    .expect("session should write a frame")
                    .expect("socket open");
                match message {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Binary(bytes) => {
                        return serde_json::to_value(Packet::from_bytes(&bytes).unwrap()).unwrap()
                    }
                    _ => continue,
                }
            }
        }
    }

    fn socket() -> (Socket, TestSink, BoxStream<'static, Result<Message, String>>) {
        let (to_session, inbound) = mpsc::unbounded_channel::<Message>();
        let (outbound, from_session) = mpsc::unbounded_channel::<Message>();

        let stream = futures_util::stream::unfold(inbound, |mut rx| async move {
            rx.recv().await.map(|m| (Ok(m), rx))
        })
        .boxed();
        let sink: TestSink = Box::pin(futures_util::sink::unfold(
            outbound,
            |tx, message: Message| async move {
                tx.send(message).map_err(|e| e.to_string())?;
                Ok::<_, String>(tx)
            },
        ));

        (
            Socket {
                to_session,
                from_session,
            },
            sink,
            stream,
        )
    }

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(
            StaticTokenAuthenticator::new()
                .with_token("dev", PeerId::device("D1"))
                .with_token("dev2", PeerId::device("D2"))
                .with_token("cli", PeerId::client("C1"))
                .with_token("cli2", PeerId::client("C2")),
        )
    }

    fn start(
        relay: &Arc<WakeRelay>,
        peer: PeerId,
        header_token: Option<&str>,
    ) -> (Socket, JoinHandle<ProtocolResult<()>>) {
        let (socket, sink, stream) = socket();
        let session = Session::new(
            Arc::clone(relay),
            authenticator(),
            peer,
            header_token.map(str::to_string),
        );
        let task = tokio::spawn(session.run(sink, stream));
        (socket, task)
    }

    async fn until_connected(relay: &WakeRelay, peer: &PeerId) {
        for _ in 0..200 {
            if relay.status(peer) == PeerStatus::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{peer} never registered");
    }

    const REQUEST: &str =
        r#"{"device_id":"D1","payload":"cmd","signature":"s","version":"1.0","request_id":"r1"}"#;
    const RESPONSE: &str =
        r#"{"device_id":"D1","payload":"ok","signature":"s","version":"1.0","request_id":"r1"}"#;

    #[test]
    fn decode_rejects_oversized_frames() {
        let frame = Inbound::Text("x".repeat(100));
        let err = decode_frame(&frame, 10).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 100, limit: 10 }));
        assert_eq!(error_code(&err), ErrorCode::InvalidPacket);
    }

    #[test]
    fn decode_maps_packet_errors_to_codes() {
        let err = decode_frame(&Inbound::Text("not json".into()), 1024).unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::InvalidJson);

        let err = decode_frame(&Inbound::Text(r#"{"payload":"x"}"#.into()), 1024).unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::InvalidPacket);

        let err = decode_frame(
            &Inbound::Text(r#"{"device_id":"D1","payload":"x","signature":"s","version":"2.0"}"#.into()),
            1024,
        )
        .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::UnsupportedVersion);
    }

    #[test]
    fn decode_accepts_messagepack_and_skips_auth() {
        let packet = Packet::new("D1", "x", "s");
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(decode_frame(&Inbound::Binary(bytes), 1024).unwrap(), Some(packet));

        let auth = Inbound::Text(r#"{"type":"auth","token":"t"}"#.into());
        assert_eq!(decode_frame(&auth, 1024).unwrap(), None);
    }

    #[tokio::test]
    async fn auth_frame_authenticates_and_welcomes() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut socket, _task) = start(&relay, PeerId::device("D1"), None);

        socket.send_text(r#"{"type":"auth","token":"dev"}"#);
        let welcome = socket.recv_json().await;
        assert_eq!(welcome["status"], "connected");
        assert_eq!(welcome["peer_id"], "D1");
        assert_eq!(welcome["role"], "device");
    }

    #[tokio::test]
    async fn token_for_another_peer_is_rejected() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut socket, task) = start(&relay, PeerId::device("D2"), None);

        socket.send_text(r#"{"type":"auth","token":"dev"}"#);
        let reply = socket.recv_json().await;
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "INVALID_TOKEN");

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::InvalidToken { .. })));
        assert_eq!(relay.status(&PeerId::device("D2")), PeerStatus::Unconnected);
    }

    #[tokio::test]
    async fn packet_before_auth_is_refused() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut socket, task) = start(&relay, PeerId::client("C1"), None);

        socket.send_text(REQUEST);
        let reply = socket.recv_json().await;
        assert_eq!(reply["error"], "AUTH_REQUIRED");
        assert!(matches!(task.await.unwrap(), Err(ProtocolError::AuthRequired)));
    }

    #[tokio::test]
    async fn header_token_skips_auth_frame() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut socket, _task) = start(&relay, PeerId::device("D1"), Some("dev"));

        let welcome = socket.recv_json().await;
        assert_eq!(welcome["status"], "connected");
        until_connected(&relay, &PeerId::device("D1")).await;
    }

    #[tokio::test]
    async fn backlog_follows_welcome() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        relay.send(Packet::new("D1", "queued", "s")).await;

        let (mut socket, _task) = start(&relay, PeerId::device("D1"), Some("dev"));
        assert_eq!(socket.recv_json().await["status"], "connected");
        assert_eq!(socket.recv_json().await["payload"], "queued");
    }

    #[tokio::test]
    async fn request_and_response_round_trip() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut device, _d) = start(&relay, PeerId::device("D1"), Some("dev"));
        let (mut client, _c) = start(&relay, PeerId::client("C1"), Some("cli"));
        device.recv_json().await;
        client.recv_json().await;
        until_connected(&relay, &PeerId::device("D1")).await;
        until_connected(&relay, &PeerId::client("C1")).await;

        client.send_text(REQUEST);
        let ack = client.recv_json().await;
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["mode"], "pushed");
        assert_eq!(ack["delivered"], true);

        let request = device.recv_json().await;
        assert_eq!(request["payload"], "cmd");
        assert_eq!(request["request_id"], "r1");

        device.send_text(RESPONSE);
        let response = client.recv_json().await;
        assert_eq!(response["payload"], "ok");
        assert_eq!(response["request_id"], "r1");
    }

    #[tokio::test]
    async fn duplicate_request_id_is_refused() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut client, _c) = start(&relay, PeerId::client("C1"), Some("cli"));
        client.recv_json().await;

        client.send_text(REQUEST);
        assert_eq!(client.recv_json().await["mode"], "queued");

        client.send_text(REQUEST);
        let reply = client.recv_json().await;
        assert_eq!(reply["error"], "DUPLICATE_REQUEST");
        assert_eq!(reply["request_id"], "r1");
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let mut config = Config::default();
        config.relay.response_timeout_secs = 1;
        let relay = Arc::new(WakeRelay::new(config));
        let (mut client, _c) = start(&relay, PeerId::client("C1"), Some("cli"));
        client.recv_json().await;

        client.send_text(REQUEST);
        client.recv_json().await;

        let reply = client.recv_json_within(Duration::from_secs(3)).await;
        assert_eq!(reply["error"], "TIMEOUT");
        assert_eq!(reply["request_id"], "r1");
        assert!(relay
            .begin_await(&PeerId::device("D1"), RequestId::from("r1"), Duration::ZERO)
            .is_ok());
    }

    #[tokio::test]
    async fn other_device_cannot_answer_request() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut client, _c) = start(&relay, PeerId::client("C1"), Some("cli"));
        let (mut intruder, _d2) = start(&relay, PeerId::device("D2"), Some("dev2"));
        client.recv_json().await;
        intruder.recv_json().await;
        until_connected(&relay, &PeerId::device("D2")).await;

        client.send_text(REQUEST);
        assert_eq!(client.recv_json().await["mode"], "queued");

        intruder.send_text(
            r#"{"device_id":"D2","payload":"forged","signature":"s","version":"1.0","request_id":"r1"}"#,
        );
        let nothing =
            tokio::time::timeout(Duration::from_millis(200), client.from_session.recv()).await;
        assert!(nothing.is_err(), "client must not see another device's answer");
        assert_eq!(relay.metrics().snapshot().responses_dropped, 1);
        assert_eq!(relay.stats().pending_waits, 1);
    }

    #[tokio::test]
    async fn clients_may_reuse_request_ids_across_devices() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut c1, _c1) = start(&relay, PeerId::client("C1"), Some("cli"));
        let (mut c2, _c2) = start(&relay, PeerId::client("C2"), Some("cli2"));
        c1.recv_json().await;
        c2.recv_json().await;

        c1.send_text(REQUEST);
        assert_eq!(c1.recv_json().await["status"], "success");

        c2.send_text(
            r#"{"device_id":"D2","payload":"cmd","signature":"s","version":"1.0","request_id":"r1"}"#,
        );
        let ack = c2.recv_json().await;
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["peer_id"], "D2");
        assert_eq!(relay.stats().pending_waits, 2);
    }

    #[tokio::test]
    async fn device_response_without_request_id_is_invalid() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut device, _d) = start(&relay, PeerId::device("D1"), Some("dev"));
        device.recv_json().await;

        device.send_text(r#"{"device_id":"D1","payload":"ok","signature":"s","version":"1.0"}"#);
        assert_eq!(device.recv_json().await["error"], "INVALID_PACKET");
    }

    #[tokio::test]
    async fn closing_socket_unregisters_peer() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut socket, task) = start(&relay, PeerId::device("D1"), Some("dev"));
        socket.recv_json().await;
        until_connected(&relay, &PeerId::device("D1")).await;

        socket.to_session.send(Message::Close(None)).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(relay.status(&PeerId::device("D1")), PeerStatus::Unconnected);
    }

    #[tokio::test]
    async fn new_connection_replaces_old_session() {
        let relay = Arc::new(WakeRelay::new(Config::default()));
        let (mut first, first_task) = start(&relay, PeerId::device("D1"), Some("dev"));
        first.recv_json().await;

        let (mut second, _second_task) = start(&relay, PeerId::device("D1"), Some("dev"));
        second.recv_json().await;

        tokio::time::timeout(Duration::from_secs(1), first_task)
            .await
            .expect("evicted session should end")
            .unwrap()
            .unwrap();
        assert_eq!(relay.status(&PeerId::device("D1")), PeerStatus::Connected);
    }
}
