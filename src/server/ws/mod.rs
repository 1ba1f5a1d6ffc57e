//! WebSocket connection lifecycle
//!
//! Each upgraded socket walks `Connecting -> Registered -> Receiving -> Closed`.
//! The socket is split: a writer task drains the connection's bounded queue
//! into the sink and sends periodic pings, while the connection task reads
//! frames one at a time and hands them to the dispatch router. The registry
//! only ever sees the queue sender, and pushing into it never waits: a client
//! whose queue is full is dropped instead.

pub mod handlers;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::connect_info::MaybeConnectInfo;
use super::protocol::{decode_join, JoinRequest, ServerEvent};
use super::AppState;
use crate::auth::{authorize_join, JoinError};
use crate::registry::{ClientSink, ConnectionId, Registration, Role, SendError, VoterId};

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames queued by a successful join: `joined`, `replay` and `voted`.
/// The queue gets this much headroom on top of `server.sendQueue`.
const JOIN_FRAMES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Registered,
    Receiving,
    Closed,
}

/// Send capability backed by the connection's outbound queue.
#[derive(Debug, Clone)]
pub struct QueueSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl QueueSink {
    pub fn new(tx: mpsc::Sender<Arc<str>>) -> Self {
        Self { tx }
    }
}

impl ClientSink for QueueSink {
    fn try_send(&self, payload: Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    remote: MaybeConnectInfo,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote: MaybeConnectInfo) {
    let conn_id = ConnectionId::new();
    let span = info_span!("conn", conn_id = %conn_id, remote = %remote);
    run_connection(socket, state, conn_id).instrument(span).await;
}

async fn run_connection(socket: WebSocket, state: AppState, conn_id: ConnectionId) {
    let server = &state.config.server;
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<Arc<str>>(server.send_queue + JOIN_FRAMES);
    let closed = CancellationToken::new();
    let writer = tokio::spawn(
        write_loop(
            ws_tx,
            rx,
            closed.clone(),
            server.ping_interval(),
            server.send_timeout(),
        )
        .in_current_span(),
    );

    let mut phase = ConnectionPhase::Connecting;
    debug!(?phase, "connection opened");

    let joined = await_join(&mut ws_rx, server.join_timeout(), &state.shutdown)
        .await
        .and_then(|request| {
            let role = authorize_join(&state.config.auth, &request)?;
            Ok((request, role))
        });
    let (request, role) = match joined {
        Ok(joined) => joined,
        Err(err) => {
            warn!(error = %err, "join rejected");
            if err.should_reply() {
                let payload = ServerEvent::error(err.to_string()).to_json();
                let _ = tx.try_send(Arc::from(payload));
            }
            drop(tx);
            finish_writer(writer, &closed).await;
            return;
        }
    };

    let voter = voter_identity(&request);
    let sink = Arc::new(QueueSink::new(tx));
    let Some(registration) = admit(&state, conn_id.clone(), voter.clone(), role, sink, &closed)
    else {
        debug!("client went away while joining");
        state.registry.unregister(&conn_id);
        finish_writer(writer, &closed).await;
        return;
    };
    phase = ConnectionPhase::Registered;
    info!(?phase, voter = %voter, role = %role, "client joined");

    phase = ConnectionPhase::Receiving;
    debug!(?phase, "receive loop started");
    receive_loop(&state, &registration, &mut ws_rx).await;

    phase = ConnectionPhase::Closed;
    state.registry.unregister(&conn_id);
    info!(?phase, voter = %voter, role = %role, "client disconnected");

    drop(registration);
    finish_writer(writer, &closed).await;
}

async fn receive_loop(
    state: &AppState,
    registration: &Arc<Registration>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    loop {
        let message = tokio::select! {
            _ = registration.close_signal().cancelled() => {
                debug!("registration closed");
                break;
            }
            _ = state.shutdown.cancelled() => {
                debug!("server shutting down");
                break;
            }
            message = ws_rx.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                handlers::handle_frame(state, registration, text.as_str());
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handlers::handle_frame(state, registration, text),
                Err(_) => debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "client sent close");
                break;
            }
            // Pings are answered by axum; pongs need no action
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                break;
            }
            None => break,
        }
    }
}

/// Wait for the join request that must open every connection.
async fn await_join(
    ws_rx: &mut SplitStream<WebSocket>,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<JoinRequest, JoinError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Err(JoinError::Closed),
            next = tokio::time::timeout_at(deadline, ws_rx.next()) => {
                next.map_err(|_| JoinError::Timeout)?
            }
        };
        match next {
            Some(Ok(Message::Text(text))) => return Ok(decode_join(text.as_str())?),
            Some(Ok(Message::Binary(bytes))) => {
                let text = std::str::from_utf8(&bytes).map_err(|_| {
                    JoinError::Malformed("join frame is not valid UTF-8".to_string())
                })?;
                return Ok(decode_join(text)?);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(JoinError::Closed),
        }
    }
}

/// Queue the join replies and register the connection.
///
/// Runs under the broadcaster's sequence guard: the replay snapshot and the
/// voted flag are taken with no change in flight, and the first broadcast
/// queued after them follows them on the wire.
fn admit(
    state: &AppState,
    conn_id: ConnectionId,
    voter: VoterId,
    role: Role,
    sink: Arc<dyn ClientSink>,
    closed: &CancellationToken,
) -> Option<Arc<Registration>> {
    let _sequence = state.broadcaster.sequence();

    let joined = ServerEvent::Joined {
        role,
        attendee: voter.clone(),
    };
    sink.try_send(Arc::from(joined.to_json())).ok()?;

    let registration = state
        .registry
        .register(conn_id, voter, role, sink, closed.clone());
    let already_voted = state.session.sync_voted(&registration);

    let replay = ServerEvent::Replay(state.session.snapshot());
    if !state.broadcaster.send_to(&registration, &replay) {
        return None;
    }
    if role == Role::Voter {
        let voted = ServerEvent::Voted(already_voted);
        if !state.broadcaster.send_to(&registration, &voted) {
            return None;
        }
    }
    Some(registration)
}

fn voter_identity(request: &JoinRequest) -> VoterId {
    match request.attendee.as_deref().map(str::trim) {
        Some(attendee) if !attendee.is_empty() => VoterId::new(attendee),
        _ => VoterId::generate(),
    }
}

/// Drain the outbound queue into the socket until the queue closes, the
/// connection is cancelled or a write fails. Always ends with a close frame.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
    ping_every: Duration,
    write_timeout: Duration,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            next = rx.recv() => match next {
                Some(payload) => {
                    let message = Message::Text(payload.to_string().into());
                    match tokio::time::timeout(write_timeout, ws_tx.send(message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(error = %err, "socket write failed");
                            break;
                        }
                        Err(_) => {
                            warn!(timeout = ?write_timeout, "socket write timed out");
                            break;
                        }
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                let ping = ws_tx.send(Message::Ping(Bytes::new()));
                if !matches!(tokio::time::timeout(write_timeout, ping).await, Ok(Ok(()))) {
                    break;
                }
                trace!("sent ping");
            }
        }
    }

    let _ = tokio::time::timeout(write_timeout, ws_tx.send(Message::Close(None))).await;
    closed.cancel();
}

async fn finish_writer(mut writer: JoinHandle<()>, closed: &CancellationToken) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("writer did not drain in time, aborting");
        closed.cancel();
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::test_support::{ClosedSink, RecordingSink};
    use serde_json::json;

    fn request(attendee: Option<&str>) -> JoinRequest {
        JoinRequest {
            kind: "join".to_string(),
            client_secret: None,
            attendee: attendee.map(str::to_string),
            is_admin: false,
        }
    }

    #[test]
    fn test_voter_identity_uses_attendee() {
        assert_eq!(voter_identity(&request(Some(" alice "))), VoterId::new("alice"));
    }

    #[test]
    fn test_voter_identity_minted_when_missing() {
        let a = voter_identity(&request(None));
        let b = voter_identity(&request(Some("   ")));
        assert!(a.as_str().starts_with("anon_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_queue_sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = QueueSink::new(tx);
        sink.try_send(Arc::from("one")).unwrap();
        sink.try_send(Arc::from("two")).unwrap();
        assert_eq!(rx.try_recv().as_deref().ok(), Some("one"));
        assert_eq!(rx.try_recv().as_deref().ok(), Some("two"));
    }

    #[test]
    fn test_queue_sink_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = QueueSink::new(tx);
        assert!(matches!(sink.try_send(Arc::from("late")), Err(SendError::Closed)));
    }

    #[test]
    fn test_full_queue_refuses_without_waiting() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink::new(tx);
        sink.try_send(Arc::from("first")).unwrap();
        assert!(matches!(sink.try_send(Arc::from("second")), Err(SendError::Full)));
        assert_eq!(rx.try_recv().as_deref().ok(), Some("first"));
        assert!(rx.try_recv().is_err());
    }

    fn state() -> AppState {
        AppState::new(Config::default()).unwrap()
    }

    fn admit_voter(
        state: &AppState,
        attendee: &str,
        sink: Arc<dyn ClientSink>,
    ) -> Option<Arc<Registration>> {
        admit(
            state,
            ConnectionId::new(),
            VoterId::new(attendee),
            Role::Voter,
            sink,
            &CancellationToken::new(),
        )
    }

    #[test]
    fn test_admit_queues_join_frames_in_order() {
        let state = state();
        state.session.set_question("Approve budget?");
        let sink = RecordingSink::new();

        let registration = admit_voter(&state, "alice", sink.clone()).unwrap();

        let frames = sink.json_frames();
        assert_eq!(frames.len(), JOIN_FRAMES);
        assert_eq!(frames[0]["type"], "joined");
        assert_eq!(frames[0]["role"], "voter");
        assert_eq!(frames[1]["type"], "replay");
        assert_eq!(frames[1]["curr_question"], "Approve budget?");
        assert_eq!(frames[2], json!({ "voted": false }));
        assert!(state.registry.contains(registration.conn_id()));
    }

    #[test]
    fn test_admit_restores_voted_flag_for_returning_voter() {
        let state = state();
        state.session.set_question("Lunch at noon?");
        state.session.set_voting_allowed(true);
        state
            .session
            .cast_vote(&VoterId::new("carol"), "no", 1)
            .unwrap();

        let sink = RecordingSink::new();
        let registration = admit_voter(&state, "carol", sink.clone()).unwrap();

        assert!(registration.has_voted());
        assert_eq!(sink.json_frames().last(), Some(&json!({ "voted": true })));
    }

    #[test]
    fn test_admit_waits_for_in_flight_change() {
        let state = state();
        let sink = RecordingSink::new();

        let registration = std::thread::scope(|s| {
            let held = state.broadcaster.sequence();
            let joiner = s.spawn(|| admit_voter(&state, "dave", sink.clone()));
            state.session.set_question("Second?");
            drop(held);
            joiner.join().unwrap()
        })
        .unwrap();

        // The change made before the guard was released is in the replay
        assert_eq!(sink.json_frames()[1]["curr_question"], "Second?");
        assert!(state.registry.contains(registration.conn_id()));
    }

    #[test]
    fn test_admit_gives_up_when_client_is_gone() {
        let state = state();
        assert!(admit_voter(&state, "erin", Arc::new(ClosedSink)).is_none());
        assert_eq!(state.registry.len(), 0);
    }
}
