//! End-to-end session tests
//!
//! Each test starts a real server on an ephemeral port and drives it with
//! WebSocket clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pollcast::config::Config;
use pollcast::registry::ClientRegistry;
use pollcast::server::{self, AppState, ServerHandle};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ADMIN_SECRET: &str = "admin-pass";
const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    handle: ServerHandle,
    registry: Arc<ClientRegistry>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.auth.admin_secret = Some(ADMIN_SECRET.to_string());
        tweak(&mut config);

        let state = AppState::new(config).unwrap();
        let registry = Arc::clone(&state.registry);
        let handle = server::start(state).await.unwrap();
        Self { handle, registry }
    }

    async fn connect(&self) -> Client {
        let url = format!("ws://{}/ws", self.handle.local_addr);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn join_admin(&self) -> Client {
        let mut ws = self.connect().await;
        send(
            &mut ws,
            json!({ "type": "join", "client_secret": ADMIN_SECRET, "attendee": "host", "is_admin": true }),
        )
        .await;
        assert_eq!(recv(&mut ws).await["role"], "admin");
        assert_eq!(recv(&mut ws).await["type"], "replay");
        ws
    }

    /// Join as a voter and return the client plus its initial `voted` flag.
    async fn join_voter(&self, attendee: &str) -> (Client, bool) {
        let mut ws = self.connect().await;
        send(
            &mut ws,
            json!({ "type": "join", "attendee": attendee, "is_admin": false }),
        )
        .await;
        let joined = recv(&mut ws).await;
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["role"], "voter");
        assert_eq!(joined["attendee"], attendee);
        assert_eq!(recv(&mut ws).await["type"], "replay");
        let voted = recv(&mut ws).await["voted"].as_bool().unwrap();
        (ws, voted)
    }

    async fn wait_for_clients(&self, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while self.registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn recv(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert nothing but control frames arrives for a short while.
async fn assert_silent(ws: &mut Client) {
    let quiet = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "expected no frames, got {:?}", quiet);
}

/// Wait until the server closes the connection.
async fn expect_closed(ws: &mut Client) {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => panic!("expected close, got {:?}", other),
            }
        }
    })
    .await
    .expect("server did not close the connection");
}

fn vote(decision: &str, weight: i64) -> Value {
    json!({ "is_admin": false, "type": "vote", "vote_decision": decision, "vote_weight": weight })
}

async fn open_question(admin: &mut Client, voters: &mut [&mut Client], question: &str) {
    send(
        admin,
        json!({ "is_admin": true, "type": "update_question", "update_question": question }),
    )
    .await;
    send(
        admin,
        json!({ "is_admin": true, "type": "set_voting_allowed", "vote_allowed": true }),
    )
    .await;
    let expected = [
        json!({ "curr_question": question }),
        json!({ "vote_allowed": false }),
        json!({ "voted": false }),
        json!({ "vote_allowed": true }),
    ];
    for frame in &expected {
        assert_eq!(&recv(admin).await, frame);
    }
    for voter in voters.iter_mut() {
        for frame in &expected {
            assert_eq!(&recv(voter).await, frame);
        }
    }
}

#[tokio::test]
async fn test_budget_question_end_to_end() {
    let server = TestServer::start().await;
    let mut admin = server.join_admin().await;
    let (mut alice, voted) = server.join_voter("alice").await;
    assert!(!voted);
    let (mut bob, _) = server.join_voter("bob").await;

    open_question(&mut admin, &mut [&mut alice, &mut bob], "Approve budget?").await;

    send(&mut alice, vote("yes", 1)).await;
    assert_eq!(recv(&mut alice).await, json!({ "voted": true }));
    let tally = recv(&mut admin).await;
    assert_eq!(tally["type"], "tally");
    assert_eq!(tally["tally"]["yes"], 1);

    // Duplicate from alice races bob's vote; the tally ends at 3 either way
    let (_, _) = tokio::join!(send(&mut alice, vote("yes", 1)), send(&mut bob, vote("yes", 2)));
    let duplicate = recv(&mut alice).await;
    assert_eq!(duplicate["type"], "error");
    assert!(duplicate["message"].as_str().unwrap().contains("duplicate vote"));
    assert_eq!(recv(&mut bob).await, json!({ "voted": true }));
    assert_eq!(recv(&mut admin).await["tally"]["yes"], 3);

    send(&mut admin, json!({ "is_admin": true, "type": "replay" })).await;
    let replay = recv(&mut admin).await;
    assert_eq!(replay["curr_question"], "Approve budget?");
    assert_eq!(replay["vote_allowed"], true);
    assert_eq!(replay["tally"], json!({ "no": 0, "yes": 3 }));

    server.handle.shutdown();
}

#[tokio::test]
async fn test_voter_cannot_claim_admin() {
    let server = TestServer::start().await;
    let mut admin = server.join_admin().await;
    let (mut mallory, _) = server.join_voter("mallory").await;

    send(
        &mut mallory,
        json!({ "is_admin": true, "type": "update_question", "update_question": "Hijacked?" }),
    )
    .await;
    send(
        &mut mallory,
        json!({ "is_admin": true, "type": "set_voting_allowed", "vote_allowed": true }),
    )
    .await;
    assert_silent(&mut mallory).await;
    assert_silent(&mut admin).await;

    send(&mut admin, json!({ "is_admin": true, "type": "replay" })).await;
    let replay = recv(&mut admin).await;
    assert_eq!(replay["curr_question"], "");
    assert_eq!(replay["vote_allowed"], false);
    assert_eq!(server.registry.len(), 2);
}

#[tokio::test]
async fn test_reconnect_keeps_voted_status() {
    let server = TestServer::start().await;
    let mut admin = server.join_admin().await;
    let (mut carol, _) = server.join_voter("carol").await;
    open_question(&mut admin, &mut [&mut carol], "Lunch at noon?").await;

    send(&mut carol, vote("no", 1)).await;
    assert_eq!(recv(&mut carol).await, json!({ "voted": true }));
    carol.close(None).await.unwrap();
    server.wait_for_clients(1).await;

    let (mut carol, voted) = server.join_voter("carol").await;
    assert!(voted);
    send(&mut carol, vote("no", 1)).await;
    let rejected = recv(&mut carol).await;
    assert_eq!(rejected["type"], "error");

    send(&mut admin, json!({ "is_admin": true, "type": "replay" })).await;
    // Skip the tally pushed for carol's first vote
    let mut frame = recv(&mut admin).await;
    while frame["type"] != "replay" {
        frame = recv(&mut admin).await;
    }
    assert_eq!(frame["tally"]["no"], 1);
}

#[tokio::test]
async fn test_new_question_allows_revote() {
    let server = TestServer::start().await;
    let mut admin = server.join_admin().await;
    let (mut dave, _) = server.join_voter("dave").await;

    open_question(&mut admin, &mut [&mut dave], "First?").await;
    send(&mut dave, vote("yes", 1)).await;
    assert_eq!(recv(&mut dave).await, json!({ "voted": true }));
    assert_eq!(recv(&mut admin).await["type"], "tally");

    open_question(&mut admin, &mut [&mut dave], "Second?").await;
    send(&mut dave, vote("no", 4)).await;
    assert_eq!(recv(&mut dave).await, json!({ "voted": true }));
    let tally = recv(&mut admin).await;
    assert_eq!(tally["tally"], json!({ "no": 4, "yes": 0 }));
}

#[tokio::test]
async fn test_wrong_admin_secret_is_rejected_and_closed() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    send(
        &mut ws,
        json!({ "type": "join", "client_secret": "guess", "attendee": "eve", "is_admin": true }),
    )
    .await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("unauthorized"));
    expect_closed(&mut ws).await;
    assert_eq!(server.registry.len(), 0);
}

#[tokio::test]
async fn test_admin_join_refused_without_configured_secret() {
    let server = TestServer::start_with(|config| config.auth.admin_secret = None).await;
    let mut ws = server.connect().await;
    send(
        &mut ws,
        json!({ "type": "join", "client_secret": "", "is_admin": true }),
    )
    .await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("admin access"));
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_first_frame_must_be_join() {
    let server = TestServer::start().await;
    let mut ws = server.connect().await;
    send(&mut ws, vote("yes", 1)).await;

    assert_eq!(recv(&mut ws).await["type"], "error");
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_silent_connection_times_out() {
    let server = TestServer::start_with(|config| config.server.join_timeout_ms = 100).await;
    let mut ws = server.connect().await;
    expect_closed(&mut ws).await;
    assert_eq!(server.registry.len(), 0);
}

#[tokio::test]
async fn test_abrupt_disconnect_does_not_break_broadcast() {
    let server = TestServer::start().await;
    let mut admin = server.join_admin().await;
    let (gone, _) = server.join_voter("gone").await;
    let (mut stays, _) = server.join_voter("stays").await;
    server.wait_for_clients(3).await;

    drop(gone);
    open_question(&mut admin, &mut [&mut stays], "Still there?").await;

    server.wait_for_clients(2).await;
    send(&mut stays, vote("yes", 1)).await;
    assert_eq!(recv(&mut stays).await, json!({ "voted": true }));
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let server = TestServer::start().await;
    let (mut voter, _) = server.join_voter("frank").await;

    server.handle.shutdown();
    expect_closed(&mut voter).await;

    let TestServer { handle, .. } = server;
    tokio::time::timeout(WAIT, handle.wait())
        .await
        .expect("server did not stop")
        .unwrap();
}
