use super::*;
use crate::{event_bus::EventBus, router::Topic};
use axum::{
    extract::{
        ws::{Message as ServerMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use chrono::Duration as ChronoDuration;
use jsonwebtoken::{encode, EncodingKey, Header};
use shared::protocol::TopicPayload;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::net::TcpListener;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum Script {
    /// Stay silent and keep the socket open.
    #[default]
    Idle,
    /// Push a new-message frame in reply to each SUBSCRIBE.
    PushOnSubscribe,
    /// Close the first socket right after its first SUBSCRIBE.
    DropFirstAfterSubscribe,
    /// Reply to each SUBSCRIBE with two frames in a single text message.
    PushBatchOnSubscribe,
}

#[derive(Clone, Default)]
struct WsServerState {
    script: Script,
    connections: Arc<AtomicUsize>,
    auth_headers: Arc<Mutex<Vec<String>>>,
    /// (connection index, raw frame text)
    frames: Arc<Mutex<Vec<(usize, String)>>>,
    close_codes: Arc<Mutex<Vec<u16>>>,
}

impl WsServerState {
    fn frames_starting_with(&self, prefix: &str) -> Vec<(usize, String)> {
        self.frames
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, frame)| frame.starts_with(prefix))
            .cloned()
            .collect()
    }
}

const PUSHED_MESSAGE: &str = "MESSAGE\ndestination:/user/queue/message.received\ncontent-type:application/json\n\n{\"id\":42,\"conversationId\":7,\"senderId\":2,\"messageText\":\"pushed\",\"createdAt\":\"2026-03-01T10:00:00Z\"}\0";

const SECOND_PUSHED_MESSAGE: &str = "MESSAGE\ndestination:/user/queue/message.received\n\n{\"id\":43,\"conversationId\":7,\"senderId\":3,\"messageText\":\"batched\",\"createdAt\":\"2026-03-01T10:00:01Z\"}\0";

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<WsServerState>,
) -> Response {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.auth_headers.lock().expect("lock").push(auth.to_string());
    }
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_socket(socket, state, index))
}

async fn serve_socket(mut socket: WebSocket, state: WsServerState, index: usize) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            ServerMessage::Text(text) => {
                let is_subscribe = text.starts_with("SUBSCRIBE");
                state.frames.lock().expect("lock").push((index, text));
                if !is_subscribe {
                    continue;
                }
                match state.script {
                    Script::PushOnSubscribe => {
                        let _ = socket
                            .send(ServerMessage::Text(PUSHED_MESSAGE.to_string()))
                            .await;
                    }
                    Script::PushBatchOnSubscribe => {
                        let batch = format!("{PUSHED_MESSAGE}\n{SECOND_PUSHED_MESSAGE}");
                        let _ = socket.send(ServerMessage::Text(batch)).await;
                    }
                    Script::DropFirstAfterSubscribe if index == 0 => {
                        let _ = socket.send(ServerMessage::Close(None)).await;
                        return;
                    }
                    _ => {}
                }
            }
            ServerMessage::Close(frame) => {
                if let Some(frame) = frame {
                    state.close_codes.lock().expect("lock").push(frame.code);
                }
                return;
            }
            _ => {}
        }
    }
}

async fn spawn_ws_server(script: Script) -> (String, WsServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = WsServerState {
        script,
        ..WsServerState::default()
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}/ws"), state)
}

#[derive(serde::Serialize)]
struct Claims {
    sub: String,
    exp: i64,
}

fn token_valid_for(valid_for: ChronoDuration) -> String {
    encode(
        &Header::default(),
        &Claims {
            sub: "user-1".to_string(),
            exp: (Utc::now() + valid_for).timestamp(),
        },
        &EncodingKey::from_secret(b"server-only-secret"),
    )
    .expect("encode token")
}

fn fast_config(ws_url: String) -> ConnectionConfig {
    ConnectionConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
        },
        ..ConnectionConfig::new(ws_url, "device-1")
    }
}

async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    within(what, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

async fn wait_for_status(handle: &ConnectionHandle, status: ConnectionStatus) -> ConnectionSnapshot {
    let mut rx = handle.watch_state();
    within("connection status", async {
        rx.wait_for(|snapshot| snapshot.status == status)
            .await
            .expect("connection task alive")
            .clone()
    })
    .await
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(3),
        max_attempts: 10,
    };
    assert_eq!(policy.delay_for(0), Duration::from_millis(500));
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    assert_eq!(policy.delay_for(40), Duration::from_secs(3));
}

#[tokio::test]
async fn connect_presents_bearer_and_routes_pushes() {
    let (ws_url, server) = spawn_ws_server(Script::PushOnSubscribe).await;
    let bus = EventBus::new();
    let (_id, mut events) = bus.channel();
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(bus));

    let token = token_valid_for(ChronoDuration::hours(1));
    handle
        .connect(Credentials::bearer(token.clone()))
        .await
        .expect("connect");
    let snapshot = wait_for_status(&handle, ConnectionStatus::Connected).await;
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(
        server.auth_headers.lock().expect("lock").as_slice(),
        [format!("Bearer {token}")]
    );

    handle
        .subscribe(&destinations::user_queue(Topic::MessageReceived), DeviceType::Web)
        .await
        .expect("subscribe");

    let pushed = within("pushed message", async {
        loop {
            match events.recv().await.expect("bus open") {
                BusEvent::Topic(TopicPayload::NewMessage(message)) => break message,
                _ => continue,
            }
        }
    })
    .await;
    assert_eq!(pushed.message_text, "pushed");
    assert!(handle.snapshot().last_message_time.is_some());
}

#[tokio::test]
async fn every_frame_in_one_socket_message_is_routed() {
    let (ws_url, _server) = spawn_ws_server(Script::PushBatchOnSubscribe).await;
    let bus = EventBus::new();
    let (_id, mut events) = bus.channel();
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(bus));
    handle
        .subscribe(&destinations::user_queue(Topic::MessageReceived), DeviceType::Web)
        .await
        .expect("subscribe");
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");

    let mut texts = Vec::new();
    within("both pushed messages", async {
        while texts.len() < 2 {
            if let BusEvent::Topic(TopicPayload::NewMessage(message)) =
                events.recv().await.expect("bus open")
            {
                texts.push(message.message_text);
            }
        }
    })
    .await;
    assert_eq!(texts, ["pushed", "batched"]);
}

#[tokio::test]
async fn send_requires_an_open_socket() {
    let bus = EventBus::new();
    let handle = ConnectionHandle::spawn(
        fast_config("ws://127.0.0.1:9/ws".to_string()),
        TopicRouter::new(bus),
    );
    let err = handle
        .send_typing(&TypingIndicator {
            conversation_id: shared::domain::ConversationId(1),
            is_typing: true,
        })
        .await
        .expect_err("not connected");
    assert!(matches!(err, ConnectionError::NotConnected));

    // Subscriptions are accepted offline and replayed later.
    handle
        .subscribe("/user/queue/message.received", DeviceType::Desktop)
        .await
        .expect("queued subscribe");
}

#[tokio::test]
async fn outbound_send_uses_frame_codec() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");
    wait_for_status(&handle, ConnectionStatus::Connected).await;

    handle
        .send_typing(&TypingIndicator {
            conversation_id: shared::domain::ConversationId(3),
            is_typing: true,
        })
        .await
        .expect("send");

    wait_until("typing frame", || !server.frames_starting_with("SEND").is_empty()).await;
    let (_, frame) = server.frames_starting_with("SEND").remove(0);
    assert!(frame.starts_with("SEND\ndestination:/app/typing\ndevice-id:device-1\n"));
    assert!(frame.ends_with("{\"conversationId\":3,\"isTyping\":true}\0"));
}

#[tokio::test]
async fn server_close_reconnects_and_replays_subscriptions() {
    let (ws_url, server) = spawn_ws_server(Script::DropFirstAfterSubscribe).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));

    handle
        .subscribe("/user/queue/message.received", DeviceType::Mobile)
        .await
        .expect("queued subscribe");
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");

    wait_until("second connection", || {
        server.connections.load(Ordering::SeqCst) >= 2
            && server
                .frames_starting_with("SUBSCRIBE")
                .iter()
                .any(|(index, _)| *index == 1)
    })
    .await;

    let subscribes = server.frames_starting_with("SUBSCRIBE");
    for connection in [0, 1] {
        let (_, frame) = subscribes
            .iter()
            .find(|(index, _)| *index == connection)
            .expect("subscribe per connection");
        assert_eq!(
            frame,
            "SUBSCRIBE\ndestination:/user/queue/message.received\nid:sub-0\ndevice-type:MOBILE\n\n\0"
        );
    }
    let snapshot = wait_for_status(&handle, ConnectionStatus::Connected).await;
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.connected_epoch, 2);
}

#[tokio::test]
async fn cancelled_reconnect_timer_that_already_fired_is_ignored() {
    let (mut actor, handle) = ConnectionActor::new(
        fast_config("ws://127.0.0.1:9/ws".to_string()),
        TopicRouter::new(EventBus::new()),
    );

    actor.schedule_reconnect();
    let fired = actor.reconnect_generation;
    actor.cancel_reconnect();
    actor.schedule_reconnect();
    assert_eq!(handle.snapshot().reconnect_attempts, 2);

    // The first timer's event arrives after its replacement was scheduled.
    actor
        .handle_internal(InternalEvent::ReconnectDue { generation: fired })
        .await;
    assert!(actor.reconnect_task.is_some());
    assert_eq!(handle.snapshot().reconnect_attempts, 2);

    let current = actor.reconnect_generation;
    actor
        .handle_internal(InternalEvent::ReconnectDue { generation: current })
        .await;
    assert!(actor.reconnect_task.is_none());
}

#[tokio::test]
async fn intentional_disconnect_never_reconnects() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");
    wait_for_status(&handle, ConnectionStatus::Connected).await;

    handle.disconnect(true).await.expect("disconnect");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.is_intentional_close);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_intentional_disconnect_reconnects() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");
    wait_for_status(&handle, ConnectionStatus::Connected).await;

    handle.disconnect(false).await.expect("disconnect");
    wait_until("reconnect", || server.connections.load(Ordering::SeqCst) == 2).await;
    assert!(!handle.snapshot().is_intentional_close);
}

#[tokio::test]
async fn expired_token_opens_no_socket() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));

    let err = handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::minutes(-5))))
        .await
        .expect_err("expired token");
    assert!(matches!(err, ConnectionError::InvalidToken(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = handle.snapshot();
    assert!(snapshot.should_stop_retrying);
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert_eq!(server.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_server_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let bus = EventBus::new();
    let (_id, mut events) = bus.channel();
    let handle = ConnectionHandle::spawn(
        fast_config(format!("ws://{addr}/ws")),
        TopicRouter::new(bus),
    );
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("transport failures are not returned");

    let snapshot = wait_for_status(&handle, ConnectionStatus::Error).await;
    assert!(snapshot.should_stop_retrying);
    assert_eq!(snapshot.reconnect_attempts, 3);

    let mut saw_error_status = false;
    while let Ok(event) = events.try_recv() {
        if event == BusEvent::ConnectionStatusChanged(ConnectionStatus::Error) {
            saw_error_status = true;
        }
    }
    assert!(saw_error_status);
}

#[tokio::test]
async fn silent_server_is_closed_with_heartbeat_code_then_reconnected() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let config = ConnectionConfig {
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(50),
            missed_threshold: 1,
        },
        ..fast_config(ws_url)
    };
    let handle = ConnectionHandle::spawn(config, TopicRouter::new(EventBus::new()));
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");

    wait_until("heartbeat close", || {
        !server.close_codes.lock().expect("lock").is_empty()
    })
    .await;
    assert_eq!(
        server.close_codes.lock().expect("lock")[0],
        HEARTBEAT_TIMEOUT_CLOSE_CODE
    );
    assert!(server
        .frames_starting_with("SEND\ndestination:/app/heartbeat\n")
        .iter()
        .any(|(index, _)| *index == 0));

    wait_until("reconnect after heartbeat timeout", || {
        server.connections.load(Ordering::SeqCst) >= 2
    })
    .await;
}

#[tokio::test]
async fn dropping_every_handle_closes_the_socket() {
    let (ws_url, server) = spawn_ws_server(Script::Idle).await;
    let handle = ConnectionHandle::spawn(fast_config(ws_url), TopicRouter::new(EventBus::new()));
    handle
        .connect(Credentials::bearer(token_valid_for(ChronoDuration::hours(1))))
        .await
        .expect("connect");
    wait_for_status(&handle, ConnectionStatus::Connected).await;

    drop(handle);
    wait_until("normal close", || {
        server.close_codes.lock().expect("lock").as_slice() == [1000]
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}
