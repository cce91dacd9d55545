//! In-process stand-in for the remote service: the authenticated socket,
//! the listing endpoints and a ping target, served by axum on a loopback
//! port.
//!
//! Like the real service, a push only reaches sockets that have already
//! subscribed to its event and room.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config::DevConfig;
use crate::connector::ConnectorConfig;
use crate::fetcher::AUTH_HEADER;
use crate::protocol::{PushFrame, RequestFrame, ResponseFrame, WireMessage, FORBIDDEN_CODE};

pub const IDENTITY: &str = "tester";

#[derive(Debug, Clone)]
enum Control {
    Push(PushFrame),
    Drop,
}

#[derive(Default)]
struct Recorded {
    secret: String,
    responses: HashMap<String, (u16, Value)>,
    hold: bool,
    follow_ups: HashMap<String, PushFrame>,
    listing: Value,
    connections: usize,
    requests: Vec<RequestFrame>,
    subscriptions: Vec<(String, String)>,
}

struct Shared {
    control: broadcast::Sender<Control>,
    recorded: Mutex<Recorded>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Frames owed to one connection for one inbound frame.
    fn answer(&self, msg: WireMessage, conn: &mut Connection) -> Vec<WireMessage> {
        match msg {
            WireMessage::Authenticate { secret } if secret == self.lock().secret => {
                conn.authenticated = true;
                vec![WireMessage::Authenticated {
                    identity: IDENTITY.to_string(),
                }]
            }
            WireMessage::Authenticate { .. } => vec![WireMessage::Error {
                code: FORBIDDEN_CODE,
                message: "bad secret".into(),
            }],
            WireMessage::Request(frame) if conn.authenticated => {
                let mut rec = self.lock();
                rec.requests.push(frame.clone());
                if rec.hold {
                    return Vec::new();
                }
                let (status, body) = rec
                    .responses
                    .get(&frame.path)
                    .cloned()
                    .unwrap_or((200, json!([])));
                let mut out = vec![WireMessage::Response(ResponseFrame {
                    id: frame.id,
                    status,
                    body,
                })];
                if let Some(push) = rec.follow_ups.get(&frame.path) {
                    if conn.is_subscribed(push) {
                        out.push(WireMessage::Event(push.clone()));
                    }
                }
                out
            }
            WireMessage::Subscribe { event, room } if conn.authenticated => {
                self.lock().subscriptions.push((event.clone(), room.clone()));
                conn.subscribed.push((event, room));
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Default)]
struct Connection {
    authenticated: bool,
    subscribed: Vec<(String, String)>,
}

impl Connection {
    fn is_subscribed(&self, push: &PushFrame) -> bool {
        self.subscribed
            .iter()
            .any(|(event, room)| *event == push.event && *room == push.room)
    }
}

/// A running mock remote. Dropping it leaves the server task running until
/// the test runtime shuts down.
pub struct MockRemote {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockRemote {
    pub async fn start(secret: &str) -> Self {
        let (control, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            control,
            recorded: Mutex::new(Recorded {
                secret: secret.to_string(),
                listing: json!([]),
                ..Default::default()
            }),
        });

        let router = Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/socket", get(socket))
            .route("/cli/apps", get(listing))
            .route("/cli/machinepacks", get(listing))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockRemote { addr, shared }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            url: format!("ws://{}/socket", self.addr),
            connect_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(200),
            max_retries: 0,
            ping_interval: Duration::from_secs(25),
        }
    }

    /// A config pointing at this remote with every side effect disabled.
    pub fn dev_config(&self) -> DevConfig {
        let mut config = DevConfig::default();
        config.remote.api_url = self.api_url();
        config.session.connect_timeout_secs = 5;
        config.session.initial_backoff_ms = 50;
        config.session.max_backoff_secs = 1;
        config.preview.enabled = false;
        config.dependencies.install_commands = Vec::new();
        config.updates.enabled = false;
        config.keychain.path = Some(std::env::temp_dir().join("driftline-test-keychain.json"));
        config
    }

    pub fn respond(&self, path: &str, status: u16, body: Value) {
        self.shared
            .lock()
            .responses
            .insert(path.to_string(), (status, body));
    }

    /// While held, requests are recorded but never answered.
    pub fn hold_requests(&self, hold: bool) {
        self.shared.lock().hold = hold;
    }

    /// Changes the accepted secret. Live connections stay authenticated.
    pub fn set_secret(&self, secret: &str) {
        self.shared.lock().secret = secret.to_string();
    }

    /// After answering a request for `path`, sends `push` on the same socket
    /// if that socket is subscribed to it by then.
    pub fn push_after_response(&self, path: &str, push: PushFrame) {
        self.shared
            .lock()
            .follow_ups
            .insert(path.to_string(), push);
    }

    pub fn set_listing(&self, listing: Value) {
        self.shared.lock().listing = listing;
    }

    /// Sends `frame` to every connection subscribed to its event and room.
    pub fn push(&self, frame: PushFrame) {
        let _ = self.shared.control.send(Control::Push(frame));
    }

    /// Abruptly closes every live connection.
    pub fn drop_connections(&self) {
        let _ = self.shared.control.send(Control::Drop);
    }

    pub fn connections(&self) -> usize {
        self.shared.lock().connections
    }

    pub fn requests_seen(&self) -> usize {
        self.shared.lock().requests.len()
    }

    pub fn last_request(&self) -> Option<RequestFrame> {
        self.shared.lock().requests.last().cloned()
    }

    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.shared.lock().subscriptions.clone()
    }

    pub async fn wait_for_subscriptions(&self, n: usize) {
        self.wait_until(|rec| rec.subscriptions.len() >= n).await
    }

    pub async fn wait_for_requests(&self, n: usize) {
        self.wait_until(|rec| rec.requests.len() >= n).await
    }

    async fn wait_until(&self, done: impl Fn(&Recorded) -> bool) {
        let poll = async {
            while !done(&self.shared.lock()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .expect("mock remote never reached the expected state");
    }
}

async fn socket(ws: WebSocketUpgrade, State(shared): State<Arc<Shared>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn serve_socket(mut socket: WebSocket, shared: Arc<Shared>) {
    let mut control = shared.control.subscribe();
    shared.lock().connections += 1;
    let mut conn = Connection::default();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(msg) = WireMessage::from_json(text.as_str()) else {
                        continue;
                    };
                    for reply in shared.answer(msg, &mut conn) {
                        let rejected = matches!(reply, WireMessage::Error { .. });
                        if send(&mut socket, &reply).await.is_err() || rejected {
                            return;
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
            ctl = control.recv() => match ctl {
                Ok(Control::Push(frame)) if conn.is_subscribed(&frame) => {
                    if send(&mut socket, &WireMessage::Event(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(Control::Push(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn send(socket: &mut WebSocket, msg: &WireMessage) -> Result<(), axum::Error> {
    let json = msg.to_json().unwrap();
    socket.send(Message::Text(json.into())).await
}

async fn listing(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == shared.lock().secret);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!("unauthorized")));
    }
    (StatusCode::OK, Json(shared.lock().listing.clone()))
}
