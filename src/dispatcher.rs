//! The WebSocket upgrade handler and per-connection action dispatch table.
//!
//! One task owns the socket's read half and the select loop; writes go
//! through an `Arc<Mutex<SplitSink>>` shared with the per-subscription
//! forwarding tasks it spawns, same single-writer discipline as the
//! teacher's realtime socket handler.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::connection::ConnectionTracker;
use crate::document::{doc_channel, Operation, OperationKind, SharedAdapter, Snapshot};
use crate::error::CoreError;
use crate::middleware::SubmitChain;
use crate::presence::PresenceManager;
use crate::protocol::{ClientMessage, OpMutation, ServerMessage};
use crate::pubsub::SharedPubSub;

pub struct AppState {
    pub config: Config,
    pub store: SharedAdapter,
    pub pubsub: SharedPubSub,
    pub presence: Arc<PresenceManager>,
    pub connections: Arc<ConnectionTracker>,
    pub submit_chain: SubmitChain,
}

type SharedSink = Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>;

/// Query param carrying the authenticated user id. Real authentication is
/// out of scope; callers sit this handler behind whatever auth layer owns
/// identity and forward the resolved user id here.
#[derive(Debug, serde::Deserialize)]
pub struct SocketParams {
    #[serde(default = "anonymous_user")]
    pub user_id: String,
}

fn anonymous_user() -> String {
    format!("anon-{}", Ulid::new())
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<SocketParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn send(sink: &SharedSink, msg: &ServerMessage) {
    let Ok(text) = serde_json::to_string(msg) else { return };
    let mut guard = sink.lock().await;
    if let Err(e) = guard.send(Message::Text(text.into())).await {
        debug!(error = %e, "failed to write to socket");
    }
}

async fn publish_value(state: &AppState, channel: &str, value: &serde_json::Value) {
    if let Err(e) = state.pubsub.publish(channel, value.clone()).await {
        warn!(channel, error = %e, "failed to publish");
    }
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let conn = match state.connections.admit(&user_id) {
        Ok(c) => c,
        Err(e) => {
            warn!(user_id, error = %e, "connection rejected");
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: e.to_string().into(),
            }));
            let _ = socket.send(close).await;
            return;
        }
    };
    info!(connection_id = %conn.id, user_id, "connection established");

    let (sink, mut stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    send(&sink, &ServerMessage::Handshake { protocol: 1, content_type: "json0".to_string(), id: conn.id.clone() }).await;

    // channel name -> (subscription id, forwarder task, per-forwarder cancel)
    let mut forwarders: HashMap<String, (u64, CancellationToken)> = HashMap::new();

    let mut ping_interval = tokio::time::interval(state.config.ping_interval);
    ping_interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = ping_interval.tick() => {
                let mut guard = sink.lock().await;
                if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = tokio::time::timeout(state.config.read_timeout, stream.next()) => {
                let Ok(incoming) = incoming else {
                    // No frame within the read deadline: probe liveness with a
                    // single ping. A failed write means the socket is dead.
                    let mut guard = sink.lock().await;
                    if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!(connection_id = %conn.id, "read timeout probe failed, closing");
                        break;
                    }
                    continue;
                };
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        handle_frame(&state, &conn, &sink, &mut forwarders, &text).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        conn.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    for channel in conn.subscribed_channels() {
        state.presence.remove_presence(&channel, &conn.id);
    }
    for (_, (sub_id, cancel)) in forwarders.drain() {
        cancel.cancel();
        state.pubsub.unsubscribe(sub_id).await;
    }
    state.connections.remove(&conn.id);
    info!(connection_id = %conn.id, "connection closed");
}

async fn handle_frame(
    state: &Arc<AppState>,
    conn: &Arc<crate::connection::Connection>,
    sink: &SharedSink,
    forwarders: &mut HashMap<String, (u64, CancellationToken)>,
    text: &str,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let msg = match parsed {
        Ok(m) => m,
        Err(e) => {
            send(sink, &ServerMessage::error("OPERATION_INVALID", format!("malformed frame: {e}"))).await;
            return;
        }
    };

    match msg {
        ClientMessage::Handshake => {
            send(sink, &ServerMessage::Handshake { protocol: 1, content_type: "json0".to_string(), id: conn.id.clone() }).await;
        }
        ClientMessage::Fetch { c, d, .. } => {
            handle_fetch(state, sink, c, d).await;
        }
        ClientMessage::Subscribe { c, d } => {
            handle_subscribe(state, conn, sink, forwarders, c, d).await;
        }
        ClientMessage::Unsubscribe { c, d } => {
            handle_unsubscribe(state, conn, forwarders, c, d).await;
            send(sink, &ServerMessage::Unsubscribe { c, d }).await;
        }
        ClientMessage::Op { c, d, v, mutation, src, seq } => {
            handle_op(state, sink, c, d, v, mutation, src, seq).await;
        }
        ClientMessage::Presence { c, d, presence } => {
            let channel = doc_channel(&c, &d);
            state.presence.submit(&channel, &conn.id, presence);
            let merged = state.presence.get_presences(&channel);
            let frame = ServerMessage::Presence { c: c.clone(), d: d.clone(), presence: merged };
            if let Ok(value) = serde_json::to_value(&frame) {
                publish_value(state, &channel, &value).await;
            }
        }
        ClientMessage::PresencePing => {
            send(sink, &ServerMessage::PresencePing).await;
        }
    }
}

async fn handle_fetch(state: &Arc<AppState>, sink: &SharedSink, c: String, d: String) {
    match state.store.get_snapshot(&c, &d).await {
        Ok(Some(snapshot)) => {
            send(sink, &ServerMessage::Fetch { c, d, data: snapshot }).await;
        }
        Ok(None) => {
            send(sink, &ServerMessage::Fetch { c, d: d.clone(), data: Snapshot::empty_skeleton(d) }).await;
        }
        Err(e) => {
            send(sink, &ServerMessage::error(e.code(), e.to_string())).await;
        }
    }
}

async fn handle_subscribe(
    state: &Arc<AppState>,
    conn: &Arc<crate::connection::Connection>,
    sink: &SharedSink,
    forwarders: &mut HashMap<String, (u64, CancellationToken)>,
    c: String,
    d: Option<String>,
) {
    let channel = d.as_deref().map(|doc_id| doc_channel(&c, doc_id)).unwrap_or_else(|| c.clone());

    let subscription = match state.pubsub.subscribe(&channel).await {
        Ok(s) => s,
        Err(e) => {
            send(sink, &ServerMessage::error("SERVER_ERROR", e.to_string())).await;
            return;
        }
    };
    let sub_id = subscription.id;
    let cancel = CancellationToken::new();
    spawn_forwarder(sink.clone(), subscription, cancel.clone());
    forwarders.insert(channel.clone(), (sub_id, cancel));
    conn.track_subscription(&channel);

    let (v, data) = if let Some(doc_id) = &d {
        match state.store.get_snapshot(&c, doc_id).await {
            Ok(snapshot) => {
                let (v, data) = subscribe_reply_fields(snapshot, doc_id);
                (v, Some(data))
            }
            Err(e) => {
                send(sink, &ServerMessage::error(e.code(), e.to_string())).await;
                return;
            }
        }
    } else {
        (0, None)
    };

    send(sink, &ServerMessage::Subscribe { c, d, v, data }).await;
}

/// The `v`/`data` pair for a subscribe reply: the real snapshot's version
/// and inner data payload, or the `{data:{}}`/`v:0` skeleton when no
/// snapshot exists yet (subscribe-before-create, spec.md S2).
fn subscribe_reply_fields(snapshot: Option<Snapshot>, doc_id: &str) -> (i64, serde_json::Value) {
    match snapshot {
        Some(s) => (s.version, s.data),
        None => {
            let skeleton = Snapshot::empty_skeleton(doc_id.to_string());
            (skeleton.version, skeleton.data)
        }
    }
}

async fn handle_unsubscribe(
    state: &Arc<AppState>,
    conn: &Arc<crate::connection::Connection>,
    forwarders: &mut HashMap<String, (u64, CancellationToken)>,
    c: String,
    d: Option<String>,
) {
    let channel = d.as_deref().map(|doc_id| doc_channel(&c, doc_id)).unwrap_or_else(|| c.clone());
    if let Some((sub_id, cancel)) = forwarders.remove(&channel) {
        cancel.cancel();
        state.pubsub.unsubscribe(sub_id).await;
    }
    conn.untrack_subscription(&channel);
}

async fn handle_op(
    state: &Arc<AppState>,
    sink: &SharedSink,
    c: String,
    d: String,
    v: i64,
    mutation: OpMutation,
    src: Option<String>,
    seq: Option<i64>,
) {
    let kind = match classify_mutation(&mutation) {
        Ok(kind) => kind,
        Err(message) => {
            send(sink, &ServerMessage::error("OPERATION_INVALID", message)).await;
            return;
        }
    };

    let op = Operation {
        kind,
        collection: c.clone(),
        doc_id: d.clone(),
        version: v,
        op: mutation.op.clone(),
        create: mutation.create.clone(),
        del: mutation.del,
        src: src.clone(),
        seq,
    };

    if let Err(e) = state.submit_chain.run(&op).await {
        metrics::counter!("ops_rejected_total").increment(1);
        send(sink, &ServerMessage::error(e.code(), e.to_string())).await;
        return;
    }

    metrics::counter!("ops_submitted_total").increment(1);

    let frame = ServerMessage::Op { c: c.clone(), d: d.clone(), v, mutation, src, seq };
    let Ok(value) = serde_json::to_value(&frame) else { return };

    // Acknowledge directly to the submitter, then fan out to every
    // subscriber (which may include the submitter again, if it is also
    // subscribed to this channel — a client reconciles its own echo via
    // `src`/`seq`, the same as the wire protocol these frames model).
    send(sink, &frame).await;
    for channel in op.channels() {
        publish_value(state, &channel, &value).await;
    }

    // The business-event bus itself is out of scope for this core; logging
    // the converted events here is the stand-in hand-off point a real
    // consumer would subscribe to.
    for event in crate::events::EventConverter::convert_all(&op) {
        debug!(?event, "converted business event");
    }
}

/// Classifies an `op` frame's mutation, rejecting empty op arrays ahead of
/// the exactly-one-of-`op`/`create`/`del` check.
fn classify_mutation(mutation: &OpMutation) -> Result<OperationKind, &'static str> {
    if matches!(&mutation.op, Some(ops) if ops.is_empty()) {
        return Err("op list must not be empty");
    }
    match (&mutation.op, &mutation.create, mutation.del) {
        (Some(_), None, None) => Ok(OperationKind::Edit),
        (None, Some(_), None) => Ok(OperationKind::Create),
        (None, None, Some(true)) => Ok(OperationKind::Delete),
        _ => Err("op must populate exactly one of op, create, del"),
    }
}

fn spawn_forwarder(sink: SharedSink, mut subscription: crate::pubsub::Subscription, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = subscription.rx.recv() => {
                    match next {
                        Some(msg) => {
                            let Ok(text) = serde_json::to_string(&msg.payload) else { continue };
                            let mut guard = sink.lock().await;
                            if guard.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
}

impl From<CoreError> for ServerMessage {
    fn from(e: CoreError) -> Self {
        ServerMessage::error(e.code(), e.to_string())
    }
}
