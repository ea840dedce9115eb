//! Relay frontend: the NIP-01 ingest/query loop.
//!
//! One port serves everything: WebSocket upgrades speak the relay
//! protocol, plain GETs receive the relay information document, and
//! `/healthz` answers monitors. Accepted events go to the store, the
//! live subscribers, and (when seeding is enabled) the seeding queue.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::event::{verify_event, Event};
use crate::queue::SeedingQueue;
use crate::server::{healthz, relay_info, RelayInfo};
use crate::store::{Filter, RelayStore};

/// Shared state behind every relay connection.
#[derive(Clone)]
pub struct WsState {
    pub store: RelayStore,
    pub info: RelayInfo,
    /// When set, only these pubkeys may publish.
    pub whitelist: Option<HashSet<String>>,
    /// Background seeding, absent when the bridge is disabled.
    pub queue: Option<Arc<SeedingQueue>>,
    /// Live fan-out of freshly inserted events.
    pub live: broadcast::Sender<Event>,
}

impl WsState {
    pub fn new(
        store: RelayStore,
        info: RelayInfo,
        whitelist: Option<HashSet<String>>,
        queue: Option<Arc<SeedingQueue>>,
    ) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            store,
            info,
            whitelist,
            queue,
            live,
        }
    }
}

/// Build the single-port router: relay protocol on upgrade, info
/// document otherwise.
pub fn app(state: WsState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the relay until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: WsState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn root(State(state): State<WsState>, upgrade: Option<WebSocketUpgrade>) -> Response {
    match upgrade {
        Some(ws) => ws
            .on_upgrade(move |socket| async move { process(socket, state).await })
            .into_response(),
        None => relay_info(&state.info).into_response(),
    }
}

/// Per-connection protocol loop.
async fn process(mut socket: WebSocket, state: WsState) {
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    let mut live = state.live.subscribe();
    loop {
        tokio::select! {
            incoming = socket.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                if let Message::Text(txt) = msg {
                    if handle_frame(&txt, &state, &mut socket, &mut subs).await.is_err() {
                        break;
                    }
                }
            }
            pushed = live.recv() => {
                let ev = match pushed {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                for (sub, filters) in &subs {
                    if filters.iter().any(|f| f.matches(&ev)) {
                        let frame = json!(["EVENT", sub, ev]).to_string();
                        if socket.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    txt: &str,
    state: &WsState,
    socket: &mut WebSocket,
    subs: &mut HashMap<String, Vec<Filter>>,
) -> std::result::Result<(), axum::Error> {
    let val = match serde_json::from_str::<Value>(txt) {
        Ok(val) => val,
        Err(_) => return Ok(()),
    };
    let arr = match val.as_array() {
        Some(arr) => arr,
        None => return Ok(()),
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 2 => {
            let ev = match serde_json::from_value::<Event>(arr[1].clone()) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::debug!("unparseable EVENT frame: {e}");
                    return Ok(());
                }
            };
            let (accepted, reason) = ingest(state, &ev);
            let ack = json!(["OK", ev.id, accepted, reason]).to_string();
            socket.send(Message::Text(ack)).await?;
        }
        Some("REQ") if arr.len() >= 3 => {
            let sub = arr[1].as_str().unwrap_or_default().to_string();
            let filters: Vec<Filter> = arr[2..].iter().map(Filter::from_value).collect();
            for filter in &filters {
                if filter.limit == Some(0) {
                    continue;
                }
                match state.store.query_events(filter) {
                    Ok(events) => {
                        for ev in events {
                            let frame = json!(["EVENT", sub, ev]).to_string();
                            socket.send(Message::Text(frame)).await?;
                        }
                    }
                    Err(e) => tracing::warn!("stored query failed: {e}"),
                }
            }
            let eose = json!(["EOSE", sub]).to_string();
            socket.send(Message::Text(eose)).await?;
            subs.insert(sub, filters);
        }
        Some("CLOSE") if arr.len() >= 2 => {
            if let Some(sub) = arr[1].as_str() {
                subs.remove(sub);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Apply policy and persist. Returns the OK-frame payload.
fn ingest(state: &WsState, ev: &Event) -> (bool, String) {
    if let Some(whitelist) = &state.whitelist {
        if !whitelist.contains(&ev.pubkey) {
            return (false, "blocked: pubkey not allowed".into());
        }
    }
    if let Err(e) = verify_event(ev) {
        return (false, format!("invalid: {e}"));
    }
    match state.store.save_event(ev) {
        Ok(inserted) => {
            if inserted > 0 {
                if let Some(queue) = &state.queue {
                    queue.submit(ev.clone());
                }
                let _ = state.live.send(ev.clone());
            }
            (true, String::new())
        }
        Err(e) => {
            tracing::warn!(id = %ev.id, "save failed: {e}");
            (false, format!("error: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::signed_event;
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::Message as TungMessage;

    async fn start(state: WsState) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::serve(listener, app(state).into_make_service());
        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });
        (format!("ws://{addr}/"), handle)
    }

    fn plain_state() -> WsState {
        WsState::new(
            RelayStore::memory().unwrap(),
            RelayInfo::default(),
            None,
            None,
        )
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                TungMessage::Text(txt) => return serde_json::from_str(&txt).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn event_is_acked_and_queryable() {
        let state = plain_state();
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let ev = signed_event(1, "hello relay");
        ws.send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let ack = next_text(&mut ws).await;
        assert_eq!(ack[0], "OK");
        assert_eq!(ack[1], ev.id);
        assert_eq!(ack[2], true);

        let req = json!(["REQ", "s", {"authors": [ev.pubkey], "kinds": [1]}]);
        ws.send(TungMessage::Text(req.to_string())).await.unwrap();
        let frame = next_text(&mut ws).await;
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[2]["id"], ev.id);
        let eose = next_text(&mut ws).await;
        assert_eq!(eose[0], "EOSE");
        handle.abort();
    }

    #[tokio::test]
    async fn invalid_signature_is_nacked() {
        let state = plain_state();
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let mut ev = signed_event(1, "forged");
        ev.sig = "00".repeat(64);
        ws.send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let ack = next_text(&mut ws).await;
        assert_eq!(ack[2], false);
        assert!(ack[3].as_str().unwrap().starts_with("invalid:"));
        handle.abort();
    }

    #[tokio::test]
    async fn whitelist_blocks_strangers() {
        let mut state = plain_state();
        state.whitelist = Some(HashSet::from(["f".repeat(64)]));
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let ev = signed_event(1, "not allowed");
        ws.send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let ack = next_text(&mut ws).await;
        assert_eq!(ack[2], false);
        assert!(ack[3].as_str().unwrap().starts_with("blocked:"));
        handle.abort();
    }

    #[tokio::test]
    async fn live_events_reach_matching_subscribers() {
        let state = plain_state();
        let (url, handle) = start(state).await;

        let (mut listener_ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let req = json!(["REQ", "live", {"kinds": [1]}]);
        listener_ws
            .send(TungMessage::Text(req.to_string()))
            .await
            .unwrap();
        let eose = next_text(&mut listener_ws).await;
        assert_eq!(eose[0], "EOSE");

        let (mut publisher_ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let ev = signed_event(1, "breaking news");
        publisher_ws
            .send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let _ack = next_text(&mut publisher_ws).await;

        let pushed = next_text(&mut listener_ws).await;
        assert_eq!(pushed[0], "EVENT");
        assert_eq!(pushed[1], "live");
        assert_eq!(pushed[2]["id"], ev.id);
        handle.abort();
    }

    #[tokio::test]
    async fn close_unregisters_subscription() {
        let state = plain_state();
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        let req = json!(["REQ", "s", {"kinds": [1]}]);
        ws.send(TungMessage::Text(req.to_string())).await.unwrap();
        let _eose = next_text(&mut ws).await;
        ws.send(TungMessage::Text(json!(["CLOSE", "s"]).to_string()))
            .await
            .unwrap();

        // republish from a second socket; nothing should be pushed
        let (mut other, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let ev = signed_event(1, "after close");
        other
            .send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let _ack = next_text(&mut other).await;

        let quiet = tokio::time::timeout(std::time::Duration::from_millis(150), ws.next()).await;
        assert!(quiet.is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn accepted_events_enter_seeding_queue() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let seeded = Arc::new(AtomicUsize::new(0));
        let seeded_clone = Arc::clone(&seeded);
        let queue = SeedingQueue::new(
            move |_| {
                let seeded = Arc::clone(&seeded_clone);
                async move {
                    seeded.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            crate::queue::SeedingQueueConfig {
                workers: 1,
                backoff_base: std::time::Duration::from_millis(5),
                ..Default::default()
            },
        );
        let state = WsState::new(
            RelayStore::memory().unwrap(),
            RelayInfo::default(),
            None,
            Some(Arc::clone(&queue)),
        );
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let ev = signed_event(1, "seed me");
        ws.send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let _ack = next_text(&mut ws).await;
        // duplicate insert is ignored and not re-queued
        ws.send(TungMessage::Text(json!(["EVENT", ev]).to_string()))
            .await
            .unwrap();
        let _ack = next_text(&mut ws).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(seeded.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let state = plain_state();
        let (url, handle) = start(state).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        ws.send(TungMessage::Text("not json".into())).await.unwrap();
        ws.send(TungMessage::Text("{}".into())).await.unwrap();
        let req = json!(["REQ", "s", {"limit": 0}]);
        ws.send(TungMessage::Text(req.to_string())).await.unwrap();
        let eose = next_text(&mut ws).await;
        assert_eq!(eose[0], "EOSE");
        handle.abort();
    }
}
