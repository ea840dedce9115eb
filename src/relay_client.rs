//! Relay egress: publish events and subscribe to filters over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;

/// Default deadline for one-shot relay operations.
pub const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a set of relays. Connections are opened per operation.
#[derive(Clone)]
pub struct RelayClient {
    relays: Vec<String>,
    tor_socks: Option<String>,
}

/// Handle to a long-lived subscription. Closing aborts the reader tasks
/// and drops their sockets.
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl RelayClient {
    pub fn new(relays: Vec<String>, tor_socks: Option<String>) -> Self {
        Self { relays, tor_socks }
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Send an event to every configured relay. Succeeds when at least one
    /// relay acks it within the window, returning that relay's OK reason.
    pub async fn publish(&self, ev: &Event) -> Result<String> {
        if self.relays.is_empty() {
            return Err(Error::nostr("no relays configured"));
        }
        let attempts = self.relays.iter().map(|relay| {
            let relay = relay.clone();
            let tor = self.tor_socks.clone();
            let ev = ev.clone();
            async move {
                match tokio::time::timeout(
                    ONE_SHOT_TIMEOUT,
                    publish_one(&relay, tor.as_deref(), &ev),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Timeout {
                        deadline: ONE_SHOT_TIMEOUT,
                    }),
                }
            }
        });
        let results = futures_util::future::join_all(attempts).await;
        let mut last_reason = String::new();
        for result in results {
            match result {
                Ok((true, reason)) => return Ok(reason),
                Ok((false, reason)) => last_reason = reason,
                Err(e) => tracing::debug!("relay publish attempt failed: {e}"),
            }
        }
        Err(Error::nostr(if last_reason.is_empty() {
            "no relay accepted the event".to_string()
        } else {
            format!("rejected: {last_reason}")
        }))
    }

    /// One-shot subscription: resolve with the first event matching
    /// `predicate`, or `None` once `timeout` elapses or every relay sends
    /// EOSE without a match.
    pub async fn await_event(
        &self,
        filter: Value,
        timeout: Duration,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Result<Option<Event>> {
        let predicate = Arc::new(predicate);
        let (tx, mut rx) = mpsc::channel::<Event>(8);
        let mut tasks = Vec::new();
        for relay in &self.relays {
            let relay = relay.clone();
            let tor = self.tor_socks.clone();
            let filter = filter.clone();
            let predicate = Arc::clone(&predicate);
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = stream_until_eose(&relay, tor.as_deref(), filter, |ev| {
                    if predicate(&ev) {
                        let _ = tx.try_send(ev);
                    }
                })
                .await
                {
                    tracing::debug!(relay = %relay, "one-shot subscription failed: {e}");
                }
            }));
        }
        drop(tx);
        let found = tokio::time::timeout(timeout, rx.recv()).await.unwrap_or(None);
        for task in tasks {
            task.abort();
        }
        Ok(found)
    }

    /// One-shot subscription collecting everything the relays hold for
    /// `filter`, deduplicated by event id.
    pub async fn fetch_events(&self, filter: Value, timeout: Duration) -> Result<Vec<Event>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut tasks = Vec::new();
        for relay in &self.relays {
            let relay = relay.clone();
            let tor = self.tor_socks.clone();
            let filter = filter.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = stream_until_eose(&relay, tor.as_deref(), filter, |ev| {
                    let _ = tx.send(ev);
                })
                .await
                {
                    tracing::debug!(relay = %relay, "fetch failed: {e}");
                }
            }));
        }
        drop(tx);
        let mut events = Vec::new();
        let collect = async {
            while let Some(ev) = rx.recv().await {
                if !events.iter().any(|e: &Event| e.id == ev.id) {
                    events.push(ev);
                }
            }
        };
        let _ = tokio::time::timeout(timeout, collect).await;
        for task in tasks {
            task.abort();
        }
        Ok(events)
    }

    /// Long-lived subscription delivering every matching event to
    /// `handler` until [`Subscription::close`].
    pub async fn subscribe(
        &self,
        filter: Value,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let handler = Arc::new(handler);
        let mut tasks = Vec::new();
        for relay in &self.relays {
            let relay = relay.clone();
            let tor = self.tor_socks.clone();
            let filter = filter.clone();
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                if let Err(e) =
                    stream_events(&relay, tor.as_deref(), filter, move |ev| handler(ev)).await
                {
                    tracing::debug!(relay = %relay, "subscription ended: {e}");
                }
            }));
        }
        Ok(Subscription { tasks })
    }
}

/// Send one event and wait for the matching OK frame.
async fn publish_one(relay: &str, tor_socks: Option<&str>, ev: &Event) -> Result<(bool, String)> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let frame = json!(["EVENT", ev]).to_string();
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| Error::nostr(format!("send failed: {e}")))?;
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| Error::nostr(format!("socket error: {e}")))?;
        if let Message::Text(txt) = msg {
            if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                if let Some(arr) = val.as_array() {
                    if arr.first().and_then(|v| v.as_str()) == Some("OK")
                        && arr.get(1).and_then(|v| v.as_str()) == Some(ev.id.as_str())
                    {
                        let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                        let reason = arr
                            .get(3)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        return Ok((accepted, reason));
                    }
                }
            }
        }
    }
    Err(Error::nostr("connection closed without ack"))
}

/// Subscribe and deliver EVENT frames until EOSE or close.
async fn stream_until_eose(
    relay: &str,
    tor_socks: Option<&str>,
    filter: Value,
    mut on_event: impl FnMut(Event),
) -> Result<()> {
    run_subscription(relay, tor_socks, filter, true, &mut on_event).await
}

/// Subscribe and deliver EVENT frames until the connection closes.
async fn stream_events(
    relay: &str,
    tor_socks: Option<&str>,
    filter: Value,
    mut on_event: impl FnMut(Event),
) -> Result<()> {
    run_subscription(relay, tor_socks, filter, false, &mut on_event).await
}

async fn run_subscription(
    relay: &str,
    tor_socks: Option<&str>,
    filter: Value,
    stop_at_eose: bool,
    on_event: &mut impl FnMut(Event),
) -> Result<()> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let req = json!(["REQ", "bridgr", filter]).to_string();
    ws.send(Message::Text(req))
        .await
        .map_err(|e| Error::nostr(format!("send failed: {e}")))?;
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| Error::nostr(format!("socket error: {e}")))? {
            Message::Text(txt) => {
                if let Ok(val) = serde_json::from_str::<Value>(&txt) {
                    if let Some(arr) = val.as_array() {
                        match arr.first().and_then(|v| v.as_str()) {
                            Some("EVENT") if arr.len() >= 3 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) {
                                    on_event(ev);
                                }
                            }
                            Some("EOSE") if stop_at_eose => break,
                            _ => {}
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
///
/// The underlying TCP stream may either be a direct `TcpStream` or a
/// `Socks5Stream` when routing through Tor. Boxing behind a trait object
/// lets callers treat both cases uniformly.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay).map_err(|e| Error::nostr(format!("bad relay url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::nostr("missing host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::nostr("missing port"))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::nostr(format!("bad request: {e}")))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host.as_str(), port))
                .await
                .map_err(|e| Error::nostr(format!("socks connect failed: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| Error::nostr(format!("connect failed: {e}")))?,
        )
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| Error::nostr(format!("handshake failed: {e}")))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::signed_event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    async fn spawn_relay(
        reply: impl Fn(Value) -> Vec<Value> + Send + 'static,
    ) -> (String, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let incoming: Value = serde_json::from_str(&txt).unwrap();
                    for frame in reply(incoming) {
                        ws.send(TMsg::Text(frame.to_string())).await.unwrap();
                    }
                }
            }
        });
        (format!("ws://{addr}"), handle)
    }

    #[tokio::test]
    async fn publish_succeeds_on_ok() {
        let ev = signed_event(1, "hi");
        let id = ev.id.clone();
        let (url, server) =
            spawn_relay(move |_| vec![json!(["OK", id, true, "stored"])]).await;
        let client = RelayClient::new(vec![url], None);
        let reason = client.publish(&ev).await.unwrap();
        assert_eq!(reason, "stored");
        server.abort();
    }

    #[tokio::test]
    async fn publish_fails_on_reject() {
        let ev = signed_event(1, "hi");
        let id = ev.id.clone();
        let (url, server) =
            spawn_relay(move |_| vec![json!(["OK", id, false, "blocked: policy"])]).await;
        let client = RelayClient::new(vec![url], None);
        let err = client.publish(&ev).await.unwrap_err();
        assert!(matches!(err, Error::Transport { kind: "nostr", .. }));
        assert!(err.to_string().contains("blocked: policy"));
        server.abort();
    }

    #[tokio::test]
    async fn publish_fails_with_no_relays() {
        let client = RelayClient::new(vec![], None);
        assert!(client.publish(&signed_event(1, "x")).await.is_err());
    }

    #[tokio::test]
    async fn publish_succeeds_if_any_relay_acks() {
        let ev = signed_event(1, "hi");
        let id = ev.id.clone();
        let (good, s1) = spawn_relay(move |_| vec![json!(["OK", id, true, ""])]).await;
        let client = RelayClient::new(vec!["ws://127.0.0.1:1".into(), good], None);
        client.publish(&ev).await.unwrap();
        s1.abort();
    }

    #[tokio::test]
    async fn await_event_returns_first_match() {
        let wanted = signed_event(30078, "magnet:?xt=urn:btih:aa");
        let noise = signed_event(30078, "not a magnet");
        let (url, server) = spawn_relay(move |req| {
            let sub = req[1].clone();
            vec![
                json!(["EVENT", sub, noise]),
                json!(["EVENT", sub, wanted]),
                json!(["EOSE", sub]),
            ]
        })
        .await;
        let client = RelayClient::new(vec![url], None);
        let found = client
            .await_event(
                json!({"kinds": [30078], "limit": 1}),
                Duration::from_secs(2),
                |ev| ev.content.starts_with("magnet:"),
            )
            .await
            .unwrap();
        assert!(found.unwrap().content.starts_with("magnet:"));
        server.abort();
    }

    #[tokio::test]
    async fn await_event_times_out_to_none() {
        let (url, server) = spawn_relay(|req| vec![json!(["EOSE", req[1]])]).await;
        let client = RelayClient::new(vec![url], None);
        let found = client
            .await_event(json!({}), Duration::from_millis(100), |_| true)
            .await
            .unwrap();
        assert!(found.is_none());
        server.abort();
    }

    #[tokio::test]
    async fn subscribe_delivers_and_close_stops() {
        let ev = signed_event(1, "live");
        let (url, server) = spawn_relay(move |req| {
            let sub = req[1].clone();
            vec![json!(["EOSE", sub.clone()]), json!(["EVENT", sub, ev])]
        })
        .await;
        let client = RelayClient::new(vec![url], None);
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let mut sub = client
            .subscribe(json!({"kinds": [1]}), |_| {
                SEEN.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(SEEN.load(Ordering::SeqCst), 1);
        sub.close();
        server.abort();
    }
}
