//! Subscriptions to the daemon's websocket event streams.
//!
//! The listener opens one socket per subscription (txs and new block
//! headers) so the two channels it hands out are genuinely independent: a
//! consumer sitting on one stream can never stall delivery on the other.
//! Each socket has a pump task that parses incoming JSON-RPC envelopes and
//! forwards them on its channel.
//!
//! Transient connect and read errors are retried with bounded exponential
//! backoff. Exhausting the retry budget is terminal: the error goes to the
//! shared errors channel and the affected event channel closes. Consumers
//! treat a closed channel like cancellation.

use std::{collections::HashMap, time::Duration};

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{config::Config, error::Error};

const TX_QUERY: &str = "tm.event='Tx'";
const HEADER_QUERY: &str = "tm.event='NewBlockHeader'";

const EVENT_BUFFER: usize = 64;
const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(8);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A raw event from the tx stream: the attribute map emitted by the daemon.
#[derive(Debug, Clone, Default)]
pub struct TxEvent {
    pub events: HashMap<String, Vec<String>>,
}

/// A raw event from the header stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEvent {
    pub height: u64,
}

/// The two per-incarnation event channels handed out at start.
pub struct EventStreams {
    pub headers: mpsc::Receiver<HeaderEvent>,
    pub txs: mpsc::Receiver<TxEvent>,
}

/// Connection parameters for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Websocket URL of the daemon's RPC event endpoint.
    pub url: url::Url,
    /// Maximum resubscription attempts per incident before giving up.
    pub max_reconnect_attempts: u32,
    /// Initial delay between resubscription attempts; doubles per attempt.
    pub reconnect_delay: Duration,
}

impl ListenerConfig {
    pub fn new(url: url::Url) -> Self {
        Self {
            url,
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

impl From<&Config> for ListenerConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.node_rpc.clone())
    }
}

/// Live subscriptions to the daemon's tx and header streams.
pub struct EventListener {
    token: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

impl EventListener {
    /// Connect, subscribe to both event types, and start the pump tasks.
    pub async fn start(
        config: ListenerConfig,
        errors: mpsc::Sender<Error>,
    ) -> Result<(Self, EventStreams), Error> {
        let token = CancellationToken::new();

        let header_socket = initial_connect(&config, HEADER_QUERY, &token).await?;
        let tx_socket = initial_connect(&config, TX_QUERY, &token).await?;

        let (header_tx, header_rx) = mpsc::channel(EVENT_BUFFER);
        let (tx_tx, tx_rx) = mpsc::channel(EVENT_BUFFER);

        let pumps = vec![
            tokio::spawn(pump(
                config.clone(),
                HEADER_QUERY,
                header_socket,
                token.clone(),
                EventSink::Headers(header_tx),
                errors.clone(),
            )),
            tokio::spawn(pump(
                config,
                TX_QUERY,
                tx_socket,
                token.clone(),
                EventSink::Txs(tx_tx),
                errors,
            )),
        ];

        Ok((
            Self { token, pumps },
            EventStreams {
                headers: header_rx,
                txs: tx_rx,
            },
        ))
    }

    /// Unsubscribe and close the sockets.
    pub async fn stop(mut self) {
        self.token.cancel();
        for pump in std::mem::take(&mut self.pumps) {
            let _ = pump.await;
        }
    }

    /// Tear this listener down and start a fresh one.
    ///
    /// Used after each upgrade: the daemon's RPC endpoint has cycled with
    /// the child, so prior subscriptions are gone.
    pub async fn reset(
        self,
        config: ListenerConfig,
        errors: mpsc::Sender<Error>,
    ) -> Result<(Self, EventStreams), Error> {
        self.stop().await;
        Self::start(config, errors).await
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum EventSink {
    Headers(mpsc::Sender<HeaderEvent>),
    Txs(mpsc::Sender<TxEvent>),
}

impl EventSink {
    /// Forward a parsed event; `Err` means the receiver is gone.
    async fn deliver(&self, event: NodeEvent) -> Result<(), ()> {
        match (self, event) {
            (Self::Headers(sender), NodeEvent::Header(event)) => {
                sender.send(event).await.map_err(|_| ())
            }
            (Self::Txs(sender), NodeEvent::Tx(event)) => sender.send(event).await.map_err(|_| ()),
            // an event of the other kind on this subscription is dropped
            _ => Ok(()),
        }
    }
}

enum PumpExit {
    Cancelled,
    ChannelClosed,
    Stream(String),
}

async fn pump(
    config: ListenerConfig,
    query: &'static str,
    mut socket: Socket,
    token: CancellationToken,
    sink: EventSink,
    errors: mpsc::Sender<Error>,
) {
    loop {
        match pump_socket(&mut socket, &token, &sink).await {
            PumpExit::Cancelled | PumpExit::ChannelClosed => {
                let _ = socket.close(None).await;
                return;
            }
            PumpExit::Stream(reason) => {
                warn!(query, error = %reason, "event stream interrupted, resubscribing");
                match reconnect(&config, query, &token).await {
                    Ok(next) => socket = next,
                    Err(err) => {
                        if !token.is_cancelled() {
                            let _ = errors.send(err).await;
                        }
                        // dropping the sink closes the event channel
                        return;
                    }
                }
            }
        }
    }
}

async fn pump_socket(socket: &mut Socket, token: &CancellationToken, sink: &EventSink) -> PumpExit {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return PumpExit::Cancelled,
            message = socket.next() => message,
        };
        let message = match message {
            None => return PumpExit::Stream("connection closed".to_string()),
            Some(Err(err)) => return PumpExit::Stream(err.to_string()),
            Some(Ok(message)) => message,
        };
        match message {
            Message::Text(raw) => match parse_envelope(raw.as_str()) {
                Ok(Some(event)) => {
                    // the send races cancellation so a stopped listener never
                    // hangs behind a full channel
                    tokio::select! {
                        _ = token.cancelled() => return PumpExit::Cancelled,
                        delivered = sink.deliver(event) => if delivered.is_err() {
                            return PumpExit::ChannelClosed;
                        },
                    }
                }
                Ok(None) => {}
                Err(reason) => return PumpExit::Stream(reason),
            },
            Message::Ping(payload) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    return PumpExit::Stream("failed to answer ping".to_string());
                }
            }
            Message::Close(_) => return PumpExit::Stream("server closed the subscription".to_string()),
            _ => {}
        }
    }
}

async fn reconnect(
    config: &ListenerConfig,
    query: &str,
    token: &CancellationToken,
) -> Result<Socket, Error> {
    let mut delay = config.reconnect_delay;
    for attempt in 1..=config.max_reconnect_attempts {
        tokio::select! {
            _ = token.cancelled() => {
                return Err(Error::Subscription("listener stopped".to_string()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
        match connect_and_subscribe(config.url.as_str(), query).await {
            Ok(socket) => {
                debug!(query, attempt, "resubscribed to daemon events");
                return Ok(socket);
            }
            Err(err) => {
                warn!(query, attempt, error = %err, "resubscribe attempt failed");
                delay = (delay * 2).min(RECONNECT_DELAY_CAP);
            }
        }
    }
    Err(Error::Subscription(format!(
        "{query} stream unavailable after {} attempts",
        config.max_reconnect_attempts
    )))
}

async fn initial_connect(
    config: &ListenerConfig,
    query: &'static str,
    token: &CancellationToken,
) -> Result<Socket, Error> {
    match connect_and_subscribe(config.url.as_str(), query).await {
        Ok(socket) => Ok(socket),
        Err(err) => {
            warn!(query, error = %err, "initial subscription failed, retrying");
            reconnect(config, query, token).await
        }
    }
}

async fn connect_and_subscribe(url: &str, query: &str) -> Result<Socket, Error> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|err| Error::Subscription(format!("connecting to {url}: {err}")))?;
    let request = json!({
        "jsonrpc": "2.0",
        "method": "subscribe",
        "id": 0,
        "params": { "query": query },
    });
    socket
        .send(Message::Text(request.to_string().into()))
        .await
        .map_err(|err| Error::Subscription(format!("subscribing to {query}: {err}")))?;
    Ok(socket)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<EnvelopeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResult {
    #[serde(default)]
    data: Option<EventData>,
    #[serde(default)]
    events: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
}

enum NodeEvent {
    Header(HeaderEvent),
    Tx(TxEvent),
}

/// Parse one JSON-RPC frame. `Ok(None)` is a subscription ack or an event
/// type this listener does not care about.
fn parse_envelope(raw: &str) -> Result<Option<NodeEvent>, String> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|err| format!("malformed event envelope: {err}"))?;
    if let Some(error) = envelope.error {
        return Err(format!("subscription error from the daemon: {error}"));
    }
    let Some(result) = envelope.result else {
        return Ok(None);
    };
    let Some(data) = result.data else {
        // empty result object acknowledging the subscribe call
        return Ok(None);
    };
    match data.kind.rsplit('/').next() {
        Some("NewBlockHeader") => {
            let height = header_height(&data.value)
                .ok_or_else(|| format!("header event without a height: {}", data.value))?;
            Ok(Some(NodeEvent::Header(HeaderEvent { height })))
        }
        Some("Tx") => Ok(Some(NodeEvent::Tx(TxEvent {
            events: result.events.unwrap_or_default(),
        }))),
        _ => {
            debug!(kind = %data.kind, "ignoring unrecognized event type");
            Ok(None)
        }
    }
}

/// The daemon encodes heights as decimal strings; tolerate plain numbers too.
fn header_height(value: &serde_json::Value) -> Option<u64> {
    match value.get("header")?.get("height")? {
        serde_json::Value::String(raw) => raw.parse().ok(),
        other => other.as_u64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::{net::TcpListener, sync::broadcast, time::timeout};

    #[test]
    fn test_parse_subscription_ack() {
        let raw = r#"{"jsonrpc":"2.0","id":0,"result":{}}"#;
        assert!(parse_envelope(raw).unwrap().is_none());
    }

    #[test]
    fn test_parse_header_event_string_height() {
        let raw = r#"{
            "jsonrpc":"2.0","id":0,
            "result":{
                "query":"tm.event='NewBlockHeader'",
                "data":{"type":"tendermint/event/NewBlockHeader","value":{"header":{"height":"50"}}}
            }
        }"#;
        match parse_envelope(raw).unwrap() {
            Some(NodeEvent::Header(header)) => assert_eq!(header.height, 50),
            _ => panic!("expected a header event"),
        }
    }

    #[test]
    fn test_parse_header_event_numeric_height() {
        let raw = r#"{"result":{"data":{"type":"x/NewBlockHeader","value":{"header":{"height":7}}}}}"#;
        match parse_envelope(raw).unwrap() {
            Some(NodeEvent::Header(header)) => assert_eq!(header.height, 7),
            _ => panic!("expected a header event"),
        }
    }

    #[test]
    fn test_parse_tx_event_attributes() {
        let raw = r#"{
            "result":{
                "data":{"type":"tendermint/event/Tx","value":{}},
                "events":{"upgrade.action":["name=v2,height=50"],"tx.height":["48"]}
            }
        }"#;
        match parse_envelope(raw).unwrap() {
            Some(NodeEvent::Tx(tx)) => {
                assert_eq!(tx.events["upgrade.action"], vec!["name=v2,height=50"]);
                assert_eq!(tx.events["tx.height"], vec!["48"]);
            }
            _ => panic!("expected a tx event"),
        }
    }

    #[test]
    fn test_parse_header_without_height_is_an_error() {
        let raw = r#"{"result":{"data":{"type":"x/NewBlockHeader","value":{}}}}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn test_parse_daemon_error_frame() {
        let raw = r#"{"jsonrpc":"2.0","id":0,"error":{"code":-32603,"message":"no such query"}}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn test_parse_ignores_unknown_event_type() {
        let raw = r#"{"result":{"data":{"type":"tendermint/event/ValidatorSetUpdates","value":{}}}}"#;
        assert!(parse_envelope(raw).unwrap().is_none());
    }

    /// In-process websocket server: acks subscribe calls and forwards frames
    /// published for the matching query.
    struct TestNode {
        addr: std::net::SocketAddr,
        frames: broadcast::Sender<(String, String)>,
        subscriptions: Arc<AtomicUsize>,
        accept_task: JoinHandle<()>,
    }

    impl TestNode {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (frames, _) = broadcast::channel::<(String, String)>(256);
            let subscriptions = Arc::new(AtomicUsize::new(0));

            let frames_for_accept = frames.clone();
            let subscriptions_for_accept = subscriptions.clone();
            let accept_task = tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let mut frames = frames_for_accept.subscribe();
                    let subscriptions = subscriptions_for_accept.clone();
                    tokio::spawn(async move {
                        let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                            return;
                        };
                        let mut query = String::new();
                        loop {
                            tokio::select! {
                                incoming = socket.next() => match incoming {
                                    Some(Ok(Message::Text(raw))) => {
                                        let request: serde_json::Value =
                                            serde_json::from_str(raw.as_str()).unwrap();
                                        query = request["params"]["query"]
                                            .as_str()
                                            .unwrap_or_default()
                                            .to_string();
                                        let ack = json!({
                                            "jsonrpc": "2.0",
                                            "id": request["id"],
                                            "result": {},
                                        });
                                        if socket.send(Message::Text(ack.to_string().into())).await.is_err() {
                                            return;
                                        }
                                        subscriptions.fetch_add(1, Ordering::SeqCst);
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = socket.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => return,
                                },
                                frame = frames.recv() => match frame {
                                    Ok((target, frame)) => {
                                        if target == query
                                            && socket.send(Message::Text(frame.into())).await.is_err()
                                        {
                                            return;
                                        }
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                    Err(broadcast::error::RecvError::Closed) => return,
                                },
                            }
                        }
                    });
                }
            });

            Self {
                addr,
                frames,
                subscriptions,
                accept_task,
            }
        }

        fn config(&self) -> ListenerConfig {
            let url = url::Url::parse(&format!("ws://{}", self.addr)).unwrap();
            ListenerConfig {
                url,
                max_reconnect_attempts: 2,
                reconnect_delay: Duration::from_millis(50),
            }
        }

        fn publish_header(&self, height: u64) {
            let frame = json!({
                "jsonrpc": "2.0",
                "id": 0,
                "result": {
                    "query": HEADER_QUERY,
                    "data": {
                        "type": "tendermint/event/NewBlockHeader",
                        "value": { "header": { "height": height.to_string() } },
                    },
                },
            });
            let _ = self.frames.send((HEADER_QUERY.to_string(), frame.to_string()));
        }

        fn publish_tx(&self, action: &str) {
            let frame = json!({
                "jsonrpc": "2.0",
                "id": 0,
                "result": {
                    "query": TX_QUERY,
                    "data": { "type": "tendermint/event/Tx", "value": {} },
                    "events": { "upgrade.action": [action] },
                },
            });
            let _ = self.frames.send((TX_QUERY.to_string(), frame.to_string()));
        }

        /// Abort the accept loop and drop the frame sender, which ends every
        /// connection task and closes its socket.
        fn shut_down(self) {
            self.accept_task.abort();
        }
    }

    async fn wait_for_subscriptions(node: &TestNode, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while node.subscriptions.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener should subscribe");
    }

    #[tokio::test]
    async fn test_listener_demuxes_streams() {
        let node = TestNode::start().await;
        let (errors_tx, _errors_rx) = mpsc::channel(1);

        let (listener, mut streams) = EventListener::start(node.config(), errors_tx).await.unwrap();
        wait_for_subscriptions(&node, 2).await;

        node.publish_header(1);
        node.publish_tx("name=v2,height=50");
        node.publish_header(2);

        let header = timeout(Duration::from_secs(5), streams.headers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.height, 1);

        let tx = timeout(Duration::from_secs(5), streams.txs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.events["upgrade.action"], vec!["name=v2,height=50"]);

        let header = timeout(Duration::from_secs(5), streams.headers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.height, 2);

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_reset_behaves_like_a_fresh_listener() {
        let node = TestNode::start().await;
        let (errors_tx, _errors_rx) = mpsc::channel(1);

        let (listener, mut streams) =
            EventListener::start(node.config(), errors_tx.clone()).await.unwrap();
        wait_for_subscriptions(&node, 2).await;
        node.publish_header(1);
        assert_eq!(
            timeout(Duration::from_secs(5), streams.headers.recv())
                .await
                .unwrap()
                .unwrap()
                .height,
            1
        );

        let (listener, mut streams) = listener.reset(node.config(), errors_tx).await.unwrap();
        wait_for_subscriptions(&node, 4).await;

        node.publish_header(2);
        assert_eq!(
            timeout(Duration::from_secs(5), streams.headers.recv())
                .await
                .unwrap()
                .unwrap()
                .height,
            2
        );

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_terminal_failure_reports_error_and_closes_channels() {
        let node = TestNode::start().await;
        let (errors_tx, mut errors_rx) = mpsc::channel(4);

        let config = node.config();
        let (listener, mut streams) = EventListener::start(config, errors_tx).await.unwrap();
        wait_for_subscriptions(&node, 2).await;

        node.shut_down();

        let err = timeout(Duration::from_secs(10), errors_rx.recv())
            .await
            .expect("terminal error within the retry budget")
            .unwrap();
        assert!(matches!(err, Error::Subscription(_)));

        // the failed stream's channel closes once its pump gives up
        timeout(Duration::from_secs(10), async {
            loop {
                match streams.headers.recv().await {
                    Some(_) => continue,
                    None => break,
                }
            }
        })
        .await
        .expect("header channel should close");

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_clean_while_idle() {
        let node = TestNode::start().await;
        let (errors_tx, mut errors_rx) = mpsc::channel(1);

        let (listener, _streams) = EventListener::start(node.config(), errors_tx).await.unwrap();
        listener.stop().await;
        assert!(errors_rx.try_recv().is_err());
    }
}
