use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::context::LiveConnection;
use crate::dispatch::{DispatchEngine, ScheduleOptions};
use crate::pubsub::PubSubLayer;
use crate::registry::JsonMap;
use crate::store::SubscriptionStore;

const WINDOW_KEY_LEN: usize = 32;
const WINDOW_KEY_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// A signal call sent by a browser. Anything else on the wire is logged and
/// ignored; a websocket client never receives error frames.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    signal: String,
    #[serde(default)]
    opts: JsonMap,
    #[serde(default)]
    eta: Option<u64>,
    #[serde(default)]
    expires: Option<u64>,
    #[serde(default)]
    countdown: Option<u64>,
}

impl InboundFrame {
    fn schedule(&self) -> ScheduleOptions {
        ScheduleOptions {
            countdown: self.countdown,
            eta: self.eta,
            expires: self.expires,
        }
    }
}

/// Websocket front door: attaches each connection to its window's topic set
/// and relays published frames out, inbound frames into the engine.
pub struct Gateway {
    config: GatewayConfig,
    engine: Arc<DispatchEngine>,
    store: Arc<SubscriptionStore>,
    pubsub: Arc<dyn PubSubLayer>,
}

struct ConnectionState {
    config: GatewayConfig,
    engine: Arc<DispatchEngine>,
    store: Arc<SubscriptionStore>,
    pubsub: Arc<dyn PubSubLayer>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        engine: Arc<DispatchEngine>,
        store: Arc<SubscriptionStore>,
        pubsub: Arc<dyn PubSubLayer>,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            pubsub,
        }
    }

    pub async fn run_forever(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("failed binding gateway listener on {}", self.config.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("gateway listening on ws://{bound_addr}");

        let state = Arc::new(ConnectionState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            store: self.store.clone(),
            pubsub: self.pubsub.clone(),
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state).await {
                                    warn!("gateway connection failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("gateway accept failed: {err}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    state: Arc<ConnectionState>,
) -> Result<()> {
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut query_key: Option<String> = None;
    let upgrade = accept_hdr_async(stream, |req: &Request, resp: Response| {
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_owned());
            }
        }
        query_key = req.uri().query().and_then(|query| query_param(query, "key"));
        Ok::<Response, ErrorResponse>(resp)
    });
    let ws = timeout(
        Duration::from_millis(state.config.handshake_timeout_ms.max(500)),
        upgrade,
    )
    .await
    .context("websocket handshake timed out")?
    .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;

    let window_key = resolve_window_key(&headers, query_key);
    let live = LiveConnection {
        window_key: window_key.clone(),
        headers,
        identity: None,
        language_code: None,
    };
    let ctx = state.engine.core().pipeline().from_live(&live);

    let topic_keys = match state.store.get_topics(&window_key).await {
        Ok(topic_keys) => topic_keys,
        Err(err) => {
            warn!("failed reading topics for window {window_key}: {err:#}");
            Vec::new()
        }
    };
    info!(
        "window {window_key} connected from {remote_addr} with {} topics",
        topic_keys.len()
    );
    let mut topic_rx = state.pubsub.subscribe(topic_keys).await?;

    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) =
        mpsc::channel::<Message>(state.config.outbound_queue_capacity.max(8));
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });
    let relay_tx = out_tx.clone();
    let relay = tokio::spawn(async move {
        while let Some(message) = topic_rx.recv().await {
            if relay_tx.send(Message::Text(message.payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(item) = read.next().await {
        match classify_inbound(item, &window_key) {
            Inbound::Call(frame) => {
                debug!("window {window_key} calls signal {:?}", frame.signal);
                let schedule = frame.schedule();
                let InboundFrame { signal, opts, .. } = frame;
                if let Err(err) = state
                    .engine
                    .trigger_from_client(Some(&ctx), &signal, opts, schedule)
                    .await
                {
                    warn!("client call to {signal:?} from window {window_key} failed: {err}");
                }
            }
            Inbound::Reply(message) => {
                let _ = out_tx.try_send(message);
            }
            Inbound::Closed => break,
            Inbound::Skip => {}
        }
    }

    info!("window {window_key} disconnected");
    relay.abort();
    let _ = relay.await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// What to do with one item off the websocket read stream. A transport error
/// ends the session exactly like a close frame, so the loop always falls
/// through to the writer/relay teardown below it.
enum Inbound {
    Call(InboundFrame),
    Reply(Message),
    Closed,
    Skip,
}

fn classify_inbound(item: Result<Message, WsError>, window_key: &str) -> Inbound {
    match item {
        Ok(Message::Text(text)) => match serde_json::from_str(&text) {
            Ok(frame) => Inbound::Call(frame),
            Err(err) => {
                warn!("invalid frame from window {window_key}: {err}");
                Inbound::Skip
            }
        },
        Ok(Message::Ping(payload)) => Inbound::Reply(Message::Pong(payload)),
        Ok(Message::Close(_)) => Inbound::Closed,
        Ok(Message::Binary(_) | Message::Pong(_) | Message::Frame(_)) => Inbound::Skip,
        Err(err) => {
            warn!("websocket read from window {window_key} failed: {err}");
            Inbound::Closed
        }
    }
}

/// Window key precedence: explicit header, then the `key` query parameter,
/// then the `wskey` cookie, else a freshly minted key. A minted key has no
/// stored topic set, so the connection only ever sees what it subscribes to
/// later.
fn resolve_window_key(headers: &HashMap<String, String>, query_key: Option<String>) -> String {
    if let Some(key) = headers.get("x-window-key").filter(|key| !key.is_empty()) {
        return key.clone();
    }
    if let Some(key) = query_key.filter(|key| !key.is_empty()) {
        return key;
    }
    if let Some(key) = headers
        .get("cookie")
        .and_then(|cookies| cookie_value(cookies, "wskey"))
    {
        return key;
    }
    mint_window_key()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_owned())
    })
}

fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_owned())
    })
}

fn mint_window_key() -> String {
    let mut rng = rand::thread_rng();
    (0..WINDOW_KEY_LEN)
        .map(|_| WINDOW_KEY_CHARSET[rng.gen_range(0..WINDOW_KEY_CHARSET.len())] as char)
        .collect()
}
