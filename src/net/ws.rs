// =============================================================================
// WebSocket session client — authenticate/subscribe protocol with a
// self-healing receive loop
// =============================================================================
//
// The RFC 6455 obligations (masked client frames, length encoding, handshake
// key/accept verification, ping/close semantics) are discharged by the
// tungstenite protocol layer underneath `connect_async`. This layer owns the
// session protocol: send auth and subscribe on connect, dispatch text frames
// to the registered callback, answer pings, and on close or transport error
// tear the connection down and rebuild it — short pause after a server close,
// longer pause after an error. The callback can never fail the loop; a false
// return is logged and ignored.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

/// Invoked for every received text frame. Returns false when the message was
/// not consumed; the loop logs and continues either way.
pub type MessageCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How often the receive loop wakes to sample the running flag while the
/// socket is quiet.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Session parameters for one symbol stream.
#[derive(Debug, Clone)]
pub struct WsSessionConfig {
    pub url: String,
    pub auth_key: String,
    /// Pause after a server close frame before reconnecting.
    pub reconnect_delay: Duration,
    /// Longer pause after a transport error before reconnecting.
    pub error_retry_delay: Duration,
}

/// Why a session ended.
enum SessionEnd {
    /// `stop_receive_loop` was observed; do not reconnect.
    Stopped,
    /// Server sent a close frame or the stream ended.
    Closed(String),
    /// Transport-level failure.
    Error(String),
}

pub struct WsClient {
    config: WsSessionConfig,
    subscription_params: Arc<Mutex<String>>,
    callback: Mutex<Option<MessageCallback>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsClient {
    pub fn new(config: WsSessionConfig) -> Self {
        Self {
            config,
            subscription_params: Arc::new(Mutex::new(String::new())),
            callback: Mutex::new(None),
            outbound_tx: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Register the text-frame callback. Must be called before
    /// [`start_receive_loop`]; later calls replace the callback for the next
    /// session.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Set the channel subscription (e.g. `"XAS.BTC-USD,XQ.BTC-USD"`). If the
    /// loop is live the subscribe message is sent immediately; the stored
    /// params are replayed on every reconnect.
    pub fn subscribe(&self, params: &str) {
        *self.subscription_params.lock() = params.to_string();
        self.send_message(subscribe_message(params));
    }

    /// Remove the current subscription from the live session.
    pub fn unsubscribe(&self) {
        let params = self.subscription_params.lock().clone();
        if !params.is_empty() {
            self.send_message(unsubscribe_message(&params));
        }
        self.subscription_params.lock().clear();
    }

    /// Queue a raw text message for the live session. Dropped with a debug
    /// log when no session is active.
    pub fn send_message(&self, text: String) {
        if let Some(tx) = self.outbound_tx.lock().as_ref() {
            if tx.send(text).is_ok() {
                return;
            }
        }
        debug!("websocket send skipped, no active session");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the receive loop. Idempotent while a loop is running.
    pub fn start_receive_loop(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound_tx.lock() = Some(tx);

        let config = self.config.clone();
        let params = self.subscription_params.clone();
        let callback = self.callback.lock().clone();
        let running = self.running.clone();
        let connected = self.connected.clone();

        let handle = tokio::spawn(crate::logging::with_worker_tag(
            "WSFEED",
            receive_loop(config, params, callback, rx, running, connected),
        ));
        *self.handle.lock() = Some(handle);
    }

    /// Flip the cancellation flag; the loop exits at its next wake.
    pub fn stop_receive_loop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.outbound_tx.lock() = None;
    }

    /// Stop the loop and wait for it to wind down.
    pub async fn disconnect(&self) {
        self.stop_receive_loop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// `{"action":"auth","params":<key>}`
pub fn auth_message(key: &str) -> String {
    serde_json::json!({ "action": "auth", "params": key }).to_string()
}

/// `{"action":"subscribe","params":"CH.SYMBOL[,CH.SYMBOL...]"}`
pub fn subscribe_message(params: &str) -> String {
    serde_json::json!({ "action": "subscribe", "params": params }).to_string()
}

pub fn unsubscribe_message(params: &str) -> String {
    serde_json::json!({ "action": "unsubscribe", "params": params }).to_string()
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

async fn receive_loop(
    config: WsSessionConfig,
    subscription_params: Arc<Mutex<String>>,
    callback: Option<MessageCallback>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        // Re-read on every pass so the latest subscription survives reconnects.
        let params = subscription_params.lock().clone();
        let end = run_session(
            &config,
            &params,
            callback.as_ref(),
            &mut outbound_rx,
            &running,
            &connected,
        )
        .await;

        connected.store(false, Ordering::Relaxed);

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Closed(reason) => {
                info!(url = %config.url, reason, "websocket session closed, reconnecting");
                tokio::time::sleep(config.reconnect_delay).await;
            }
            SessionEnd::Error(error) => {
                warn!(url = %config.url, error, "websocket session error, reconnecting");
                tokio::time::sleep(config.error_retry_delay).await;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    debug!(url = %config.url, "websocket receive loop exited");
}

async fn run_session(
    config: &WsSessionConfig,
    subscription_params: &str,
    callback: Option<&MessageCallback>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    running: &AtomicBool,
    connected: &AtomicBool,
) -> SessionEnd {
    let (mut stream, response) = match connect_async(config.url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => return SessionEnd::Error(format!("connect failed: {e}")),
    };
    debug!(status = %response.status(), "websocket handshake accepted");

    // Authenticate, then restore the subscription for this session.
    if let Err(e) = stream.send(Message::Text(auth_message(&config.auth_key))).await {
        return SessionEnd::Error(format!("auth send failed: {e}"));
    }
    if !subscription_params.is_empty() {
        if let Err(e) = stream
            .send(Message::Text(subscribe_message(subscription_params)))
            .await
        {
            return SessionEnd::Error(format!("subscribe send failed: {e}"));
        }
    }
    connected.store(true, Ordering::Relaxed);
    info!(url = %config.url, params = subscription_params, "websocket session established");

    let mut idle = tokio::time::interval(IDLE_TICK);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = idle.tick() => {
                if !running.load(Ordering::Relaxed) {
                    let _ = stream.close(None).await;
                    return SessionEnd::Stopped;
                }
            }
            queued = outbound_rx.recv() => {
                match queued {
                    Some(text) => {
                        if let Err(e) = stream.send(Message::Text(text)).await {
                            return SessionEnd::Error(format!("send failed: {e}"));
                        }
                    }
                    // Sender dropped: the client is stopping.
                    None => {
                        let _ = stream.close(None).await;
                        return SessionEnd::Stopped;
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(cb) = callback {
                        if !cb(&text) {
                            debug!(bytes = text.len(), "message callback declined frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = stream.send(Message::Pong(payload)).await {
                        return SessionEnd::Error(format!("pong failed: {e}"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no close frame body".to_string());
                    return SessionEnd::Closed(reason);
                }
                Some(Ok(_)) => {} // binary/pong frames are not part of this feed
                Some(Err(e)) => return SessionEnd::Error(format!("read failed: {e}")),
                None => return SessionEnd::Closed("stream ended".to_string()),
            }
        }
    }
}
