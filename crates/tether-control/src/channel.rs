//! Backhaul control channel.
//!
//! One [`ControlChannel`] per process keeps a single websocket to the
//! management plane alive:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Disconnected (reconnect)
//!                                                    -> Closed       (quit/restart)
//! ```
//!
//! Failed connection attempts back off (5s doubling to 60s, forever).
//! Every inbound data frame (text or binary) is decoded and dispatched, then
//! answered with a best-effort `{"query":"ping"}` probe. Websocket control
//! frames (ping, pong) are handled by tungstenite and get no probe. Only the
//! channel task touches the
//! socket; other tasks ask it to reconnect or quit through a
//! [`ChannelHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether_delivery::authorization_value;
use tether_types::{ControlConfig, Query, ServerConfig, PING_JSON};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::ReconnectBackoff;
use crate::dispatcher::{Dispatcher, Disposition};
use crate::ControlError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the websocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on sending the close frame before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection lifecycle as seen from outside the channel task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Requests other tasks can make of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseRequest {
    None,
    Reconnect,
    Quit,
}

/// How the channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelExit {
    /// The server asked for the agent to be re-executed.
    pub restart_requested: bool,
}

/// Cloneable remote control for a running [`ControlChannel`].
#[derive(Clone)]
pub struct ChannelHandle {
    close_tx: Arc<watch::Sender<CloseRequest>>,
    state_rx: watch::Receiver<ChannelState>,
    restart: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Ask the channel to drop its current connection and connect again.
    pub fn request_reconnect(&self) {
        let _ = self.close_tx.send(CloseRequest::Reconnect);
    }

    /// Ask the channel to close and stop reconnecting.
    pub fn request_quit(&self) {
        let _ = self.close_tx.send(CloseRequest::Quit);
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Wait until the channel reaches `state`.
    ///
    /// Returns `false` if the channel went away first.
    pub async fn wait_for(&self, state: ChannelState) -> bool {
        let mut rx = self.state_rx.clone();
        let ok = rx.wait_for(|s| *s == state).await.is_ok();
        ok
    }

    /// Whether a restart was requested (set before the channel closes).
    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }
}

/// Where and how to connect.
#[derive(Clone)]
pub struct Endpoint {
    url: Url,
    authorization: HeaderValue,
    origin: HeaderValue,
    connector: Option<Connector>,
}

impl Endpoint {
    /// Derive the backhaul endpoint from the agent configuration.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`; the backhaul path is
    /// appended to the server URL.
    pub fn from_config(server: &ServerConfig, control: &ControlConfig) -> Result<Self, ControlError> {
        let url = backhaul_url(&server.url, &control.backhaul_path)?;

        let mut authorization = HeaderValue::from_str(&authorization_value(&server.id, &server.key))
            .map_err(|_| ControlError::InvalidHeader("Authorization"))?;
        authorization.set_sensitive(true);
        let origin = HeaderValue::from_str(server.url.trim_end_matches('/'))
            .map_err(|_| ControlError::InvalidHeader("Origin"))?;

        let connector = if url.scheme() == "wss" {
            Some(tls_connector(server)?)
        } else {
            None
        };

        Ok(Self {
            url,
            authorization,
            origin,
            connector,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn connect(&self) -> Result<WsStream, ControlError> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(ORIGIN, self.origin.clone());

        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            self.connector.clone(),
        );
        let (ws, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| ControlError::Timeout(HANDSHAKE_TIMEOUT))??;
        Ok(ws)
    }
}

/// Build the websocket URL for the backhaul endpoint.
pub fn backhaul_url(server_url: &str, backhaul_path: &str) -> Result<Url, ControlError> {
    let joined = format!("{}{}", server_url.trim_end_matches('/'), backhaul_path);
    let invalid = |reason: String| ControlError::InvalidUrl {
        url: joined.clone(),
        reason,
    };

    let mut url = Url::parse(&joined).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    Ok(url)
}

fn tls_connector(server: &ServerConfig) -> Result<Connector, ControlError> {
    let mut builder = native_tls::TlsConnector::builder();
    if !server.verify_certificate {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    if let Some(path) = &server.ca_certificate {
        let pem = std::fs::read(path).map_err(|e| ControlError::Certificate {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| ControlError::Certificate {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        builder.add_root_certificate(cert);
    }
    Ok(Connector::NativeTls(builder.build()?))
}

/// Receiving end of [`ChannelHandle`] requests.
struct CloseSignal {
    rx: watch::Receiver<CloseRequest>,
    alive: bool,
}

impl CloseSignal {
    /// Resolve with the next request made through a [`ChannelHandle`].
    ///
    /// Never resolves once every handle has been dropped.
    async fn next(&mut self) -> CloseRequest {
        if !self.alive {
            return std::future::pending().await;
        }
        match self.rx.changed().await {
            Ok(()) => *self.rx.borrow_and_update(),
            Err(_) => {
                self.alive = false;
                std::future::pending().await
            }
        }
    }

    fn quit_requested(&self) -> bool {
        *self.rx.borrow() == CloseRequest::Quit
    }
}

/// Why a served connection ended.
enum Ended {
    /// Read error or remote close.
    Lost,
    /// A query or local request decided the outcome.
    By(Disposition),
}

/// The single duplex connection to the management plane.
pub struct ControlChannel {
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    backoff: ReconnectBackoff,
    state_tx: watch::Sender<ChannelState>,
    requests: CloseSignal,
    restart: Arc<AtomicBool>,
}

impl ControlChannel {
    /// Create the channel and the handle used to steer it.
    pub fn new(endpoint: Endpoint, dispatcher: Dispatcher) -> (Self, ChannelHandle) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (close_tx, close_rx) = watch::channel(CloseRequest::None);
        let restart = Arc::new(AtomicBool::new(false));

        let channel = Self {
            endpoint,
            dispatcher,
            backoff: ReconnectBackoff::default(),
            state_tx,
            requests: CloseSignal {
                rx: close_rx,
                alive: true,
            },
            restart: Arc::clone(&restart),
        };
        let handle = ChannelHandle {
            close_tx: Arc::new(close_tx),
            state_rx,
            restart,
        };
        (channel, handle)
    }

    /// Replace the default 5s..60s reconnect schedule.
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep the connection up until a quit or restart.
    pub async fn run(mut self) -> ChannelExit {
        info!(url = %self.endpoint.url, "control channel starting");

        loop {
            if self.requests.quit_requested() {
                break;
            }

            self.set_state(ChannelState::Connecting);
            let connected = tokio::select! {
                result = self.endpoint.connect() => Some(result),
                _ = self.requests.next() => None,
            };
            let ws = match connected {
                Some(Ok(ws)) => ws,
                Some(Err(e)) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "control connection failed");
                    self.set_state(ChannelState::Disconnected);
                    self.pause(delay).await;
                    continue;
                }
                None => {
                    // Reconnect while connecting means try again; quit is
                    // picked up at the top of the loop.
                    self.set_state(ChannelState::Disconnected);
                    continue;
                }
            };

            info!(url = %self.endpoint.url, "control channel connected");
            self.set_state(ChannelState::Connected);
            let connected_at = Instant::now();

            match self.serve(ws).await {
                Ended::By(Disposition::Quit) => break,
                Ended::By(Disposition::Restart) => {
                    self.restart.store(true, Ordering::SeqCst);
                    break;
                }
                Ended::By(_) => {
                    self.backoff.reset();
                    self.set_state(ChannelState::Disconnected);
                }
                Ended::Lost => {
                    self.set_state(ChannelState::Disconnected);
                    // A connection that dies right after the handshake is
                    // treated like a failed attempt.
                    if connected_at.elapsed() >= self.backoff.initial() {
                        self.backoff.reset();
                    } else {
                        let delay = self.backoff.next_delay();
                        warn!(retry_in = ?delay, "control connection dropped right after connecting");
                        self.pause(delay).await;
                    }
                }
            }
        }

        self.set_state(ChannelState::Closed);
        let restart_requested = self.restart.load(Ordering::SeqCst);
        info!(restart_requested, "control channel closed");
        ChannelExit { restart_requested }
    }

    async fn serve(&mut self, mut ws: WsStream) -> Ended {
        loop {
            let frame = tokio::select! {
                frame = ws.next() => frame,
                request = self.requests.next() => {
                    let disposition = match request {
                        CloseRequest::Quit => Disposition::Quit,
                        _ => Disposition::Reconnect,
                    };
                    debug!(?disposition, "local close request");
                    self.close(&mut ws).await;
                    return Ended::By(disposition);
                }
            };

            let text = match frame {
                None => {
                    info!("control connection ended by server");
                    return Ended::Lost;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "control connection read failed");
                    self.close(&mut ws).await;
                    return Ended::Lost;
                }
                Some(Ok(Message::Text(t))) => t.to_string(),
                Some(Ok(Message::Binary(b))) => match String::from_utf8(b.to_vec()) {
                    Ok(s) => s,
                    Err(_) => {
                        warn!(len = b.len(), "ignoring non-UTF-8 binary frame");
                        self.send_ping(&mut ws).await;
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "control connection closed by server");
                    self.close(&mut ws).await;
                    return Ended::Lost;
                }
                // Ping/pong are answered by the websocket layer.
                Some(Ok(_)) => continue,
            };

            let disposition = match Query::decode(&text) {
                Ok(query) => self.dispatcher.dispatch(query),
                Err(e) => {
                    warn!(error = %e, "ignoring malformed frame");
                    Disposition::Continue
                }
            };

            if disposition != Disposition::Continue {
                self.close(&mut ws).await;
                return Ended::By(disposition);
            }
            self.send_ping(&mut ws).await;
        }
    }

    async fn send_ping(&self, ws: &mut WsStream) {
        if let Err(e) = ws.send(Message::Text(PING_JSON.into())).await {
            debug!(error = %e, "liveness probe not sent");
        }
    }

    async fn close(&self, ws: &mut WsStream) {
        self.set_state(ChannelState::Closing);
        match tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "close frame not sent"),
            Err(_) => debug!("close frame timed out"),
        }
    }

    /// Sleep between attempts, cut short by any close request.
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.requests.next() => {}
        }
    }

    fn set_state(&self, state: ChannelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "control channel state");
        }
    }
}
