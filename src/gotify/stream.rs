use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};
use url::Url;

use super::SourceMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stream connection state, as published by [`StreamConnector::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid Gotify host {host:?}: {source}")]
    InvalidUrl {
        host: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("connection handle was closed")]
    Closed,
    #[error("stream ended by the server")]
    Ended,
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("malformed message frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ReadError {
    /// Whether the connection is unusable after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReadError::Malformed(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("stream connector has been shut down")]
pub struct Shutdown;

/// Build the Gotify stream URL: `<host>/stream?token=<token>`.
///
/// `http`/`https` hosts are mapped onto `ws`/`wss`.
pub fn stream_url(host: &str, token: &str) -> Result<Url, ConnectError> {
    let base = format!("{}/stream", host.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|source| ConnectError::InvalidUrl {
        host: host.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectError::UnsupportedScheme(url.scheme().to_string()))?;
    url.query_pairs_mut().append_pair("token", token);

    Ok(url)
}

/// The URL with its query (and so the client token) stripped, for logging
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

async fn signalled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as signalled
    let _ = rx.wait_for(|set| *set).await;
}

/// One live WebSocket to Gotify.
///
/// Closing the handle unblocks a pending [`Connection::next_message`] with
/// [`ReadError::Closed`].
pub struct Connection {
    id: u64,
    stream: Mutex<WsStream>,
    closed: watch::Sender<bool>,
}

impl Connection {
    fn new(id: u64, stream: WsStream) -> Self {
        Self {
            id,
            stream: Mutex::new(stream),
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the next notification frame.
    ///
    /// Control frames are skipped; a frame that is not a valid message is
    /// returned as [`ReadError::Malformed`] and leaves the connection usable.
    pub async fn next_message(&self) -> Result<SourceMessage, ReadError> {
        let mut closed = self.closed.subscribe();
        let mut stream = self.stream.lock().await;

        loop {
            let frame = tokio::select! {
                _ = signalled(&mut closed) => {
                    let _ = stream.close(None).await;
                    return Err(ReadError::Closed);
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Ok(SourceMessage::from_json(text.as_str())?);
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(serde_json::from_slice(&data)?);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Gotify closed the stream");
                    return Err(ReadError::Ended);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ReadError::Ended),
            }
        }
    }
}

/// Owns the single connection slot and the reconnect loop
pub struct StreamConnector {
    url: Url,
    reconnect_delay: Duration,
    slot: Mutex<Option<Arc<Connection>>>,
    /// Serializes dials so concurrent callers never install two handles
    dial_lock: Mutex<()>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

impl StreamConnector {
    pub fn new(url: Url, reconnect_delay: Duration) -> Self {
        Self {
            url,
            reconnect_delay,
            slot: Mutex::new(None),
            dial_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            state: watch::Sender::new(ConnectionState::Disconnected),
            shutdown: watch::Sender::new(false),
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[allow(dead_code)]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`StreamConnector::shutdown`] has been called
    pub async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        signalled(&mut shutdown).await;
    }

    /// The live connection handle, if any
    pub async fn current(&self) -> Option<Arc<Connection>> {
        self.slot.lock().await.clone()
    }

    /// Make sure a live connection is installed.
    ///
    /// `stale` is the id of a handle the caller saw fail. If the slot holds a
    /// different open handle, somebody else already reconnected and this
    /// returns at once. Otherwise it dials until the handshake succeeds,
    /// waiting `reconnect_delay` between attempts, with no attempt limit.
    pub async fn connect(&self, stale: Option<u64>) -> Result<(), Shutdown> {
        let _dialing = self.dial_lock.lock().await;

        {
            let mut slot = self.slot.lock().await;
            if let Some(conn) = slot.as_ref() {
                if Some(conn.id()) != stale && !conn.is_closed() {
                    return Ok(());
                }
            }
            if let Some(old) = slot.take() {
                old.close();
                self.state.send_replace(ConnectionState::Disconnected);
            }
        }

        let dialed = self.dial().await;
        if dialed.is_err() {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        dialed
    }

    async fn dial(&self) -> Result<(), Shutdown> {
        let target = redacted(&self.url);
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if self.is_shut_down() {
                return Err(Shutdown);
            }

            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);
            debug!(url = %target, attempt, "Connecting to Gotify stream");

            let dialed = tokio::select! {
                _ = signalled(&mut shutdown) => return Err(Shutdown),
                dialed = connect_async(self.url.as_str()) => dialed,
            };

            match dialed {
                Ok((stream, _response)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(Connection::new(id, stream));

                    let mut slot = self.slot.lock().await;
                    if self.is_shut_down() {
                        conn.close();
                        return Err(Shutdown);
                    }
                    if let Some(old) = slot.replace(conn) {
                        old.close();
                    }
                    self.state.send_replace(ConnectionState::Connected);
                    info!(url = %target, connection = id, attempt, "Connected to Gotify stream");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        url = %target,
                        attempt,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "Cannot connect to Gotify stream: {}",
                        e
                    );
                    tokio::select! {
                        _ = signalled(&mut shutdown) => return Err(Shutdown),
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Stop dialing and close the live handle, unblocking any pending read
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(conn) = self.slot.lock().await.take() {
            conn.close();
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_message, ws_server};
    use futures::SinkExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(5);

    fn connector(host: &str) -> Arc<StreamConnector> {
        let url = stream_url(host, "secret").unwrap();
        Arc::new(StreamConnector::new(url, SHORT))
    }

    #[test]
    fn test_stream_url_maps_http_schemes() {
        let url = stream_url("http://gotify.local:8080", "abc").unwrap();
        assert_eq!(url.as_str(), "ws://gotify.local:8080/stream?token=abc");

        let url = stream_url("https://push.example.com/", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://push.example.com/stream?token=abc");

        let url = stream_url("wss://push.example.com/gotify", "abc").unwrap();
        assert_eq!(url.as_str(), "wss://push.example.com/gotify/stream?token=abc");
    }

    #[test]
    fn test_stream_url_encodes_token() {
        let url = stream_url("ws://h", "a b&c").unwrap();
        assert_eq!(url.query(), Some("token=a+b%26c"));
    }

    #[test]
    fn test_stream_url_rejects_bad_hosts() {
        assert!(matches!(
            stream_url("ftp://h", "t"),
            Err(ConnectError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            stream_url("not a url", "t"),
            Err(ConnectError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_redacted_hides_token() {
        let url = stream_url("http://h", "topsecret").unwrap();
        assert!(!redacted(&url).contains("topsecret"));
    }

    #[tokio::test]
    async fn test_reads_messages_and_skips_pings() {
        let host = ws_server(|mut ws| async move {
            ws.send(Message::Ping(vec![1u8].into())).await.ok();
            let json = serde_json::to_string(&sample_message()).unwrap();
            ws.send(Message::Text(json.into())).await.ok();
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = connector(&host);
        connector.connect(None).await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Connected);

        let conn = connector.current().await.unwrap();
        let msg = timeout(WAIT, conn.next_message()).await.unwrap().unwrap();
        assert_eq!(msg, sample_message());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let host = ws_server(|mut ws| async move {
            ws.send(Message::Text("{\"id\":1}".into())).await.ok();
            let json = serde_json::to_string(&sample_message()).unwrap();
            ws.send(Message::Text(json.into())).await.ok();
            while ws.next().await.is_some() {}
        })
        .await;

        let connector = connector(&host);
        connector.connect(None).await.unwrap();
        let conn = connector.current().await.unwrap();

        let err = conn.next_message().await.unwrap_err();
        assert!(!err.is_fatal());
        let msg = timeout(WAIT, conn.next_message()).await.unwrap().unwrap();
        assert_eq!(msg.title, sample_message().title);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_pending_read() {
        let host = ws_server(|mut ws| async move { while ws.next().await.is_some() {} }).await;

        let connector = connector(&host);
        connector.connect(None).await.unwrap();
        let conn = connector.current().await.unwrap();

        let reader = tokio::spawn(async move { conn.next_message().await });
        tokio::time::sleep(SHORT).await;
        connector.shutdown().await;

        let result = timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(ReadError::Closed)));
        assert!(connector.current().await.is_none());
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(connector.connect(None).await.is_err());
    }

    #[tokio::test]
    async fn test_reconnects_after_mid_stream_drop() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let host = ws_server(move |mut ws| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    // First connection dies without a close handshake
                    drop(ws);
                    return;
                }
                let json = serde_json::to_string(&sample_message()).unwrap();
                ws.send(Message::Text(json.into())).await.ok();
                while ws.next().await.is_some() {}
            }
        })
        .await;

        let connector = connector(&host);
        connector.connect(None).await.unwrap();
        let first = connector.current().await.unwrap();
        let err = timeout(WAIT, first.next_message()).await.unwrap().unwrap_err();
        assert!(err.is_fatal());

        timeout(WAIT, connector.connect(Some(first.id())))
            .await
            .unwrap()
            .unwrap();
        let second = connector.current().await.unwrap();
        assert_ne!(second.id(), first.id());
        assert!(first.is_closed());
        assert_eq!(connector.state(), ConnectionState::Connected);

        let msg = timeout(WAIT, second.next_message()).await.unwrap().unwrap();
        assert_eq!(msg, sample_message());
    }

    #[tokio::test]
    async fn test_retries_until_source_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = connector(&format!("http://{addr}"));
        let mut states = connector.subscribe();
        let dialer = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.connect(None).await })
        };

        states
            .wait_for(|s| *s == ConnectionState::Connecting)
            .await
            .unwrap();
        tokio::time::sleep(SHORT * 3).await;
        assert!(!dialer.is_finished());

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await {
                        while ws.next().await.is_some() {}
                    }
                });
            }
        });

        timeout(WAIT, dialer).await.unwrap().unwrap().unwrap();
        assert_eq!(connector.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connect_installs_single_handle() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let host = ws_server(move |mut ws| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { while ws.next().await.is_some() {} }
        })
        .await;

        let connector = connector(&host);
        let (a, b) = tokio::join!(connector.connect(None), connector.connect(None));
        a.unwrap();
        b.unwrap();
        tokio::time::sleep(SHORT).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        // Two callers reporting the same failed handle also yield one redial
        let stale = connector.current().await.unwrap().id();
        let (a, b) = tokio::join!(
            connector.connect(Some(stale)),
            connector.connect(Some(stale))
        );
        a.unwrap();
        b.unwrap();
        tokio::time::sleep(SHORT).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_ne!(connector.current().await.unwrap().id(), stale);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dialing() {
        let connector = connector("http://127.0.0.1:1");
        let dialer = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.connect(None).await })
        };
        tokio::time::sleep(SHORT).await;
        connector.shutdown().await;

        let result = timeout(WAIT, dialer).await.unwrap().unwrap();
        assert!(result.is_err());
        assert!(connector.current().await.is_none());
    }
}
