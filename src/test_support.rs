//! Fixtures shared by the unit tests.

use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

use crate::gotify::SourceMessage;
use crate::platform::Destination;

pub fn sample_message() -> SourceMessage {
    SourceMessage {
        id: 7,
        appid: 2,
        message: "M".to_string(),
        title: "T".to_string(),
        priority: 5,
        date: "D".to_string(),
        extras: None,
    }
}

/// Start a local WebSocket server on a random port and return its `http://` base URL.
///
/// Every accepted connection is handed to `handler` once the handshake is done.
pub async fn ws_server<F, Fut>(handler: F) -> String
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    handler(ws).await;
                }
            });
        }
    });

    format!("http://{addr}")
}

/// A destination that remembers everything it was asked to deliver
#[derive(Default)]
pub struct Recorder {
    sent: tokio::sync::Mutex<Vec<String>>,
}

impl Recorder {
    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }

    /// Poll until at least `n` messages were delivered
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        loop {
            let sent = self.sent().await;
            if sent.len() >= n {
                return sent;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl Destination for Recorder {
    async fn deliver(&self, text: &str) {
        self.sent.lock().await.push(text.to_string());
    }
}
