use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridge::Session;
use crate::gotify::SourceMessage;

/// Consume the Gotify stream until the connector is shut down.
///
/// Waits (polling) for a connection handle, reads one message at a time and
/// forwards it. A failed read hands the broken handle back to the connector
/// for a redial; render and delivery failures are logged where they happen
/// and never end the loop.
pub async fn run(session: Arc<Session>) {
    let connector = &session.connector;
    info!("Forwarding loop started");

    loop {
        if connector.is_shut_down() {
            break;
        }

        let conn = match connector.current().await {
            Some(conn) => conn,
            None => {
                debug!("No Gotify connection yet, waiting");
                tokio::select! {
                    _ = connector.closed() => break,
                    _ = tokio::time::sleep(session.poll_interval) => {}
                }
                continue;
            }
        };

        debug!("Waiting for the next Gotify message");
        match conn.next_message().await {
            Ok(message) => forward(&session, &message).await,
            Err(e) if !e.is_fatal() => {
                warn!("Skipping unreadable Gotify frame: {}", e);
            }
            Err(e) => {
                if connector.is_shut_down() {
                    break;
                }
                warn!("Error while reading websocket: {}", e);
                if connector.connect(Some(conn.id())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Forwarding loop stopped");
}

/// Render one message and hand it to the destination
pub async fn forward(session: &Session, message: &SourceMessage) {
    debug!(
        id = message.id,
        appid = message.appid,
        priority = message.priority,
        "Rendering message from template"
    );
    let text = session.renderer.render(message).await;
    session.destination.deliver(&text).await;
}
