use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::forwarder;
use crate::gotify::stream::{stream_url, StreamConnector};
use crate::platform::telegram::TelegramClient;
use crate::platform::Destination;
use crate::template::TemplateRenderer;

/// Everything one running bridge needs, built at enable time
pub struct Session {
    pub connector: Arc<StreamConnector>,
    pub renderer: TemplateRenderer,
    pub destination: Arc<dyn Destination>,
    pub poll_interval: Duration,
}

impl Session {
    pub fn new(config: &Config) -> Result<Self> {
        let url = stream_url(&config.gotify.host, &config.gotify.client_token)
            .context("Invalid Gotify host")?;
        let telegram = TelegramClient::new(&config.telegram)?;

        Ok(Self {
            connector: Arc::new(StreamConnector::new(url, config.stream.reconnect_delay())),
            renderer: TemplateRenderer::new(&config.template.path, config.template.reload),
            destination: Arc::new(telegram),
            poll_interval: config.stream.poll_interval(),
        })
    }
}

/// A running Gotify → Telegram bridge: the connector task and the forwarding loop
pub struct Bridge {
    session: Arc<Session>,
    connector_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
}

impl Bridge {
    /// Build a session from the configuration and start forwarding
    pub fn enable(config: &Config) -> Result<Self> {
        debug!("Enabling Gotify to Telegram bridge");
        Ok(Self::start(Session::new(config)?))
    }

    pub fn start(session: Session) -> Self {
        let session = Arc::new(session);

        let connector = session.connector.clone();
        let connector_task = tokio::spawn(async move {
            if connector.connect(None).await.is_err() {
                debug!("Initial connect abandoned, bridge is shutting down");
            }
        });
        let forwarder_task = tokio::spawn(forwarder::run(session.clone()));

        info!("Bridge enabled");
        Self {
            session,
            connector_task,
            forwarder_task,
        }
    }

    #[allow(dead_code)]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Close the stream handle and wait for both tasks to finish
    pub async fn disable(self) {
        info!("Disabling Gotify to Telegram bridge");
        self.session.connector.shutdown().await;

        for (name, task) in [
            ("connector", self.connector_task),
            ("forwarder", self.forwarder_task),
        ] {
            if let Err(e) = task.await {
                error!("Bridge {} task failed: {}", name, e);
            }
        }
        info!("Bridge disabled");
    }
}
