use std::time::Instant;

use tokio_util::sync::CancellationToken;
use zeromq::{PubSocket, RouterSocket, Socket};

use crate::broker::dispatcher::{Dispatcher, Outbound, Route};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::protocol::Message;

/// The broker process: two ROUTER sockets, an optional PUB socket, and the
/// dispatcher that owns all job and worker state.
pub struct Broker {
    config: BrokerConfig,
    frontend: RouterSocket,
    backend: RouterSocket,
    news: Option<PubSocket>,
    dispatcher: Dispatcher,
}

impl Broker {
    /// Bind every socket. Any bind failure is returned and is fatal.
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let mut frontend = RouterSocket::new();
        frontend.bind(&config.client_endpoint()).await?;

        let mut backend = RouterSocket::new();
        backend.bind(&config.worker_endpoint()).await?;

        let news = match config.news_endpoint() {
            Some(endpoint) => {
                let mut socket = PubSocket::new();
                socket.bind(&endpoint).await?;
                Some(socket)
            }
            None => None,
        };

        tracing::info!(
            clients = %config.client_endpoint(),
            workers = %config.worker_endpoint(),
            news = ?config.news_endpoint(),
            "Broker listening"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(&config, Instant::now()),
            config,
            frontend,
            backend,
            news,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve until `shutdown` fires. Each iteration waits for one message
    /// on either socket (or the poll timeout), then runs the periodic tick
    /// and flushes everything the dispatcher queued.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, closing broker sockets");
                    break;
                }
                received = Message::recv(&mut self.backend) => match received {
                    Ok(msg) => self.dispatcher.handle_back(msg, Instant::now()),
                    Err(e) => tracing::warn!(error = %e, "Backend receive failed"),
                },
                received = Message::recv(&mut self.frontend) => match received {
                    Ok(msg) => self.dispatcher.handle_front(msg),
                    Err(e) => tracing::warn!(error = %e, "Frontend receive failed"),
                },
                _ = tokio::time::sleep(self.config.poll_timeout) => {}
            }

            self.dispatcher.tick(Instant::now());
            self.flush().await;
        }

        tracing::info!(
            pending = self.dispatcher.jobs().pending_len(),
            active = self.dispatcher.jobs().active_len(),
            "Broker stopped"
        );
        Ok(())
    }

    async fn flush(&mut self) {
        for Outbound { route, message } in self.dispatcher.drain_outbox() {
            let result = match route {
                Route::Frontend => message.send(&mut self.frontend).await,
                Route::Backend => message.send(&mut self.backend).await,
                Route::News => match self.news.as_mut() {
                    Some(news) => message.send(news).await,
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                tracing::warn!(?route, error = %e, "Failed to deliver message");
            }
        }
    }
}
