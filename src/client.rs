use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use zeromq::{DealerSocket, Socket};

use crate::error::{Result, ZmwsError};
use crate::protocol::wire::{self, AdminQuery, JobName, CLIENT_PROTOCOL, REQUEST};
use crate::protocol::{ClientReply, Message};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side of the broker frontend.
///
/// Requests go out as `["", MDPC02, 0x01, param, "JOB: [SYNC-]<service>"]`.
pub struct Client {
    socket: DealerSocket,
    endpoint: String,
    timeout: Duration,
}

impl Client {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        Self::connect_with_timeout(endpoint, DEFAULT_TIMEOUT).await
    }

    /// Connect, giving up with [`ZmwsError::Timeout`] if the broker is not
    /// reachable within `timeout`. The same timeout then bounds each reply.
    pub async fn connect_with_timeout(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut socket = DealerSocket::new();
        tokio::time::timeout(timeout, socket.connect(endpoint))
            .await
            .map_err(|_| ZmwsError::Timeout)??;
        tracing::debug!(endpoint, "Client connected");
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
            timeout,
        })
    }

    /// How long [`Client::recv`] waits before giving up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a request without waiting for any reply.
    pub async fn send_job(&mut self, name: &JobName, param: Option<&Value>) -> Result<()> {
        let param = param.map(wire::encode_param).unwrap_or_default();
        Message::from_frames([
            Bytes::new(),
            Bytes::from_static(CLIENT_PROTOCOL.as_bytes()),
            Bytes::from_static(&[REQUEST]),
            param,
            Bytes::from(name.to_body()),
        ])
        .send(&mut self.socket)
        .await
    }

    /// Queue an asynchronous job. The reply is either
    /// [`ClientReply::Accepted`] or [`ClientReply::Rejected`].
    pub async fn submit(&mut self, service: &str, param: Option<&Value>) -> Result<ClientReply> {
        let name = JobName {
            service: service.to_string(),
            sync: false,
        };
        self.send_job(&name, param).await?;
        self.recv().await
    }

    /// Run a synchronous job and collect every answer up to and including
    /// the terminal one. A rejection is returned alone.
    pub async fn call(&mut self, service: &str, param: Option<&Value>) -> Result<Vec<ClientReply>> {
        let name = JobName {
            service: service.to_string(),
            sync: true,
        };
        self.send_job(&name, param).await?;

        let mut replies = Vec::new();
        loop {
            let reply = self.recv().await?;
            let done = reply.is_terminal();
            replies.push(reply);
            if done {
                return Ok(replies);
            }
        }
    }

    /// Run an administrative query and return its JSON result.
    pub async fn query(&mut self, query: AdminQuery) -> Result<Value> {
        let name = JobName {
            service: query.as_str().to_string(),
            sync: false,
        };
        self.send_job(&name, None).await?;
        match self.recv().await? {
            ClientReply::Data(value) => Ok(value),
            other => Err(ZmwsError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Next reply from the broker.
    pub async fn recv(&mut self) -> Result<ClientReply> {
        let msg = tokio::time::timeout(self.timeout, Message::recv(&mut self.socket))
            .await
            .map_err(|_| ZmwsError::Timeout)??;
        ClientReply::parse(msg)
    }
}
