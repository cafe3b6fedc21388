use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeromq::util::PeerIdentity;
use zeromq::{DealerSocket, Socket, SocketOptions};

use crate::client::Client;
use crate::config::{frontend_endpoint_for, WorkerConfig};
use crate::error::{Result, ZmwsError};
use crate::protocol::wire::{
    self, AnswerStatus, CLIENT_PROTOCOL, HEARTBEAT, JOB_PREFIX, READY,
};
use crate::protocol::{Identity, Message};
use crate::worker::failover::BrokerRotation;
use crate::worker::handler::{Answer, Assignment, JobHandler, Responder};
use crate::worker::liveness::Liveness;

/// `[service, payload?, "<STATUS>: <id>"]`, a worker answer before the
/// transport adds the envelope.
pub fn answer_message(
    service: &str,
    job_id: &str,
    status: AnswerStatus,
    payload: Option<&Value>,
) -> Message {
    let mut msg = Message::with_body(Bytes::from(service.to_string()));
    if let Some(payload) = payload {
        msg.push_back(wire::encode_param(payload));
    }
    msg.push_back(wire::answer_body(status, job_id));
    msg
}

pub fn ready_message(service: &str) -> Message {
    Message::from_frames([
        Bytes::from(service.to_string()),
        Bytes::from_static(READY.as_bytes()),
    ])
}

fn heartbeat_message() -> Message {
    Message::with_body(Bytes::from_static(HEARTBEAT.as_bytes()))
}

struct Connection {
    socket: DealerSocket,
    identity: Identity,
    endpoint: String,
}

impl Connection {
    /// The transport retries a refused connect indefinitely, so an address
    /// with nothing listening only shows up as a connect that outlives
    /// `deadline`.
    async fn open(endpoint: &str, identity: Identity, deadline: Duration) -> Result<Self> {
        let mut options = SocketOptions::default();
        options.peer_identity(PeerIdentity::try_from(identity.as_bytes().to_vec())?);
        let mut socket = DealerSocket::with_options(options);
        tokio::time::timeout(deadline, socket.connect(endpoint))
            .await
            .map_err(|_| ZmwsError::Timeout)??;
        Ok(Self {
            socket,
            identity,
            endpoint: endpoint.to_string(),
        })
    }
}

/// Send on the connection, dropping it on failure so the next poll
/// reconnects.
async fn send_on(connection: &mut Option<Connection>, msg: Message) -> bool {
    let Some(conn) = connection.as_mut() else {
        return false;
    };
    match msg.send(&mut conn.socket).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                endpoint = %conn.endpoint,
                error = %e,
                "Send to broker failed, dropping connection"
            );
            *connection = None;
            false
        }
    }
}

/// A worker process: registers a service with a broker, runs the jobs it is
/// given through a [`JobHandler`], and fails over to the next broker when
/// the current one goes quiet.
pub struct Worker<H> {
    config: WorkerConfig,
    handler: H,
    brokers: BrokerRotation,
    liveness: Liveness,
    connection: Option<Connection>,
    first_identity: Option<Identity>,
    jobs_done: u64,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(config: WorkerConfig, handler: H) -> Result<Self> {
        let brokers = BrokerRotation::new(config.backend_servers.clone())?;
        let liveness = Liveness::new(config.heartbeat, config.idle_heartbeats, Instant::now());
        let first_identity = config.identity.as_deref().map(Identity::from);
        Ok(Self {
            config,
            handler,
            brokers,
            liveness,
            connection: None,
            first_identity,
            jobs_done: 0,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Identity of the live connection.
    pub fn identity(&self) -> Option<&Identity> {
        self.connection.as_ref().map(|c| &c.identity)
    }

    /// Backend endpoint currently targeted.
    pub fn endpoint(&self) -> &str {
        self.brokers.current()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn jobs_done(&self) -> u64 {
        self.jobs_done
    }

    /// Connect to the current broker and announce the service. The first
    /// connection may use the configured identity; every later one gets a
    /// fresh identity so the broker never confuses it with the old socket.
    pub async fn start(&mut self) -> Result<()> {
        self.connection = None;
        let identity = self.first_identity.take().unwrap_or_else(Identity::generate);
        let endpoint = self.brokers.current().to_string();

        let deadline = self.config.heartbeat.expiry();
        let mut connection = Connection::open(&endpoint, identity, deadline).await?;
        ready_message(&self.config.service_name)
            .send(&mut connection.socket)
            .await?;

        tracing::info!(
            endpoint = %endpoint,
            worker = %connection.identity,
            service = %self.config.service_name,
            "Registered with broker"
        );
        self.liveness.reset(Instant::now());
        self.connection = Some(connection);
        Ok(())
    }

    async fn failover(&mut self) {
        let endpoint = self.brokers.advance().to_string();
        tracing::warn!(endpoint = %endpoint, "Broker unresponsive, failing over");
        if let Err(e) = self.start().await {
            tracing::warn!(endpoint = %endpoint, error = %e, "Failed to connect to broker");
            self.liveness.reset(Instant::now());
        }
    }

    /// One step of the worker loop: wait up to one heartbeat interval for a
    /// broker message and handle it, then send a heartbeat if one is due.
    pub async fn loop_once(&mut self) {
        let interval = self.liveness.interval();
        if self.connection.is_none() {
            tokio::time::sleep(interval).await;
            self.failover().await;
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let received =
            tokio::time::timeout(interval, Message::recv(&mut connection.socket)).await;
        match received {
            Ok(Ok(msg)) => {
                self.liveness.on_broker_contact();
                self.handle_message(msg).await;
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    endpoint = %self.brokers.current(),
                    error = %e,
                    "Receive from broker failed"
                );
                self.connection = None;
            }
            Err(_) => {
                if self.liveness.on_poll_timeout() {
                    self.failover().await;
                } else {
                    tracing::debug!(retries = self.liveness.retries_remaining(), "Broker silent");
                }
            }
        }

        let now = Instant::now();
        if self.connection.is_some() && self.liveness.heartbeat_due(now) {
            send_on(&mut self.connection, heartbeat_message()).await;
            self.liveness.heartbeat_sent(now);
            if self.liveness.idle_heartbeat() {
                tracing::debug!(heartbeats = self.liveness.idle_count(), "Worker idle");
                self.handler.on_idle().await;
            }
        }
    }

    /// Register, then loop until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if let Err(e) = self.start().await {
            tracing::warn!(endpoint = %self.endpoint(), error = %e, "Failed to connect to broker");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.loop_once() => {}
            }
        }
        tracing::info!(jobs_done = self.jobs_done, "Worker stopped");
    }

    /// Client connected to the frontend of the broker this worker targets,
    /// for handlers that submit jobs of their own.
    pub async fn client(&self) -> Result<Client> {
        Client::connect(&frontend_endpoint_for(
            self.brokers.current(),
            self.config.frontend_port,
        ))
        .await
    }

    async fn handle_message(&mut self, mut msg: Message) {
        msg.strip_delimiter();
        let body = msg.body_str().into_owned();
        if body == HEARTBEAT {
            return;
        }
        let Some(job_id) = body.strip_prefix(JOB_PREFIX).map(|id| id.trim().to_string()) else {
            tracing::warn!(message = %msg, "Unexpected message from broker");
            return;
        };

        // [tag, type, param, body]
        let well_formed = msg.frame_count() == 4
            && msg.get(0).is_some_and(|f| &f[..] == CLIENT_PROTOCOL.as_bytes())
            && msg.get(1).is_some_and(|f| wire::is_request_type(f));
        if !well_formed {
            tracing::warn!(job_id = %job_id, message = %msg, "Malformed job, failing it");
            self.send_answer(&job_id, Answer::Failed).await;
            return;
        }

        let param = msg.get(2).map(|f| wire::decode_param(f)).unwrap_or_default();
        self.liveness.job_received();
        tracing::info!(job_id = %job_id, "Running job");

        let job = Assignment { job_id, param };
        let answer = self.execute(&job).await;
        self.send_answer(&job.job_id, answer).await;
    }

    /// Run the handler while forwarding its CONT answers and keeping the
    /// broker heartbeat going.
    async fn execute(&mut self, job: &Assignment) -> Answer {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Responder::new(job.job_id.clone(), tx);
        let Self {
            config,
            handler,
            liveness,
            connection,
            ..
        } = self;
        let service = config.service_name.as_str();

        let result = {
            let work = AssertUnwindSafe(handler.work(job, &responder)).catch_unwind();
            tokio::pin!(work);
            loop {
                let next_heartbeat = tokio::time::Instant::from_std(liveness.next_heartbeat());
                tokio::select! {
                    result = &mut work => break result,
                    Some(payload) = rx.recv() => {
                        let msg = answer_message(
                            service,
                            &job.job_id,
                            AnswerStatus::Cont,
                            Some(&payload),
                        );
                        send_on(connection, msg).await;
                    }
                    _ = tokio::time::sleep_until(next_heartbeat) => {
                        send_on(connection, heartbeat_message()).await;
                        liveness.heartbeat_sent(Instant::now());
                    }
                }
            }
        };

        while let Ok(payload) = rx.try_recv() {
            let msg = answer_message(service, &job.job_id, AnswerStatus::Cont, Some(&payload));
            send_on(connection, msg).await;
        }

        match result {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.job_id, error = %e, "Job handler failed");
                Answer::Failed
            }
            Err(panic) => {
                tracing::error!(
                    job_id = %job.job_id,
                    panic = panic_message(panic.as_ref()),
                    "Job handler panicked"
                );
                Answer::Failed
            }
        }
    }

    async fn send_answer(&mut self, job_id: &str, answer: Answer) {
        let status = answer.status();
        let msg = answer_message(&self.config.service_name, job_id, status, answer.payload());
        if send_on(&mut self.connection, msg).await {
            self.jobs_done += 1;
            tracing::info!(job_id, %status, "Job answered");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic"
    }
}
