use std::time::Duration;

use clap::ValueEnum;

/// Heartbeat timing shared by the broker and the worker runtime.
///
/// A peer is considered dead once `interval * max_tries` has passed without
/// any contact from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often heartbeats are emitted
    pub interval: Duration,
    /// Missed heartbeats tolerated before the peer is declared dead
    pub max_tries: u32,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, max_tries: u32) -> Self {
        Self {
            interval,
            max_tries,
        }
    }

    /// Time after the last contact at which a peer expires.
    pub fn expiry(&self) -> Duration {
        self.interval * self.max_tries
    }
}

/// Configuration for the broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interface the sockets bind to
    pub bind_address: String,
    /// Port for the client-facing ROUTER socket
    pub client_port: u16,
    /// Port for the worker-facing ROUTER socket
    pub worker_port: u16,
    /// Port for the PUB socket announcing finished jobs; `None` disables it
    pub news_port: Option<u16>,
    pub heartbeat: HeartbeatConfig,
    /// Upper bound on a single poll of the sockets
    pub poll_timeout: Duration,
    /// Number of finished jobs kept for `SERVER-HIST`
    pub history_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            client_port: 5555,
            worker_port: 5556,
            news_port: Some(5557),
            heartbeat: HeartbeatConfig::new(Duration::from_secs(5), 3),
            poll_timeout: Duration::from_millis(2000),
            history_limit: 100,
        }
    }
}

impl BrokerConfig {
    pub fn new(client_port: u16, worker_port: u16) -> Self {
        Self {
            client_port,
            worker_port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_news_port(mut self, news_port: Option<u16>) -> Self {
        self.news_port = news_port;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn client_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.bind_address, self.client_port)
    }

    pub fn worker_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.bind_address, self.worker_port)
    }

    pub fn news_endpoint(&self) -> Option<String> {
        self.news_port
            .map(|port| format!("tcp://{}:{}", self.bind_address, port))
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Service advertised in READY
    pub service_name: String,
    /// Broker backend endpoints, tried in order on failover
    pub backend_servers: Vec<String>,
    /// Client port of the brokers, used when the worker submits jobs itself
    pub frontend_port: u16,
    pub heartbeat: HeartbeatConfig,
    /// Consecutive idle heartbeats before the idle hook runs
    pub idle_heartbeats: u32,
    /// Identity for the first connection; reconnects always generate a new one
    pub identity: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            service_name: "DEMO".to_string(),
            backend_servers: vec!["tcp://127.0.0.1:5556".to_string()],
            frontend_port: 5555,
            heartbeat: HeartbeatConfig::new(Duration::from_secs(3), 5),
            idle_heartbeats: 3,
            identity: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Replace the failover list with `servers`.
    pub fn with_backend_servers(mut self, servers: Vec<String>) -> Self {
        self.backend_servers = servers;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_frontend_port(mut self, frontend_port: u16) -> Self {
        self.frontend_port = frontend_port;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

/// Parse a comma-separated failover list. Entries without a scheme are
/// taken to be TCP addresses.
pub fn parse_backend_servers(servers: &str) -> Vec<String> {
    servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains("://") {
                s.to_string()
            } else {
                format!("tcp://{}", s)
            }
        })
        .collect()
}

/// Client endpoint on the same host as a backend endpoint.
pub fn frontend_endpoint_for(backend: &str, frontend_port: u16) -> String {
    let (scheme, rest) = backend.split_once("://").unwrap_or(("tcp", backend));
    let host = match rest.rsplit_once(':') {
        Some((host, _port)) => host,
        None => rest,
    };
    let host = if host == "*" || host == "0.0.0.0" {
        "127.0.0.1"
    } else {
        host
    };
    format!("{}://{}:{}", scheme, host, frontend_port)
}

/// Log levels accepted by `--log-level`, most to least restrictive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    #[value(name = "E")]
    Error,
    #[default]
    #[value(name = "W")]
    Warn,
    #[value(name = "I")]
    Info,
    #[value(name = "D")]
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}
