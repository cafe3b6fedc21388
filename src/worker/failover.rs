use crate::error::{Result, ZmwsError};

/// Ordered list of broker backend endpoints with a cursor. Failover moves
/// to the next entry and wraps around after the last.
#[derive(Debug, Clone)]
pub struct BrokerRotation {
    endpoints: Vec<String>,
    cursor: usize,
}

impl BrokerRotation {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ZmwsError::Config("no backend servers configured".to_string()));
        }
        Ok(Self {
            endpoints,
            cursor: 0,
        })
    }

    pub fn current(&self) -> &str {
        &self.endpoints[self.cursor]
    }

    pub fn advance(&mut self) -> &str {
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        self.current()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
