use std::time::{Duration, Instant};

use crate::config::HeartbeatConfig;

/// Worker-side view of broker liveness and heartbeat pacing.
///
/// Pure state: the runtime feeds it poll outcomes and the clock, and acts on
/// what it reports.
#[derive(Debug, Clone)]
pub struct Liveness {
    interval: Duration,
    max_retries: u32,
    retries_remaining: u32,
    heartbeat_at: Instant,
    idle_threshold: u32,
    idle_count: u32,
    idle_armed: bool,
}

impl Liveness {
    pub fn new(heartbeat: HeartbeatConfig, idle_threshold: u32, now: Instant) -> Self {
        Self {
            interval: heartbeat.interval,
            max_retries: heartbeat.max_tries,
            retries_remaining: heartbeat.max_tries,
            heartbeat_at: now + heartbeat.interval,
            idle_threshold,
            idle_count: 0,
            idle_armed: true,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn idle_count(&self) -> u32 {
        self.idle_count
    }

    /// Any message from the broker proves it alive.
    pub fn on_broker_contact(&mut self) {
        self.retries_remaining = self.max_retries;
    }

    /// A poll interval passed in silence. Returns true when the broker
    /// should now be considered dead.
    pub fn on_poll_timeout(&mut self) -> bool {
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.retries_remaining == 0
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now >= self.heartbeat_at
    }

    pub fn next_heartbeat(&self) -> Instant {
        self.heartbeat_at
    }

    pub fn heartbeat_sent(&mut self, now: Instant) {
        self.heartbeat_at = now + self.interval;
    }

    /// Count a heartbeat sent while idle. Returns true exactly once per idle
    /// stretch, when the count reaches the threshold.
    pub fn idle_heartbeat(&mut self) -> bool {
        self.idle_count += 1;
        if self.idle_armed && self.idle_count >= self.idle_threshold {
            self.idle_armed = false;
            return true;
        }
        false
    }

    pub fn job_received(&mut self) {
        self.idle_count = 0;
        self.idle_armed = true;
    }

    /// Fresh connection: full retries, next heartbeat one interval away.
    pub fn reset(&mut self, now: Instant) {
        self.retries_remaining = self.max_retries;
        self.heartbeat_at = now + self.interval;
    }
}
