use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MISSED_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub missed_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_threshold: DEFAULT_MISSED_THRESHOLD,
        }
    }
}

impl HeartbeatConfig {
    /// Silence longer than this means the socket is presumed dead.
    pub fn timeout(&self) -> Duration {
        self.interval.saturating_mul(self.missed_threshold.saturating_add(1))
    }
}

/// Time of the last inbound socket message, shared by the connection and its monitor.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_message_time: Arc<Mutex<Instant>>,
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            last_message_time: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self
            .last_message_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_message_time(&self) -> Instant {
        *self
            .last_message_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn elapsed(&self) -> Duration {
        self.last_message_time().elapsed()
    }
}

/// Receives the monitor's decisions. Implementations must not block.
pub trait HeartbeatSink: Send + Sync + 'static {
    fn send_heartbeat(&self);
    fn heartbeat_timed_out(&self, silent_for: Duration);
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config, task: None }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts ticking. Does nothing while a previous start is still running.
    pub fn start<S: HeartbeatSink>(&mut self, liveness: Liveness, sink: S) {
        if self.is_running() {
            return;
        }

        let config = self.config;
        let timeout = config.timeout();
        debug!(
            interval_ms = config.interval.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "heartbeat: starting"
        );
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let silent_for = liveness.elapsed();
                if silent_for > timeout {
                    warn!(
                        silent_for_ms = silent_for.as_millis() as u64,
                        "heartbeat: no inbound traffic, closing connection"
                    );
                    sink.heartbeat_timed_out(silent_for);
                    break;
                }
                sink.send_heartbeat();
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("heartbeat: stopped");
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/heartbeat_tests.rs"]
mod tests;
