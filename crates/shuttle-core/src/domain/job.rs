//! Job-level model: status as seen by a backend, queue identity.

use serde::{Deserialize, Serialize};

/// Job status as reported by a backend that supports introspection.
///
/// State transitions observed by the engine:
/// - NEW -> PUBLISHED -> (DELAYED -> VISIBLE) -> RESERVED -> DONE
/// - RESERVED -> FAILED -> RESERVED (retry)
/// - RESERVED -> FAILED -> DEAD
///
/// Backends fold these into three observable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Published (or delayed) and not yet reserved by a consumer.
    Waiting,

    /// Reserved by a consumer, not yet acknowledged.
    Reserved,

    /// Gone from the backend: acknowledged, removed or dead.
    Done,
}

impl JobStatus {
    pub fn is_waiting(self) -> bool {
        matches!(self, JobStatus::Waiting)
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, JobStatus::Reserved)
    }

    pub fn is_done(self) -> bool {
        matches!(self, JobStatus::Done)
    }
}

/// Names a queue inside a broker. Immutable for the lifetime of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueIdentity {
    pub queue: String,
    pub exchange: String,
    pub vhost: String,
}

impl QueueIdentity {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        vhost: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            vhost: vhost.into(),
        }
    }

    /// Identity of a tube-style backend: a queue name without exchange or vhost.
    pub fn tube(name: impl Into<String>) -> Self {
        Self::new(name, "", "")
    }

    /// Whether messages reach the queue through an exchange in a vhost.
    /// `false` only for [`QueueIdentity::tube`] identities.
    pub fn is_routed(&self) -> bool {
        !self.exchange.is_empty() || !self.vhost.is_empty()
    }

    /// Name of the staging queue that parks messages for `delay_secs`.
    pub fn delay_queue(&self, delay_secs: u64) -> String {
        format!("{}.delay.{}s", self.queue, delay_secs)
    }
}

impl Default for QueueIdentity {
    fn default() -> Self {
        Self::new("queue", "exchange", "/")
    }
}
