//! Priority-to-queue routing.
//!
//! Tasks carry an open integer priority; workers consume from four named
//! queues in strict precedence order. The mapping is total: every integer
//! lands in exactly one queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::priority;

/// The four named queues, in consumption precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Critical,
    High,
    Default,
    Low,
}

impl QueueName {
    /// All queues, highest precedence first. Workers scan in this order.
    pub const ALL: [QueueName; 4] = [
        QueueName::Critical,
        QueueName::High,
        QueueName::Default,
        QueueName::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a task priority to its queue.
///
/// Thresholds are inclusive at the top (`>= 20` is critical, `>= 10` is
/// high) and at the bottom (`<= 1` is low); everything between routes to
/// the default queue. Negative priorities are low, not an error.
pub fn route_priority(priority: i32) -> QueueName {
    if priority >= priority::CRITICAL {
        QueueName::Critical
    } else if priority >= priority::HIGH {
        QueueName::High
    } else if priority <= priority::LOW {
        QueueName::Low
    } else {
        QueueName::Default
    }
}
