//! 💀 Errors: the many ways a bulk job can ruin your evening.
//!
//! The library speaks one error type. Workers never swallow these: a write
//! failure rides along inside its `WriteBatch`, a read or data-service failure
//! stops its worker and comes back out of `wait()`.
//!
//! 🦆 (the duck has seen every variant below. the duck is tired.)

use reqwest::StatusCode;
use thiserror::Error;

/// 🎭 Every failure the data-movement core can surface to a caller.
#[derive(Debug, Error)]
pub enum Error {
    /// 📡 The request never produced a response: DNS, refused connection, reset, timeout.
    #[error("💀 Transport failure talking to '{url}'. The packets left and never wrote home.")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// 🔥 The server answered, and the answer was not 2xx.
    #[error("💀 Server replied {status} for '{url}'. It also said: '{body}'")]
    Server {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// 🧩 A payload arrived but did not look like the format we asked for.
    #[error("💀 Could not decode a {format} payload: {reason}")]
    Deserialization { format: &'static str, reason: String },

    /// 🔧 A batcher or client was set up wrong. Raised eagerly at `run()`.
    #[error("💀 Configuration problem: {0}")]
    Configuration(String),

    /// 🌲 The forest map is missing something a worker needs.
    #[error("💀 Topology problem: {0}")]
    Topology(String),

    /// 📸 The consistent snapshot could not be established for a read.
    #[error("💀 Snapshot unavailable: {0}")]
    Snapshot(String),

    /// 🛑 Cooperative cancellation reached an in-flight call.
    #[error("🛑 Cancelled before the server could finish answering")]
    Cancelled,

    /// 📦 Some write batches came back as failures. Each one is in its `WriteBatch`.
    #[error("💀 {failed} of {total} write batches failed. The listeners have the details.")]
    BatchFailures { failed: usize, total: usize },
}

impl Error {
    /// 🧪 Shorthand for "decode went sideways" with an owned reason.
    pub(crate) fn decode(format: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Deserialization {
            format,
            reason: reason.to_string(),
        }
    }

    /// ✅ True for the cancellation variant, which workers treat as a clean stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 🔢 HTTP status carried by a server error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Server { status, .. } => Some(*status),
            Self::Transport { source, .. } => source.status(),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
