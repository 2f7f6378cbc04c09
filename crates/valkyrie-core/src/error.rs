// ── Core error types ──
//
// User-facing errors from valkyrie-core. Consumers never see raw
// socket faults directly; the `From<valkyrie_api::Error>` impl
// translates transport-layer errors into domain variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Chassis connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Chassis disconnected")]
    Disconnected,

    // ── Device errors ────────────────────────────────────────────────
    #[error("Command rejected by chassis: {command:?} -> {reply:?}")]
    Rejected { command: String, reply: String },

    #[error("Malformed reply for {command:?}: {reply:?}")]
    BadReply { command: String, reply: String },

    #[error("Invalid resource index: {index:?}")]
    BadIndex { index: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    // ── State polling ────────────────────────────────────────────────
    /// A state poll deadline elapsed. Carries the polled attribute,
    /// the accepted states, the last value observed and the elapsed
    /// time.
    #[error(
        "{attribute} failed to reach {expected:?}, state is {last:?} after {elapsed_secs} seconds"
    )]
    StateTimeout {
        attribute: String,
        expected: Vec<String>,
        last: String,
        elapsed_secs: u64,
    },

    // ── External tools ───────────────────────────────────────────────
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    // ── Files ────────────────────────────────────────────────────────
    #[error("I/O error on {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<valkyrie_api::Error> for CoreError {
    fn from(err: valkyrie_api::Error) -> Self {
        match err {
            valkyrie_api::Error::Command { command, reply } => {
                CoreError::Rejected { command, reply }
            }
            valkyrie_api::Error::BadIndex { index } => CoreError::BadIndex { index },
            valkyrie_api::Error::NotConnected => CoreError::Disconnected,
            other => CoreError::ConnectionFailed {
                reason: other.to_string(),
            },
        }
    }
}
