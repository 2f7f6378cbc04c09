use thiserror::Error;

/// Top-level error type for the `valkyrie-api` crate.
///
/// Covers the transport layer (socket lifecycle, read retry budget,
/// decoding) and device-level command rejections. `valkyrie-core`
/// maps these into domain-appropriate variants.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Operation attempted on a socket that is not connected.
    #[error("Socket is not connected")]
    NotConnected,

    /// TCP connection to the chassis could not be established.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Write failure. The transport disconnects before raising this,
    /// so no partially-connected state is observable afterwards.
    #[error("Failed to send command: {source}")]
    Send {
        #[source]
        source: std::io::Error,
    },

    /// The read retry budget was exhausted without a complete reply
    /// line. The transport is disconnected when this is raised.
    #[error("Failed to read reply after {attempts} attempts: {source}")]
    ReadExhausted {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A reply line was not valid UTF-8. Fatal: the stream position
    /// can no longer be trusted, so the transport disconnects.
    #[error("Reply is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    // ── Addressing ──────────────────────────────────────────────────
    /// A resource index string did not decompose into numeric
    /// hierarchy segments.
    #[error("Invalid resource index: {index:?}")]
    BadIndex { index: String },

    // ── Device ──────────────────────────────────────────────────────
    /// The chassis rejected a command (`<BADVALUE>`, `#Syntax error`
    /// and friends, or a missing `<OK>` acknowledgement).
    #[error("Command rejected by chassis: {command:?} -> {reply:?}")]
    Command { command: String, reply: String },
}

impl Error {
    /// Returns `true` for faults that left the transport disconnected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Send { .. } | Self::ReadExhausted { .. } | Self::Decode(_)
        )
    }
}
