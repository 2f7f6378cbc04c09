// Chassis connection: protocol semantics on top of the line transport.
//
// The transport moves lines; this layer knows what the lines mean:
// `<OK>` acknowledgements, rejection tokens, multi-line reply
// termination, and the diagnostic counters the resource layer feeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::Error;
use crate::transport::{TcpTransport, TransportConfig};

/// Reply tokens the chassis uses to reject a command.
const REJECTION_TOKENS: [&str; 11] = [
    "<BADCOMMAND>",
    "<BADINDEX>",
    "<BADMODULE>",
    "<BADPORT>",
    "<BADPARAMETER>",
    "<BADVALUE>",
    "<NOTVALID>",
    "<NOTWRITABLE>",
    "<NOTRESERVED>",
    "<NOTLOGGEDON>",
    "<FAILED>",
];

/// Diagnostic counters for one chassis connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands written to the socket.
    pub commands_sent: AtomicU64,
    /// Replies that did not carry the expected echoed address prefix
    /// and were returned raw. A steadily climbing value usually means
    /// a command/reply mismatch rather than the benign echo-less
    /// replies this fallback exists for.
    pub prefix_fallbacks: AtomicU64,
}

impl ConnectionStats {
    pub fn note_prefix_fallback(&self) {
        self.prefix_fallbacks.fetch_add(1, Ordering::Relaxed);
    }
}

/// One logical connection to one chassis.
#[derive(Debug)]
pub struct ChassisConnection {
    transport: TcpTransport,
    stats: Arc<ConnectionStats>,
}

impl ChassisConnection {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            transport: TcpTransport::new(config),
            stats: Arc::new(ConnectionStats::default()),
        }
    }

    pub async fn connect(&mut self) -> Result<(), Error> {
        self.transport.connect().await
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// One command, one reply line. Rejection replies become
    /// [`Error::Command`].
    pub async fn query(&mut self, command: &str) -> Result<String, Error> {
        self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        let reply = self.transport.query(command).await?;
        if let Some(token) = rejection(&reply) {
            debug!(command, token, "chassis rejected command");
            return Err(Error::Command {
                command: command.to_owned(),
                reply,
            });
        }
        Ok(reply)
    }

    /// A set-style command that must be acknowledged with `<OK>`.
    pub async fn query_ok(&mut self, command: &str) -> Result<(), Error> {
        let reply = self.query(command).await?;
        if reply.contains("<OK>") {
            Ok(())
        } else {
            Err(Error::Command {
                command: command.to_owned(),
                reply,
            })
        }
    }

    /// One command, many reply lines. The chassis terminates a
    /// multi-line reply with a blank line; the terminator is consumed
    /// and not returned.
    pub async fn query_multiline(&mut self, command: &str) -> Result<Vec<String>, Error> {
        self.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.transport.send(command).await?;

        let mut lines = Vec::new();
        loop {
            let line = self.transport.receive_line().await?;
            if line.trim().is_empty() {
                break;
            }
            if lines.is_empty() {
                if let Some(token) = rejection(&line) {
                    debug!(command, token, "chassis rejected command");
                    return Err(Error::Command {
                        command: command.to_owned(),
                        reply: line,
                    });
                }
            }
            lines.push(line);
        }
        Ok(lines)
    }

    /// Wrap into the shared handle used by the resource hierarchy.
    pub fn into_shared(self) -> SharedConnection {
        SharedConnection::new(self)
    }
}

/// Cloneable handle to one connection, shared by every resource node
/// of the hierarchy. The mutex serializes round trips (the protocol
/// allows exactly one outstanding command); the stats are reachable
/// without taking the lock.
#[derive(Debug, Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<ChassisConnection>>,
    stats: Arc<ConnectionStats>,
}

impl SharedConnection {
    pub fn new(conn: ChassisConnection) -> Self {
        let stats = conn.stats();
        Self {
            inner: Arc::new(Mutex::new(conn)),
            stats,
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ChassisConnection> {
        self.inner.lock().await
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

fn rejection(reply: &str) -> Option<&'static str> {
    let trimmed = reply.trim();
    if trimmed.starts_with("#Syntax error") {
        return Some("#Syntax error");
    }
    REJECTION_TOKENS.iter().copied().find(|t| trimmed.contains(*t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_tokens_classified() {
        assert_eq!(rejection("0/1 <BADVALUE>"), Some("<BADVALUE>"));
        assert_eq!(rejection("<NOTRESERVED>"), Some("<NOTRESERVED>"));
        assert_eq!(rejection("#Syntax error in line"), Some("#Syntax error"));
        assert_eq!(rejection("0/1 P_SPEEDSEL AUTO"), None);
        assert_eq!(rejection("<OK>"), None);
    }
}
