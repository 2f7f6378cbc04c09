// TCP line transport for the chassis CLI protocol.
//
// One transport owns one socket to one chassis. The protocol is
// strictly half-duplex: one command line out, one reply line back,
// never pipelined. All the retry and continuation-marker quirks of
// the wire live here so the layers above only see clean lines.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::Error;

/// Default chassis CLI TCP port.
pub const DEFAULT_PORT: u16 = 22611;

/// Fixed read retry budget per reply line.
pub const READ_ATTEMPTS: u32 = 5;

/// Page-continuation sentinels. The chassis sometimes echoes one of
/// these before the real single-line reply; the chunk carrying it
/// must be discarded and the next read holds the payload.
const CONTINUATION_MARKERS: [&str; 2] = ["---^", "^---"];

/// Connection parameters for a single chassis endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Bound on each individual read attempt (and on connect).
    pub read_timeout: Duration,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            read_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Blocking-style line transport over one TCP socket.
///
/// "Blocking" in the protocol sense: every `query` completes the full
/// round trip before returning, and callers must not interleave
/// commands on one transport.
#[derive(Debug)]
pub struct TcpTransport {
    config: TransportConfig,
    stream: Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to the chassis. Idempotent: connecting an already
    /// connected transport warns and returns without touching the
    /// existing socket.
    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.stream.is_some() {
            warn!(addr = %self.config.addr(), "connect() on a connected socket");
            return Ok(());
        }

        let addr = self.config.addr();
        debug!(%addr, "connecting");
        let stream = timeout(self.config.read_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Connect {
                addr: addr.clone(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| Error::Connect { addr, source })?;

        let (read, write) = stream.into_split();
        self.stream = Some((BufReader::new(read), write));
        Ok(())
    }

    /// Release the socket. Safe to call when already disconnected.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(addr = %self.config.addr(), "disconnecting");
        }
    }

    /// Send one newline-terminated command line.
    ///
    /// A write failure forcibly disconnects before the error is
    /// propagated.
    pub async fn send(&mut self, command: &str) -> Result<(), Error> {
        let Some((_, writer)) = self.stream.as_mut() else {
            return Err(Error::NotConnected);
        };

        debug!(command, "send");
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');

        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        }
        .await;

        if let Err(source) = written {
            self.disconnect();
            return Err(Error::Send { source });
        }
        Ok(())
    }

    /// Read one reply line, retrying up to [`READ_ATTEMPTS`] times.
    ///
    /// Continuation-marker chunks are discarded and followed by one
    /// more read for the actual payload. When every attempt fails the
    /// transport disconnects and the last underlying cause is
    /// reported. Invalid UTF-8 is fatal immediately.
    pub async fn receive_line(&mut self) -> Result<String, Error> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }

        let mut buf = Vec::new();
        let mut last_err: Option<io::Error> = None;
        for attempt in 1..=READ_ATTEMPTS {
            match self.read_raw_line(&mut buf).await {
                Ok(()) => {
                    let line = self.decode(std::mem::take(&mut buf))?;
                    if is_continuation(&line) {
                        trace!(chunk = %line, "discarding continuation marker");
                        match self.read_raw_line(&mut buf).await {
                            Ok(()) => {
                                let payload = self.decode(std::mem::take(&mut buf))?;
                                debug!(reply = %payload, "received");
                                return Ok(payload);
                            }
                            Err(e) => {
                                debug!(attempt, error = %e, "read after continuation failed");
                                last_err = Some(e);
                                continue;
                            }
                        }
                    }
                    debug!(reply = %line, "received");
                    return Ok(line);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "read attempt failed");
                    last_err = Some(e);
                }
            }
        }

        self.disconnect();
        Err(Error::ReadExhausted {
            attempts: READ_ATTEMPTS,
            source: last_err
                .unwrap_or_else(|| io::Error::other("no data received")),
        })
    }

    /// `send` followed by exactly one `receive_line`.
    pub async fn query(&mut self, command: &str) -> Result<String, Error> {
        self.send(command).await?;
        self.receive_line().await
    }

    /// One bounded read attempt. Appends to `buf` so a partial line
    /// interrupted by a timeout is completed by the next attempt.
    async fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let read_timeout = self.config.read_timeout;
        let (reader, _) = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;

        let n = timeout(read_timeout, reader.read_until(b'\n', buf))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply within {read_timeout:?}"),
                )
            })??;

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by chassis",
            ));
        }
        if !buf.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            ));
        }
        Ok(())
    }

    /// Decode a raw line. The protocol is ASCII; anything that is not
    /// valid UTF-8 means the stream position can no longer be trusted.
    fn decode(&mut self, mut raw: Vec<u8>) -> Result<String, Error> {
        while raw.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            raw.pop();
        }
        match String::from_utf8(raw) {
            Ok(line) => Ok(line),
            Err(e) => {
                self.disconnect();
                Err(Error::Decode(e))
            }
        }
    }
}

fn is_continuation(chunk: &str) -> bool {
    CONTINUATION_MARKERS.iter().any(|m| chunk.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_markers_detected_anywhere_in_chunk() {
        assert!(is_continuation("---^"));
        assert!(is_continuation("^---"));
        assert!(is_continuation("  page 1 ---^"));
        assert!(is_continuation("^--- more"));
        assert!(!is_continuation("0/1 P_COMMENT \"---\""));
    }

    #[test]
    fn config_defaults() {
        let config = TransportConfig::new("10.0.0.5");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.addr(), "10.0.0.5:22611");
    }
}
