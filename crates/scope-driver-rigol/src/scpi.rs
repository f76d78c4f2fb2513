//! SCPI over TCP
//!
//! Async SCPI client for RIGOL oscilloscopes on their raw socket. Commands
//! and replies are terminated by `\n`. Waveform data arrives as an
//! IEEE-488.2 definite-length block, `#<n><len><payload>`, followed by the
//! terminator.
//!
//! The driver talks to the instrument through [`ScpiTransport`] so that the
//! simulated scope in [`crate::mock`] can stand in for hardware.

use crate::error::ScpiError;
use crate::resource::Resource;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default I/O timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATOR: u8 = b'\n';

/// Instrument I/O used by the driver.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without reading a reply.
    async fn write(&self, command: &str) -> Result<(), ScpiError>;

    /// Send a query and return the trimmed reply line.
    async fn query(&self, query: &str) -> Result<String, ScpiError>;

    /// Send a query answered by a binary block of little-endian 16-bit words.
    async fn query_binary(&self, query: &str) -> Result<Vec<u16>, ScpiError>;

    /// Discard stale input.
    async fn clear(&self) -> Result<(), ScpiError>;
}

// =============================================================================
// Block framing
// =============================================================================

/// Payload length announced by a block header `#<n><len>`.
///
/// `n_digit` is the `<n>` byte and `len_digits` the `<len>` bytes.
pub fn block_length(n_digit: u8, len_digits: &[u8]) -> Result<usize, ScpiError> {
    let n = match n_digit {
        b'1'..=b'9' => usize::from(n_digit - b'0'),
        b'0' => {
            return Err(ScpiError::Protocol(
                "indefinite-length blocks are not supported".into(),
            ))
        }
        other => {
            return Err(ScpiError::Protocol(format!(
                "bad block header digit {:?}",
                char::from(other)
            )))
        }
    };
    if len_digits.len() != n {
        return Err(ScpiError::Protocol(format!(
            "block header announces {} length digits, got {}",
            n,
            len_digits.len()
        )));
    }
    std::str::from_utf8(len_digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            ScpiError::Protocol(format!(
                "bad block length '{}'",
                String::from_utf8_lossy(len_digits)
            ))
        })
}

/// Frame `payload` as a definite-length block with terminator.
pub fn encode_block(payload: &[u8]) -> Vec<u8> {
    let len = payload.len().to_string();
    let mut out = Vec::with_capacity(payload.len() + len.len() + 3);
    out.push(b'#');
    out.extend_from_slice(len.len().to_string().as_bytes());
    out.extend_from_slice(len.as_bytes());
    out.extend_from_slice(payload);
    out.push(TERMINATOR);
    out
}

/// Decode a WORD-format payload.
pub fn decode_words(payload: &[u8]) -> Result<Vec<u16>, ScpiError> {
    if payload.len() % 2 != 0 {
        return Err(ScpiError::Protocol(format!(
            "odd payload length {} for 16-bit data",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect())
}

// =============================================================================
// TCP client
// =============================================================================

/// SCPI client on a raw TCP socket.
///
/// A reply that times out may still arrive later. The connection is then
/// marked stale, and before the next query the client sends
/// [`SYNC_QUERY`] and discards every line up to its answer. The instrument
/// answers in order, so the late reply is always consumed first.
pub struct ScpiClient {
    link: Mutex<Link>,
    timeout: Duration,
    peer: String,
}

struct Link {
    reader: BufReader<TcpStream>,
    stale: bool,
}

/// Query used to find the end of late replies after a timeout.
pub const SYNC_QUERY: &str = "*IDN?";

/// Lines discarded at most while resynchronizing.
const SYNC_MAX_LINES: usize = 64;

/// Resynchronizing waits this many I/O timeouts for the marker.
const SYNC_TIMEOUTS: u32 = 5;

/// An `*IDN?` answer has four comma-separated fields.
fn is_identification(line: &str) -> bool {
    line.split(',').count() == 4
}

impl ScpiClient {
    /// Connect to the instrument addressed by `resource`.
    pub async fn connect(resource: &Resource, io_timeout: Duration) -> Result<Self, ScpiError> {
        let address = resource.address();
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| ScpiError::Timeout(format!("connect to {}", address)))??;

        stream.set_nodelay(true)?;

        tracing::info!("Connected to {} at {}", resource, address);

        Ok(Self {
            link: Mutex::new(Link {
                reader: BufReader::new(stream),
                stale: false,
            }),
            timeout: io_timeout,
            peer: address,
        })
    }

    /// Peer address, `host:port`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(stream: &mut BufReader<TcpStream>, text: &str) -> Result<(), ScpiError> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(TERMINATOR);
        stream.get_mut().write_all(&line).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }

    async fn read_line_within(
        stream: &mut BufReader<TcpStream>,
        limit: Duration,
        context: &str,
    ) -> Result<String, ScpiError> {
        let mut raw = Vec::new();
        match timeout(limit, stream.read_until(TERMINATOR, &mut raw)).await {
            Err(_) => Err(ScpiError::Timeout(context.to_string())),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Err(ScpiError::ConnectionClosed),
            Ok(Ok(_)) => Ok(String::from_utf8_lossy(&raw).trim().to_string()),
        }
    }

    async fn read_line(&self, stream: &mut BufReader<TcpStream>, context: &str) -> Result<String, ScpiError> {
        Self::read_line_within(stream, self.timeout, context).await
    }

    /// Fill `buf`, applying the timeout to each read so that long
    /// waveforms are not cut off while data keeps flowing.
    async fn read_exact_timed(
        &self,
        stream: &mut BufReader<TcpStream>,
        buf: &mut [u8],
        context: &str,
    ) -> Result<(), ScpiError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match timeout(self.timeout, stream.read(&mut buf[filled..])).await {
                Err(_) => return Err(ScpiError::Timeout(context.to_string())),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(0)) => return Err(ScpiError::ConnectionClosed),
                Ok(Ok(n)) => n,
            };
            filled += n;
        }
        Ok(())
    }

    async fn flush_input_buffer(stream: &mut BufReader<TcpStream>) {
        let buffered = stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Flushing {} bytes from buffer", buffered);
            stream.consume(buffered);
        }

        let mut discard = vec![0u8; 4096];
        loop {
            match timeout(Duration::from_millis(10), stream.get_mut().peek(&mut discard)).await {
                Ok(Ok(0)) | Err(_) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    let mut consume_buf = vec![0u8; n];
                    let _ = stream.get_mut().try_read(&mut consume_buf);
                    tracing::debug!("Flushed {} stale bytes from stream", n);
                }
            }
        }
    }

    /// Discard stale input and, after a timeout, everything up to the
    /// answer of [`SYNC_QUERY`].
    async fn prepare_query(&self, link: &mut Link) -> Result<(), ScpiError> {
        Self::flush_input_buffer(&mut link.reader).await;
        if !link.stale {
            return Ok(());
        }
        tracing::debug!("resynchronizing with {}", self.peer);
        Self::send(&mut link.reader, SYNC_QUERY).await?;
        let deadline = tokio::time::Instant::now() + self.timeout * SYNC_TIMEOUTS;
        for _ in 0..SYNC_MAX_LINES {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            let line = Self::read_line_within(&mut link.reader, left, "resynchronizing").await?;
            if is_identification(&line) {
                link.stale = false;
                return Ok(());
            }
            tracing::debug!("discarded late reply {:?}", line);
        }
        Err(ScpiError::Protocol(format!(
            "no answer to {} among {} lines",
            SYNC_QUERY, SYNC_MAX_LINES
        )))
    }

    /// Mark the link stale when a reply may still be on its way.
    fn note(link: &mut Link, result: &Result<impl Sized, ScpiError>) {
        if matches!(result, Err(ScpiError::Timeout(_) | ScpiError::Protocol(_))) {
            link.stale = true;
        }
    }

    async fn read_block(&self, stream: &mut BufReader<TcpStream>, query: &str) -> Result<Vec<u16>, ScpiError> {
        let mut head = [0u8; 2];
        self.read_exact_timed(stream, &mut head, query).await?;
        if head[0] != b'#' {
            // Most likely an error text instead of data; drop the rest of it.
            let rest = self.read_line(stream, query).await.unwrap_or_default();
            return Err(ScpiError::Protocol(format!(
                "expected binary block, got '{}{}'",
                String::from_utf8_lossy(&head),
                rest
            )));
        }

        let n = match head[1] {
            b'1'..=b'9' => usize::from(head[1] - b'0'),
            _ => 0,
        };
        let mut digits = vec![0u8; n];
        self.read_exact_timed(stream, &mut digits, query).await?;
        let len = block_length(head[1], &digits)?;

        let mut payload = vec![0u8; len];
        self.read_exact_timed(stream, &mut payload, query).await?;

        let tail = self.read_line(stream, query).await?;
        if !tail.is_empty() {
            tracing::warn!("{} unexpected bytes after binary block", tail.len());
        }

        tracing::trace!("SCPI binary response: {} bytes", len);
        decode_words(&payload)
    }
}

#[async_trait]
impl ScpiTransport for ScpiClient {
    async fn write(&self, command: &str) -> Result<(), ScpiError> {
        let mut link = self.link.lock().await;
        tracing::debug!("SCPI write: {:?}", command);
        Self::send(&mut link.reader, command).await
    }

    async fn query(&self, query: &str) -> Result<String, ScpiError> {
        let mut link = self.link.lock().await;
        self.prepare_query(&mut link).await?;
        tracing::debug!("SCPI query: {:?}", query);
        Self::send(&mut link.reader, query).await?;
        let reply = self.read_line(&mut link.reader, query).await;
        Self::note(&mut link, &reply);
        let reply = reply?;
        tracing::trace!("SCPI response: {:?}", reply);
        Ok(reply)
    }

    async fn query_binary(&self, query: &str) -> Result<Vec<u16>, ScpiError> {
        let mut link = self.link.lock().await;
        self.prepare_query(&mut link).await?;
        tracing::debug!("SCPI binary query: {:?}", query);
        Self::send(&mut link.reader, query).await?;
        let words = self.read_block(&mut link.reader, query).await;
        Self::note(&mut link, &words);
        words
    }

    async fn clear(&self) -> Result<(), ScpiError> {
        let mut link = self.link.lock().await;
        Self::flush_input_buffer(&mut link.reader).await;
        Ok(())
    }
}
