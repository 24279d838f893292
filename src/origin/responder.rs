use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_LENGTH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::sleep;

use super::action::Action;
use crate::logging::LogSink;

/// Progress of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    HeadersSent,
    Emitting { chunks_sent: u32 },
    Done,
}

/// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// The action configured its own `Content-Length`; bytes go out raw.
    Identity,
}

/// Emits the response for one matched action: headers first, then
/// `num_chunks` copies of the action's buffer paced by its delays.
///
/// Nothing cancels a responder. If the peer goes away the remaining writes
/// are skipped, but the timers still run and the state still reaches
/// [`ResponderState::Done`].
pub struct ChunkedResponder<'a, W> {
    action: Arc<Action>,
    writer: &'a mut W,
    keep_alive: bool,
    state: ResponderState,
    write_error: Option<io::Error>,
    log: LogSink,
}

impl<'a, W> ChunkedResponder<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(action: Arc<Action>, writer: &'a mut W, keep_alive: bool, log: LogSink) -> Self {
        Self {
            action,
            writer,
            keep_alive,
            state: ResponderState::Idle,
            write_error: None,
            log,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// Runs the exchange to [`ResponderState::Done`].
    ///
    /// Returns the first write error, if any, once the sequence has finished
    /// so the caller knows the connection is unusable.
    pub async fn run(mut self) -> io::Result<()> {
        let framing = self.framing();
        let head = self.head(framing);
        self.write(&head).await;
        self.state = ResponderState::HeadersSent;

        let num_chunks = self.action.num_chunks;
        if num_chunks == 0 {
            self.state = ResponderState::Done;
            return self.finish().await;
        }

        pause(self.action.delay_first_chunk).await;

        let mut chunks_sent = 0;
        loop {
            chunks_sent += 1;
            self.write_chunk(framing).await;
            self.state = ResponderState::Emitting { chunks_sent };

            if chunks_sent >= num_chunks {
                if framing == Framing::Chunked {
                    self.write(b"0\r\n\r\n").await;
                }
                self.state = ResponderState::Done;
                return self.finish().await;
            }

            pause(self.action.delay_between_chunks).await;
        }
    }

    fn framing(&self) -> Framing {
        if self.action.header(&CONTENT_LENGTH).is_some() {
            Framing::Identity
        } else {
            Framing::Chunked
        }
    }

    fn head(&self, framing: Framing) -> Vec<u8> {
        let status = self.action.status;
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .into_bytes();

        for (name, value) in &self.action.headers {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        if self.action.num_chunks == 0 {
            if framing == Framing::Chunked {
                head.extend_from_slice(b"content-length: 0\r\n");
            }
        } else if framing == Framing::Chunked {
            head.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }

        if !self.keep_alive && self.action.header(&CONNECTION).is_none() {
            head.extend_from_slice(b"connection: close\r\n");
        }

        head.extend_from_slice(b"\r\n");
        head
    }

    async fn write_chunk(&mut self, framing: Framing) {
        let chunk = self.action.chunk();
        if framing == Framing::Chunked {
            let size_line = format!("{:x}\r\n", chunk.len());
            self.write(size_line.as_bytes()).await;
            self.write(&chunk).await;
            self.write(b"\r\n").await;
        } else {
            self.write(&chunk).await;
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        if self.write_error.is_some() {
            return;
        }
        if let Err(e) = self.writer.write_all(bytes).await {
            self.log.debug(format!("Response write failed: {}", e));
            self.write_error = Some(e);
        }
    }

    async fn finish(mut self) -> io::Result<()> {
        if self.write_error.is_none() {
            if let Err(e) = self.writer.flush().await {
                self.write_error = Some(e);
            }
        }
        match self.write_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sleeps for `delay`; a zero delay still yields to the scheduler once.
async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        sleep(delay).await;
    }
}
