//! Line-delimited JSON framing spoken with the remote agent.
//!
//! Each request is one `{"id":..,"request":{..}}` line; the agent answers
//! with one `{"id":..,"response":{..}}` or `{"id":..,"error":".."}` line.

use super::AbortSignal;
use crate::constants::limits;
use crate::errors::ChannelError;
use crate::model::{AgentRequest, AgentResponse};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub request: AgentRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AgentResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestEnvelope {
    pub fn new(request: AgentRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
        }
    }
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), ChannelError> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|err| ChannelError::protocol(format!("failed to encode frame: {}", err)))?;
    line.push(b'\n');
    writer.write_all(&line).map_err(io_to_channel)?;
    writer.flush().map_err(io_to_channel)
}

/// Reads one newline-terminated frame. EOF before any byte is a protocol
/// error, as is a frame larger than the configured ceiling.
pub fn read_frame<R: BufRead, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<T, ChannelError> {
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().map_err(io_to_channel)?;
        if available.is_empty() {
            break;
        }
        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..pos], Some(pos + 1)),
            None => (available, None),
        };
        if line.len() + chunk.len() > limits::MAX_AGENT_FRAME_BYTES {
            return Err(ChannelError::protocol(format!(
                "agent frame exceeds {} bytes",
                limits::MAX_AGENT_FRAME_BYTES
            )));
        }
        line.extend_from_slice(chunk);
        match done {
            Some(consumed) => {
                reader.consume(consumed);
                return decode(&line);
            }
            None => {
                let consumed = chunk.len();
                reader.consume(consumed);
            }
        }
    }
    if line.is_empty() {
        return Err(ChannelError::protocol("agent closed the connection"));
    }
    decode(&line)
}

fn decode<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(line)
        .map_err(|err| ChannelError::protocol(format!("malformed agent frame: {}", err)))
}

/// Sends `request` and waits for the matching response on one stream.
/// `timeout` is the read/write timeout already armed on the stream.
pub fn round_trip<S: Read + Write>(
    stream: &mut S,
    request: &AgentRequest,
    timeout: Duration,
) -> Result<AgentResponse, ChannelError> {
    let envelope = RequestEnvelope::new(request.clone());
    let stamp = |err: ChannelError| match err {
        ChannelError::Timeout { operation, .. } => ChannelError::timeout(operation, timeout),
        other => other,
    };
    write_frame(stream, &envelope).map_err(stamp)?;
    let reply: ResponseEnvelope = read_frame(&mut BufReader::new(&mut *stream)).map_err(stamp)?;
    if reply.id != envelope.id {
        return Err(ChannelError::protocol(format!(
            "agent answered request {} while {} was pending",
            reply.id, envelope.id
        )));
    }
    match (reply.response, reply.error) {
        (_, Some(error)) => Err(ChannelError::protocol(format!("agent error: {}", error))),
        (Some(response), None) => Ok(response),
        (None, None) => Err(ChannelError::protocol("agent reply carried no response")),
    }
}

/// Stream adapter that turns short socket timeouts into abort checkpoints.
///
/// The inner stream must carry a poll-sized read/write timeout. Timed-out
/// calls are retried until `deadline`, and an aborted signal fails the
/// next call with `ConnectionAborted`.
pub(crate) struct AbortableStream<'a, S> {
    inner: &'a mut S,
    abort: &'a AbortSignal,
    deadline: Instant,
}

impl<'a, S> AbortableStream<'a, S> {
    pub(crate) fn new(inner: &'a mut S, abort: &'a AbortSignal, timeout: Duration) -> Self {
        Self {
            inner,
            abort,
            deadline: Instant::now() + timeout,
        }
    }

    fn checkpoint(&self) -> io::Result<()> {
        if self.abort.is_aborted() {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted"));
        }
        if Instant::now() >= self.deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline passed"));
        }
        Ok(())
    }
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl<S: Read> Read for AbortableStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.checkpoint()?;
            match self.inner.read(buf) {
                Err(err) if is_poll_timeout(&err) => continue,
                other => return other,
            }
        }
    }
}

impl<S: Write> Write for AbortableStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.checkpoint()?;
            match self.inner.write(buf) {
                Err(err) if is_poll_timeout(&err) => continue,
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        loop {
            self.checkpoint()?;
            match self.inner.flush() {
                Err(err) if is_poll_timeout(&err) => continue,
                other => return other,
            }
        }
    }
}

/// `round_trip` over a stream armed with a poll-sized timeout, giving up
/// early when `abort` is raised.
pub(crate) fn abortable_round_trip<S: Read + Write>(
    stream: &mut S,
    request: &AgentRequest,
    timeout: Duration,
    abort: &AbortSignal,
) -> Result<AgentResponse, ChannelError> {
    abort.check("agent request")?;
    let result = round_trip(&mut AbortableStream::new(stream, abort, timeout), request, timeout);
    if result.is_err() && abort.is_aborted() {
        return Err(ChannelError::aborted("agent request"));
    }
    result
}

pub(crate) fn io_to_channel(err: std::io::Error) -> ChannelError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            ChannelError::timeout("agent round trip", Duration::ZERO)
        }
        _ => ChannelError::transport(format!("agent stream failed: {}", err)),
    }
}
