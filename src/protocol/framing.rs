//! Line framing for heartbeat messages.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ProtocolError;
use crate::config::defaults::MAX_LINE_BYTES;

/// Read one `\n`-terminated JSON message.
///
/// EOF before any byte, or mid-line, is `Closed`. A line longer than
/// `MAX_LINE_BYTES` is `LineTooLong` and the stream is left unusable.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::with_capacity(512);
    let limit = (MAX_LINE_BYTES + 1) as u64;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_BYTES {
            return Err(ProtocolError::LineTooLong { limit: MAX_LINE_BYTES });
        }
        return Err(ProtocolError::Closed);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Write one message as a JSON line and flush.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    if line.len() >= MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong { limit: MAX_LINE_BYTES });
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
