//! Newline-delimited JSON framing over TCP
//!
//! Each control message is one JSON object serialized on a single line
//! terminated by `\n`. The reader tolerates malformed segments and unknown
//! message types (logged, skipped). Bytes buffered after the first frame of a
//! data connection are tunneled payload and are handed back verbatim through
//! [`MessageReader::take_residual`].

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::messages::ControlMessage;

/// Upper bound on a single frame; a peer that exceeds it is destroyed.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    Oversize,

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads newline-delimited control messages from a byte stream.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

/// Reader over the read half of a control or data socket.
pub type ControlReader = MessageReader<OwnedReadHalf>;

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next well-formed message.
    ///
    /// Malformed lines and unknown `type`s are logged and skipped. Returns
    /// `Ok(None)` on clean EOF.
    pub async fn next_message(&mut self) -> Result<Option<ControlMessage>, FrameError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos > MAX_FRAME_LEN {
                    return Err(FrameError::Oversize);
                }
                let line = self.buf.split_to(pos + 1);
                let segment = trim_line(&line);
                if segment.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<ControlMessage>(segment) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        warn!(error = %e, "discarding malformed or unknown frame");
                        continue;
                    }
                }
            }

            if self.buf.len() > MAX_FRAME_LEN {
                return Err(FrameError::Oversize);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    warn!(len = self.buf.len(), "stream ended with a partial frame");
                }
                return Ok(None);
            }
        }
    }

    /// Take any bytes buffered past the last consumed frame.
    ///
    /// On a data connection these belong to the tunneled payload and must be
    /// forwarded without reframing.
    pub fn take_residual(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Writes control messages as whole lines, serialized per socket.
///
/// The mutex guarantees no write interleaves with another message: every
/// prefix of the output is a sequence of complete JSON lines.
pub struct MessageWriter<W> {
    inner: Mutex<W>,
}

/// Writer over the write half of a control or data socket.
pub type ControlWriter = MessageWriter<OwnedWriteHalf>;

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Serialize `msg` and write it atomically as one `\n`-terminated line.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), FrameError> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        let mut inner = self.inner.lock().await;
        inner.write_all(&line).await?;
        inner.flush().await?;
        Ok(())
    }

    /// Cleanly shut down the underlying stream.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_multiple_messages_from_one_chunk() {
        let wire = b"{\"type\":\"heartbeat\"}\n{\"type\":\"heartbeat_ack\"}\n";
        let mut reader = MessageReader::new(&wire[..]);

        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Heartbeat {})
        );
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::HeartbeatAck {})
        );
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skips_malformed_and_unknown_frames() {
        let wire = b"not json\n{\"type\":\"future_thing\"}\n{\"type\":\"heartbeat\"}\n";
        let mut reader = MessageReader::new(&wire[..]);

        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Heartbeat {})
        );
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_residual_bytes_preserved_after_data_connection() {
        let wire = b"{\"type\":\"data_connection\",\"connectionId\":\"c1\"}\npayload-bytes";
        let mut reader = MessageReader::new(&wire[..]);

        let msg = reader.next_message().await.unwrap().unwrap();
        assert_eq!(
            msg,
            ControlMessage::DataConnection {
                connection_id: "c1".to_string()
            }
        );
        assert_eq!(&reader.take_residual()[..], b"payload-bytes");
    }

    #[tokio::test]
    async fn test_crlf_tolerated() {
        let wire = b"{\"type\":\"heartbeat\"}\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(ControlMessage::Heartbeat {})
        );
    }

    #[tokio::test]
    async fn test_writer_emits_whole_lines() {
        let writer = MessageWriter::new(Vec::new());
        writer
            .send(&ControlMessage::NewConnection {
                proxy_name: "ssh".to_string(),
                connection_id: "c1".to_string(),
            })
            .await
            .unwrap();
        writer.send(&ControlMessage::Heartbeat {}).await.unwrap();

        let out = writer.inner.into_inner();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split_terminator('\n').collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let _: ControlMessage = serde_json::from_str(line).unwrap();
        }
        assert!(text.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let mut wire = vec![b'x'; MAX_FRAME_LEN + 2];
        wire.push(b'\n');
        let mut reader = MessageReader::new(&wire[..]);
        assert!(matches!(
            reader.next_message().await,
            Err(FrameError::Oversize)
        ));
    }
}
