use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PgWireError, Result};

/// One raw outer-protocol frame, not yet decoded.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Incremental reader for `tag | length | payload` frames.
///
/// Reads never go past the end of the current frame, and progress is kept in
/// the reader, so a `read_frame` future dropped mid-frame (e.g. by
/// `tokio::select!`) resumes where it stopped on the next call.
#[derive(Debug, Default)]
pub struct FrameReader {
    header: [u8; 5],
    header_len: usize,
    payload: Vec<u8>,
    payload_len: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read exactly one frame. EOF before the frame is complete is
    /// `ConnectionClosed`.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, rd: &mut R) -> Result<Frame> {
        // tag, then the self-inclusive length word
        while self.header_len < self.header.len() {
            let n = rd.read(&mut self.header[self.header_len..]).await?;
            if n == 0 {
                return Err(PgWireError::ConnectionClosed);
            }
            self.header_len += n;
        }

        let tag = self.header[0];
        let len = i32::from_be_bytes([self.header[1], self.header[2], self.header[3], self.header[4]]);
        if len < 4 {
            self.header_len = 0;
            return Err(PgWireError::Protocol(format!(
                "invalid message length {len} for tag {:?}",
                tag as char
            )));
        }

        let want = len as usize - 4;
        self.payload.resize(want, 0);
        while self.payload_len < want {
            let n = rd.read(&mut self.payload[self.payload_len..]).await?;
            if n == 0 {
                return Err(PgWireError::ConnectionClosed);
            }
            self.payload_len += n;
        }

        self.header_len = 0;
        self.payload_len = 0;
        Ok(Frame {
            tag,
            payload: Bytes::from(std::mem::take(&mut self.payload)),
        })
    }
}

/// Read one frame with a throwaway [`FrameReader`].
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Frame> {
    FrameReader::new().read_frame(rd).await
}

/// Write one fully rendered message and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(wr: &mut W, frame: &[u8]) -> Result<()> {
    wr.write_all(frame).await?;
    wr.flush().await?;
    Ok(())
}
