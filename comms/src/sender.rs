use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes one frame per message. The staging buffer is reused across sends.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    staging: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            staging: Vec::with_capacity(LEN_TYPE_SIZE),
        }
    }

    /// Frames `msg` and flushes it.
    ///
    /// # Errors
    /// `InvalidInput` if the frame body exceeds `MAX_FRAME_LEN`, otherwise the
    /// error of the underlying writer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, staging } = self;

        staging.clear();
        staging.extend_from_slice(&[0; LEN_TYPE_SIZE]);
        let tail = msg.serialize(staging);

        let body_len = staging.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);
        if body_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {body_len} bytes exceeds {MAX_FRAME_LEN}"),
            ));
        }

        let (prefix, _) = staging.split_at_mut(LEN_TYPE_SIZE);
        prefix.copy_from_slice(&(body_len as LenType).to_be_bytes());

        tx.write_all(staging).await?;
        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }
        tx.flush().await
    }
}
