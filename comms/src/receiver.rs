use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align8, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// Reads frames written by a `FrameSender`.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Backing storage for the frame body. The decoded `T` borrows from
    ///   it, and its element type keeps numeric payloads 8 byte aligned.
    ///
    /// # Errors
    /// `InvalidData` for frames longer than `MAX_FRAME_LEN` or bodies `T`
    /// rejects, otherwise the error of the underlying reader.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align8,
    {
        let mut prefix = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut prefix).await?;

        let len = usize::try_from(LenType::from_be_bytes(prefix))
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "oversized frame"))?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let body = &mut bytemuck::cast_slice_mut::<B, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }
}
