//! Length-prefixed frames for the reduction traffic between workers.

mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::Align8;
pub use deserialize::Deserialize;
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Largest frame body either end accepts, in bytes.
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Wraps the halves of a connection into a frame receiver and a frame sender.
///
/// # Arguments
/// * `rx` - The read half.
/// * `tx` - The write half.
pub fn framed<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
