use std::io;

/// Reads a message out of a received frame.
pub trait Deserialize<'a>: Sized {
    /// Deserializes a value borrowing from `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame body, without the length prefix.
    ///
    /// # Returns
    /// The decoded value or an `InvalidData` io error.
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self>;
}
