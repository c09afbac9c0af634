/// Writes a message into a frame buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame buffer, it already holds the length prefix.
    ///
    /// # Returns
    /// An optional borrowed tail that is written after `buf` without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
