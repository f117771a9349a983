//! Single-byte tags for message enums.

/// An enum that travels on the wire as one tag byte.
pub trait U8ReprEnum: Sized + Copy {
    /// Maps a tag byte back to its variant, or `None` for tags this version doesn't know.
    fn from_u8(value: u8) -> Option<Self>;

    fn into_u8(self) -> u8;
}
