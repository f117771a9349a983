use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for bool {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(u8::from(*self)).await
    }
}

impl ByteRead for bool {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(reader.read_u8().await? != 0)
    }
}

/// Big-endian integers, straight through tokio's extension traits.
macro_rules! impl_integer {
    ($ty:ty, $write_fn:ident, $read_fn:ident) => {
        impl ByteWrite for $ty {
            async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
                writer.$write_fn(*self).await
            }
        }

        impl ByteRead for $ty {
            async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
                reader.$read_fn().await
            }
        }
    };
}

impl_integer!(u8, write_u8, read_u8);
impl_integer!(u16, write_u16, read_u16);
impl_integer!(u32, write_u32, read_u32);
impl_integer!(u64, write_u64, read_u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_integers_are_big_endian() {
        let mut buf = Vec::new();
        0x0102u16.write(&mut buf).await.unwrap();
        0x03040506u32.write(&mut buf).await.unwrap();
        true.write(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 1]);

        let mut reader = buf.as_slice();
        assert_eq!(u16::read(&mut reader).await.unwrap(), 0x0102);
        assert_eq!(u32::read(&mut reader).await.unwrap(), 0x03040506);
        assert!(bool::read(&mut reader).await.unwrap());
        assert!(u8::read(&mut reader).await.is_err());
    }
}
