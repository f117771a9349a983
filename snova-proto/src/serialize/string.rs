use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for str {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let bytes = self.as_bytes();
        let len = u16::try_from(bytes.len()).map_err(|_| Error::new(ErrorKind::InvalidData, "String is too long (>= 64KB)"))?;
        writer.write_u16(len).await?;
        writer.write_all(bytes).await
    }
}

impl ByteWrite for String {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_str().write(writer).await
    }
}

impl ByteRead for String {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u16().await? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes).await?;
        String::from_utf8(bytes).map_err(|_| Error::new(ErrorKind::InvalidData, "String is not valid UTF-8"))
    }
}

impl ByteWrite for [String] {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let len = u16::try_from(self.len()).map_err(|_| Error::new(ErrorKind::InvalidData, "List is too long (>= 64K elements)"))?;
        writer.write_u16(len).await?;
        for s in self {
            s.write(writer).await?;
        }

        Ok(())
    }
}

impl ByteWrite for Vec<String> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_slice().write(writer).await
    }
}

impl ByteRead for Vec<String> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let len = reader.read_u16().await? as usize;
        let mut list = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            list.push(String::read(reader).await?);
        }

        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_list() {
        let list = vec!["tcp://a:1".to_string(), String::new(), "ünïcode".to_string()];
        let mut buf = Vec::new();
        list.write(&mut buf).await.unwrap();
        assert_eq!(&buf[0..2], &[0, 3]);

        let read = Vec::<String>::read(&mut &buf[..]).await.unwrap();
        assert_eq!(read, list);
    }

    #[tokio::test]
    async fn test_invalid_utf8() {
        let buf = [0u8, 2, 0xC3, 0x28];
        let err = String::read(&mut &buf[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
