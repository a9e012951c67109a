// Stream framing: 4-byte little-endian length, then the frame body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::WireError;

/// Hard ceiling per frame. Oversized frames are dropped and the connection
/// closed by the caller.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. The length is validated before the body
/// buffer is allocated.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len == 0 {
        return Err(WireError::LengthOutOfRange {
            field: "frame",
            value: 0,
        });
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor).await.unwrap();
        assert_eq!(body, b"hello frame");
    }

    #[tokio::test]
    async fn oversized_write_rejected() {
        let mut buf = Vec::new();
        let body = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut buf, &body).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_allocation() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn empty_frame_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0u32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::LengthOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_body_fails() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&16u32.to_le_bytes());
        raw.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(raw);
        assert!(matches!(read_frame(&mut cursor).await, Err(WireError::Io(_))));
    }
}
