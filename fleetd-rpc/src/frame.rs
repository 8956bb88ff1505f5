use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Envelope;

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(u32),
}

/// Write one length-prefixed postcard frame.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = postcard::to_allocvec(envelope)?;
    let len = bytes.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed postcard frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageId, WireMessage};

    #[tokio::test]
    async fn frames_round_trip() {
        let envelope = Envelope {
            msg_id: MessageId::new(),
            reply_to: None,
            payload: WireMessage::Ping,
        };

        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &envelope).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.msg_id, envelope.msg_id);
        assert!(matches!(decoded.payload, WireMessage::Ping));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::Oversized(_))
        ));
    }
}
