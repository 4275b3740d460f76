//! Length-prefixed framing of entities over an ordered byte stream.
//!
//! A frame is a 4-byte big-endian body length followed by the body produced
//! by [`Entity::encode`]. There is no resynchronisation: after a framing or
//! decoding error the stream must be dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::protocol::Entity;

/// Encode an entity into a complete frame, length prefix included.
pub fn encode_frame(entity: &Entity) -> Result<Vec<u8>, ProtocolError> {
    let body = entity.encode()?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_entity<W>(writer: &mut W, entity: &Entity) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(entity)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next entity. Returns `Ok(None)` when the peer closed the stream
/// cleanly on a frame boundary.
///
/// Not cancel-safe: dropping the future mid-frame loses the partial frame.
pub async fn read_entity<R>(reader: &mut R) -> Result<Option<Entity>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Entity::decode(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EntityHeader, Message};
    use crate::types::UserId;

    fn message(body: &str) -> Entity {
        Entity::from(Message::new(EntityHeader::new("bob", UserId([1u8; 32])), body))
    }

    #[tokio::test]
    async fn test_stream_of_frames() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let one = message("one");
        let two = message("two");
        write_entity(&mut client, &one).await.unwrap();
        write_entity(&mut client, &two).await.unwrap();
        drop(client);

        assert_eq!(read_entity(&mut server).await.unwrap(), Some(one));
        assert_eq!(read_entity(&mut server).await.unwrap(), Some(two));
        assert!(read_entity(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_entity(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frame = encode_frame(&message("cut")).unwrap();
        client.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(client);

        let err = read_entity(&mut server).await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_unknown_kind_in_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 2, 0x09, 0x00]).await.unwrap();

        let err = read_entity(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(0x09)));
    }
}
