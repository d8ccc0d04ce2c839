use crate::{MilterError, Reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single milter frame. The MTA sends body content in
/// chunks of at most 65535 bytes; anything this far beyond that is a
/// protocol violation rather than data.
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Read one milter packet: a u32 length prefix followed by the command
/// byte and payload. Returns None on a clean EOF at a frame boundary.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u8, Vec<u8>)>, MilterError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_PACKET_SIZE {
        return Err(MilterError::OversizedFrame(len));
    }

    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame).await?;

    let code = frame[0];
    frame.remove(0);
    Ok(Some((code, frame)))
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &Reply,
) -> Result<(), MilterError> {
    writer.write_all(&reply.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_command, Command};

    #[tokio::test]
    async fn roundtrip_packet() {
        let mut wire = vec![];
        wire.extend_from_slice(&9u32.to_be_bytes());
        wire.push(b'H');
        wire.extend_from_slice(b"example\x00");

        let mut reader = std::io::Cursor::new(wire);
        let (code, payload) = read_packet(&mut reader).await.unwrap().unwrap();
        assert_eq!(code, b'H');
        assert_eq!(
            parse_command(code, &payload).unwrap(),
            Command::Helo {
                hostname: "example".to_string()
            }
        );

        // clean EOF at the frame boundary
        assert!(read_packet(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame() {
        let mut wire = vec![];
        wire.extend_from_slice(&(MAX_PACKET_SIZE + 1).to_be_bytes());
        wire.push(b'B');

        let mut reader = std::io::Cursor::new(wire);
        assert!(matches!(
            read_packet(&mut reader).await,
            Err(MilterError::OversizedFrame(_))
        ));
    }

    #[tokio::test]
    async fn write_then_read() {
        let mut wire = vec![];
        write_reply(&mut wire, &Reply::Continue).await.unwrap();
        write_reply(&mut wire, &Reply::Accept).await.unwrap();

        let mut reader = std::io::Cursor::new(wire);
        assert_eq!(
            read_packet(&mut reader).await.unwrap().unwrap(),
            (b'c', vec![])
        );
        assert_eq!(
            read_packet(&mut reader).await.unwrap().unwrap(),
            (b'a', vec![])
        );
    }
}
