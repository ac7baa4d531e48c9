//! Network Module
//!
//! Handles TCP communication between nodes.

mod client;
mod links;
mod server;

pub use client::{send_once, NetworkClient};
pub use links::{NetworkCoordinatorLink, NetworkMirrorTransport, NetworkSecondaryLink, PeerBook};
pub use server::{MessageHandler, NetworkServer};

use crate::error::{Error, Result};
use crate::mirror::protocol::{FrameHeader, Message};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Communication(format!(
            "Message length {} exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Communication("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsResult;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::TopologyResponse {
            result: OpsResult::Exists,
        };

        write_message(&mut a, &msg).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            Message::TopologyResponse { result } => assert_eq!(result, OpsResult::Exists),
            other => panic!("unexpected message {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let body = Message::StatusRequest.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(err.is_communication());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let header = FrameHeader {
            length: FrameHeader::MAX_LENGTH + 1,
            checksum: 0,
        };
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&header.to_bytes()).await.unwrap();

        assert!(read_message(&mut b).await.is_err());
    }
}
