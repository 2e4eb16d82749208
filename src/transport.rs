//! Transport session contract
//!
//! The SSH library that performs key exchange and packet framing plugs in here. After
//! a completed handshake it hands back something that reads and writes whole packets.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SshError;
use crate::packet::Packet;

/// Raw byte connection before any handshake (TCP socket, tunnel, in-memory pipe).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Established transport session.
///
/// `read_packet` and `write_packet` take `&self`: one pump task reads a session while
/// the other writes to it, so implementations must keep the two halves independent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next whole packet in receipt order. End of stream is an error (`Disconnected`).
    async fn read_packet(&self) -> Result<Packet, SshError>;

    async fn write_packet(&self, packet: Packet) -> Result<(), SshError>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), SshError>;
}

#[cfg(test)]
pub(crate) mod framed {
    //! Length-prefixed packet framing over any byte stream. Stands in for the SSH
    //! library in tests.

    use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex;

    use super::*;

    const MAX_FRAME: usize = 256 * 1024;

    pub struct FramedTransport<S> {
        reader: Mutex<ReadHalf<S>>,
        writer: Mutex<WriteHalf<S>>,
    }

    impl<S: AsyncStream> FramedTransport<S> {
        pub fn new(stream: S) -> Self {
            let (reader, writer) = split(stream);
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            }
        }
    }

    #[async_trait]
    impl<S: AsyncStream + 'static> Transport for FramedTransport<S> {
        async fn read_packet(&self) -> Result<Packet, SshError> {
            let mut reader = self.reader.lock().await;
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(SshError::Disconnected)
                }
                Err(e) => return Err(e.into()),
            };
            if len > MAX_FRAME {
                return Err(SshError::ProtocolError(format!("frame too large: {}", len)));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    SshError::Disconnected
                } else {
                    SshError::IoError(e)
                }
            })?;
            Ok(Packet::new(buf))
        }

        async fn write_packet(&self, packet: Packet) -> Result<(), SshError> {
            let mut writer = self.writer.lock().await;
            writer.write_u32(packet.len() as u32).await?;
            writer.write_all(packet.as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        }

        async fn close(&self) -> Result<(), SshError> {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_framed_transport_preserves_order() {
        let (a, b) = tokio::io::duplex(4096);
        let left = FramedTransport::new(a);
        let right = FramedTransport::new(b);

        left.write_packet(Packet::new(&b"one"[..])).await.unwrap();
        left.write_packet(Packet::new(&b"two"[..])).await.unwrap();

        assert_eq!(right.read_packet().await.unwrap().as_bytes(), b"one");
        assert_eq!(right.read_packet().await.unwrap().as_bytes(), b"two");

        left.close().await.unwrap();
        assert!(matches!(
            right.read_packet().await,
            Err(SshError::Disconnected)
        ));
    }
}
