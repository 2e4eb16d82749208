//! Opaque SSH packet as handed over by the transport layer

use bytes::Bytes;

/// One already-decrypted protocol message.
///
/// The relay never looks inside; the type tag is only exposed for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Bytes,
}

impl Packet {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Leading message number (SSH_MSG_*), if the payload is non-empty
    pub fn msg_type(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

impl From<Bytes> for Packet {
    fn from(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl From<Vec<u8>> for Packet {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}
