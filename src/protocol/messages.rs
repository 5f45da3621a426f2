//! WireGuard message framing used by the peer core
//!
//! Only the parts the core routes on are parsed here: the message type byte,
//! the receiver index of a handshake response and the transport header.
//! Handshake bodies belong to the [`HandshakeEngine`](super::HandshakeEngine).

use crate::error::ProtocolError;

/// WireGuard message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Receiver index of a handshake response
///
/// ```text
/// type(1) | reserved(3) | sender_index(4) | receiver_index(4) | ...
/// ```
pub fn response_receiver_index(data: &[u8]) -> Result<u32, ProtocolError> {
    const MIN: usize = 12;
    if data.len() < MIN {
        return Err(ProtocolError::InvalidMessageLength {
            expected: MIN,
            got: data.len(),
        });
    }
    Ok(read_u32(data, 8))
}

/// Transport Data header
///
/// ```text
/// type(1) | reserved(3) | receiver_index(4) | counter(8) | encrypted_payload(var)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    /// Size of the transport header (not including encrypted payload)
    pub const SIZE: usize = 16;

    /// Minimum size of a transport message (header + auth tag)
    pub const MIN_SIZE: usize = Self::SIZE + crate::crypto::aead::TAG_LEN;

    /// Build a transport message around an already sealed payload
    pub fn build_message(receiver_index: u32, counter: u64, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + sealed.len());

        buf.push(MessageType::TransportData as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(sealed);

        buf
    }

    /// Parse header from a complete transport message
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }

        if data[0] != MessageType::TransportData as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }

        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        })
    }

    /// Get the encrypted payload from a transport message
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

/// Get the message type from a packet
pub fn get_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    match data.first() {
        Some(&byte) => MessageType::try_from(byte),
        None => Err(ProtocolError::InvalidMessageLength {
            expected: 1,
            got: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_header() {
        let sealed = [0xAB; 32];
        let msg = TransportHeader::build_message(42, 1234, &sealed);

        assert_eq!(msg[0], 4);
        assert_eq!(msg.len(), TransportHeader::SIZE + sealed.len());

        let header = TransportHeader::from_bytes(&msg).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 1234);
        assert_eq!(TransportHeader::payload(&msg), &sealed[..]);
    }

    #[test]
    fn test_transport_header_too_short() {
        let msg = TransportHeader::build_message(1, 1, &[0u8; 4]);
        assert!(matches!(
            TransportHeader::from_bytes(&msg),
            Err(ProtocolError::InvalidMessageLength { .. })
        ));
    }

    #[test]
    fn test_response_receiver_index() {
        let mut msg = vec![2u8, 0, 0, 0];
        msg.extend_from_slice(&7u32.to_le_bytes());
        msg.extend_from_slice(&99u32.to_le_bytes());
        assert_eq!(response_receiver_index(&msg), Ok(99));
        assert!(response_receiver_index(&msg[..10]).is_err());
    }

    #[test]
    fn test_invalid_message_type() {
        assert!(get_message_type(&[99u8; 100]).is_err());
        assert!(get_message_type(&[]).is_err());
        assert_eq!(get_message_type(&[3]), Ok(MessageType::CookieReply));
    }
}
