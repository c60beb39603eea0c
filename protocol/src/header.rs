//! Frame header layout, big-endian packed into a u64:
//!
//! ```text
//! payload length      (32 bit)
//! sequence number     (16 bit)
//! event type          (4 bit)
//! compress flag       (1 bit)
//! error number        (3 bit)
//! magic               (8 bit)  72
//! ```

use tether_std::errors::RemoteError;

pub const HEADER_SIZE: usize = 8;
pub const MAGIC: u8 = 72;

/// Sequence ids cycle in `[0, MAX_SEQUENCE_ID - 1]`.
pub const MAX_SEQUENCE_ID: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Request = 1,
    Response = 2,
    Auth = 3,
}

impl EventType {
    pub fn from_u8(value: u8) -> Option<EventType> {
        match value {
            1 => Some(EventType::Request),
            2 => Some(EventType::Response),
            3 => Some(EventType::Auth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_size: u32,
    pub sequence_number: u16,
    pub compress_flag: u8,
    pub errno: u8,
    pub event_type: u8,
}

/// Pack header fields. Fields are assumed to fit their widths; callers are
/// responsible for ranges.
pub fn encode_header(
    payload_size: u32,
    sequence_number: u16,
    compress_flag: u8,
    errno: u8,
    event_type: u8,
) -> [u8; HEADER_SIZE] {
    let mut raw = (payload_size as u64) << 32;
    raw |= (sequence_number as u64) << 16;
    raw |= (event_type as u64) << 12;
    raw |= (compress_flag as u64) << 11;
    raw |= (errno as u64) << 8;
    raw |= MAGIC as u64;
    raw.to_be_bytes()
}

/// Unpack a header, validating nothing but the magic byte.
pub fn decode_header(buffer: &[u8; HEADER_SIZE]) -> Result<Header, RemoteError> {
    let raw = u64::from_be_bytes(*buffer);
    let magic = (raw & 0xff) as u8;
    if magic != MAGIC {
        return Err(RemoteError::Frame(format!("invalid magic number: {magic}")));
    }

    Ok(Header {
        payload_size: (raw >> 32) as u32,
        sequence_number: ((raw >> 16) & 0xffff) as u16,
        event_type: ((raw >> 12) & 0xf) as u8,
        compress_flag: ((raw >> 11) & 0x1) as u8,
        errno: ((raw >> 8) & 0x7) as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let payload_sizes = [0u32, 1, 7, 1024, 1025, 1 << 20, u32::MAX];
        let sequences = [0u16, 1, 4096, MAX_SEQUENCE_ID - 1];
        let event_types = [1u8, 2, 3, 15];

        for &payload_size in &payload_sizes {
            for &seq in &sequences {
                for &event_type in &event_types {
                    for errno in 0u8..8 {
                        for compress in 0u8..2 {
                            let raw = encode_header(payload_size, seq, compress, errno, event_type);
                            let header = decode_header(&raw).unwrap();
                            assert_eq!(header.payload_size, payload_size);
                            assert_eq!(header.sequence_number, seq);
                            assert_eq!(header.compress_flag, compress);
                            assert_eq!(header.errno, errno);
                            assert_eq!(header.event_type, event_type);

                            let again = encode_header(
                                header.payload_size,
                                header.sequence_number,
                                header.compress_flag,
                                header.errno,
                                header.event_type,
                            );
                            assert_eq!(raw, again);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_invalid_magic() {
        let mut raw = encode_header(4, 1, 0, 0, EventType::Request as u8);
        raw[7] = 73;
        let err = decode_header(&raw).unwrap_err();
        assert!(matches!(err, RemoteError::Frame(_)));
        assert_eq!(err.code(), 509);
    }

    #[test]
    fn test_event_type_values() {
        assert_eq!(EventType::from_u8(1), Some(EventType::Request));
        assert_eq!(EventType::from_u8(2), Some(EventType::Response));
        assert_eq!(EventType::from_u8(3), Some(EventType::Auth));
        assert_eq!(EventType::from_u8(0), None);
        assert_eq!(EventType::from_u8(4), None);
    }
}
