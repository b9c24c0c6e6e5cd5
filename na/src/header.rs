//! The 16-byte inline request header (§3) prepended to unexpected sends on
//! providers that can't report a message's source address natively.
//!
//! Layout, logically little-endian: `feats:u32, magic:u32, ip:u32, port:u32`.
//! A receiver that finds the byte-swapped magic instead swaps all four
//! fields in place before using them — this is the only over-the-wire
//! addition this crate makes; everything else rides the provider's own
//! tagged-message framing.

use std::net::Ipv4Addr;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NaError, NaResult};

pub const HEADER_SIZE: usize = 16;

/// `0x0F106688`, chosen (as in the source this crate's wire format is
/// modeled on) to be unlikely to collide with arbitrary payload bytes.
pub const MAGIC: u32 = 0x0F10_6688;
const MAGIC_SWAPPED: u32 = MAGIC.swap_bytes();

/// Feature bits carried alongside the source address. Currently always
/// zero; reserved so a future revision can extend the header without
/// changing its size.
const FEATS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub feats: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl RequestHeader {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        RequestHeader { feats: FEATS, ip, port }
    }

    /// Write this header as the leading `HEADER_SIZE` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> NaResult<()> {
        if buf.len() < HEADER_SIZE {
            return Err(NaError::Size { expected: HEADER_SIZE, actual: buf.len() });
        }
        LittleEndian::write_u32(&mut buf[0..4], self.feats);
        LittleEndian::write_u32(&mut buf[4..8], MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], u32::from(self.ip));
        LittleEndian::write_u32(&mut buf[12..16], self.port as u32);
        Ok(())
    }

    /// Parse the leading `HEADER_SIZE` bytes of `buf`, byte-swapping all
    /// four fields in place if the magic is found reversed. Returns
    /// `NaError::Protocol` if neither byte order yields the magic.
    pub fn decode(buf: &mut [u8]) -> NaResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NaError::Size { expected: HEADER_SIZE, actual: buf.len() });
        }
        let magic = LittleEndian::read_u32(&buf[4..8]);
        let swap = match magic {
            MAGIC => false,
            MAGIC_SWAPPED => true,
            _ => return Err(NaError::protocol("request_header::decode", -1)),
        };
        if swap {
            for field in buf[0..HEADER_SIZE].chunks_exact_mut(4) {
                field.swap(0, 3);
                field.swap(1, 2);
            }
        }
        let feats = LittleEndian::read_u32(&buf[0..4]);
        let ip = Ipv4Addr::from(LittleEndian::read_u32(&buf[8..12]));
        let port = LittleEndian::read_u32(&buf[12..16]) as u16;
        Ok(RequestHeader { feats, ip, port })
    }

    pub fn uri(&self, provider: &str) -> String {
        format!("{provider}://{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let header = RequestHeader::new(Ipv4Addr::new(127, 0, 0, 1), 7891);
        let mut buf = vec![0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = RequestHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn detects_and_corrects_byte_swapped_magic() {
        let header = RequestHeader::new(Ipv4Addr::new(1, 2, 3, 4), 5678);
        let mut buf = vec![0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();
        // simulate a cross-endian sender: byte-swap every 4-byte field
        for field in buf.chunks_exact_mut(4) {
            field.swap(0, 3);
            field.swap(1, 2);
        }
        let decoded = RequestHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.uri("prov"), "prov://1.2.3.4:5678");
    }

    #[test]
    fn rejects_buffer_with_no_recognizable_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        assert!(RequestHeader::decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_undersized_buffer() {
        let mut buf = vec![0u8; HEADER_SIZE - 1];
        assert!(RequestHeader::decode(&mut buf).is_err());
    }
}
