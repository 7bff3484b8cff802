//! T=14 framed byte protocol
//!
//! Commands are written whole. A response starts with an eight byte header
//! whose last byte is the payload length, followed by the payload and a
//! one byte XOR checksum over everything before it.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, instrument};

use crate::error::{ProtocolError, Result};
use crate::io::ByteIo;

/// Command header length
pub const COMMAND_HEADER_LEN: usize = 5;
/// Response header length
pub const RESPONSE_HEADER_LEN: usize = 8;

/// Build a command frame: header, data length, data, checksum
pub fn build_command(header: [u8; COMMAND_HEADER_LEN], data: &[u8]) -> Result<Bytes> {
    let len = u8::try_from(data.len()).map_err(|_| ProtocolError::InvalidApdu("T=14 data longer than 255 bytes"))?;
    let mut frame = BytesMut::with_capacity(COMMAND_HEADER_LEN + 2 + data.len());
    frame.extend_from_slice(&header);
    frame.put_u8(len);
    frame.extend_from_slice(data);
    let checksum = frame.iter().fold(0u8, |acc, b| acc ^ b);
    frame.put_u8(checksum);
    Ok(frame.freeze())
}

/// Write `frame` and read the complete response including its checksum
///
/// `timeout_ms` bounds the wait for the header; the payload follows within
/// `char_timeout_ms` per byte.
#[instrument(level = "trace", skip_all, fields(len = frame.len()))]
pub fn transfer<I: ByteIo + ?Sized>(io: &mut I, frame: &[u8], timeout_ms: u32, char_timeout_ms: u32) -> Result<Bytes> {
    if frame.is_empty() {
        return Err(ProtocolError::InvalidApdu("empty T=14 frame"));
    }
    io.write(frame, timeout_ms)?;

    let mut response = vec![0u8; RESPONSE_HEADER_LEN];
    io.read(&mut response, RESPONSE_HEADER_LEN, timeout_ms)?;
    let payload_len = usize::from(response[RESPONSE_HEADER_LEN - 1]);

    let rest = payload_len + 1;
    response.resize(RESPONSE_HEADER_LEN + rest, 0);
    let rest_timeout = char_timeout_ms.saturating_mul(rest as u32).saturating_add(1);
    io.read(&mut response[RESPONSE_HEADER_LEN..], rest, rest_timeout)?;

    let residue = response.iter().fold(0u8, |acc, b| acc ^ b);
    if residue != 0 {
        debug!(residue, "T=14 checksum mismatch");
        return Err(ProtocolError::ChecksumError);
    }
    Ok(Bytes::from(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::script::ScriptedIo;

    fn with_checksum(mut bytes: Vec<u8>) -> Vec<u8> {
        let sum = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        bytes.push(sum);
        bytes
    }

    #[test]
    fn test_build_command() {
        let frame = build_command([0x01, 0x02, 0x00, 0x00, 0x00], &[0xAA, 0xBB]).unwrap();
        assert_eq!(frame.as_ref(), &[0x01, 0x02, 0x00, 0x00, 0x00, 0x02, 0xAA, 0xBB, 0x10]);
        assert!(build_command([0; 5], &[0u8; 256]).is_err());
    }

    #[test]
    fn test_transfer() {
        let response = with_checksum(vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x11, 0x22, 0x33]);
        let mut io = ScriptedIo::new();
        io.push(response.clone());
        let frame = build_command([0x01, 0x02, 0x00, 0x00, 0x00], &[]).unwrap();
        let got = transfer(&mut io, &frame, 1000, 10).unwrap();
        assert_eq!(got.as_ref(), response.as_slice());
        assert_eq!(io.written(), &[frame.to_vec()]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut response = with_checksum(vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x11]);
        response[8] ^= 0x04;
        let mut io = ScriptedIo::new();
        io.push(response);
        assert_eq!(
            transfer(&mut io, &[0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03], 1000, 10),
            Err(ProtocolError::ChecksumError)
        );
    }
}
