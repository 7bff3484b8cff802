//! Protocol and Parameters Selection
//!
//! A PPS request is at most six bytes: PPSS, PPS0, optional PPS1..PPS3 and
//! PCK. Requests and responses are carried in a `[u8; 6]` with unused tail
//! bytes left at zero; [`pps_len`] gives the significant length.

use tracing::debug;

use crate::error::{ProtocolError, Result};

/// Initial character of every PPS frame
pub const PPSS: u8 = 0xFF;
/// Largest PPS frame
pub const MAX_PPS_LEN: usize = 6;

const PPS1_PRESENT: u8 = 0x10;
const PPS2_PRESENT: u8 = 0x20;
const PPS3_PRESENT: u8 = 0x40;

/// Parameters requested from the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsParams {
    /// Protocol type
    pub protocol: u8,
    /// Fi/Di indices as carried in PPS1 (`Fi << 4 | Di`)
    pub fd: Option<u8>,
    /// PPS2 (SPU)
    pub spu: Option<u8>,
    /// PPS3, reserved for future use
    pub pps3: Option<u8>,
}

impl PpsParams {
    /// Request `protocol` with the default parameters
    pub const fn new(protocol: u8) -> Self {
        Self {
            protocol,
            fd: None,
            spu: None,
            pps3: None,
        }
    }

    /// Request specific Fi/Di indices
    pub const fn with_fd(mut self, fi_index: u8, di_index: u8) -> Self {
        self.fd = Some((fi_index << 4) | (di_index & 0x0F));
        self
    }

    /// Request an SPU setting
    pub const fn with_spu(mut self, spu: u8) -> Self {
        self.spu = Some(spu);
        self
    }
}

/// Parameters confirmed by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsInfo {
    /// Negotiated protocol type
    pub protocol: u8,
    /// Clock rate conversion index
    pub f_int: u8,
    /// Baud rate adjustment index
    pub d_int: u8,
    /// Confirmed SPU, if any
    pub spu: Option<u8>,
}

/// A completed negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsExchange {
    /// Bytes sent to the card
    pub request: [u8; MAX_PPS_LEN],
    /// Bytes returned by the card
    pub response: [u8; MAX_PPS_LEN],
    /// Negotiated parameters
    pub info: PpsInfo,
}

/// Significant length of a PPS frame with the given PPS0
pub const fn pps_len(pps0: u8) -> usize {
    3 + (pps0 & (PPS1_PRESENT | PPS2_PRESENT | PPS3_PRESENT)).count_ones() as usize
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build the request frame
pub fn build_pps_request(target: PpsParams) -> [u8; MAX_PPS_LEN] {
    let mut frame = [0u8; MAX_PPS_LEN];
    frame[0] = PPSS;
    let mut pps0 = target.protocol & 0x0F;
    let mut len = 2;
    for (flag, value) in [
        (PPS1_PRESENT, target.fd),
        (PPS2_PRESENT, target.spu),
        (PPS3_PRESENT, target.pps3),
    ] {
        if let Some(byte) = value {
            pps0 |= flag;
            frame[len] = byte;
            len += 1;
        }
    }
    frame[1] = pps0;
    frame[len] = xor(&frame[..len]);
    frame
}

/// Check a caller supplied request and return its significant length
pub fn check_request(request: &[u8]) -> Result<usize> {
    if request.len() < 3 || request[0] != PPSS {
        return Err(ProtocolError::PpsRejected("malformed request"));
    }
    let len = pps_len(request[1]);
    if request.len() < len || xor(&request[..len]) != 0 {
        return Err(ProtocolError::PpsRejected("request check byte"));
    }
    Ok(len)
}

/// Validate the card's answer against the request
///
/// Each optional byte must either be echoed unchanged or omitted; a response
/// may never carry a byte the request did not.
pub fn parse_pps_response(request: &[u8], response: &[u8]) -> Result<PpsInfo> {
    let req_len = check_request(request)?;
    let request = &request[..req_len];

    if response.len() < 3 {
        return Err(ProtocolError::PpsRejected("response truncated"));
    }
    if response[0] != PPSS {
        return Err(ProtocolError::PpsRejected("response PPSS"));
    }
    let resp_len = pps_len(response[1]);
    if response.len() < resp_len {
        return Err(ProtocolError::PpsRejected("response truncated"));
    }
    let response = &response[..resp_len];
    if xor(response) != 0 {
        return Err(ProtocolError::PpsRejected("response check byte"));
    }
    let (req0, resp0) = (request[1], response[1]);
    if req0 & 0x0F != resp0 & 0x0F {
        return Err(ProtocolError::PpsRejected("protocol mismatch"));
    }

    let mut req_pos = 2;
    let mut resp_pos = 2;
    let mut echoed = [None; 3];
    for (slot, flag) in [PPS1_PRESENT, PPS2_PRESENT, PPS3_PRESENT].into_iter().enumerate() {
        let in_request = req0 & flag != 0;
        let in_response = resp0 & flag != 0;
        match (in_request, in_response) {
            (true, true) => {
                if request[req_pos] != response[resp_pos] {
                    return Err(ProtocolError::PpsRejected("parameter changed"));
                }
                echoed[slot] = Some(response[resp_pos]);
            }
            (false, true) => return Err(ProtocolError::PpsRejected("unrequested parameter")),
            _ => {}
        }
        req_pos += usize::from(in_request);
        resp_pos += usize::from(in_response);
    }

    let (f_int, d_int) = echoed[0].map_or((1, 1), |fd| (fd >> 4, fd & 0x0F));
    let info = PpsInfo {
        protocol: resp0 & 0x0F,
        f_int,
        d_int,
        spu: echoed[1],
    };
    debug!(protocol = info.protocol, f_int, d_int, "PPS confirmed");
    Ok(info)
}
