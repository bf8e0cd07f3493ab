//! Block protocol framing: bincode header (fixed-int) followed by the raw segment payload.
//! Also the small fixed records the protocol stamps into beacons and the child SSID.

use serde::{Deserialize, Serialize};

/// Block exchange phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Quit,
    Init,
    Data,
    Done,
}

/// Header of every block protocol packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockHeader {
    /// Phase negotiation; in `Init` it carries our capacity, length and checksum.
    Command {
        ack: bool,
        turn: bool,
        phase: Phase,
        checksum: u8,
        recv_max: u32,
        send_len: u32,
    },
    /// Data phase: `request` is the index we want next, `index` the one carried.
    Segment { turn: bool, request: u16, index: u16 },
}

/// Encoded size of `BlockHeader::Command`.
pub const COMMAND_LEN: usize = 19;
/// Encoded size of `BlockHeader::Segment`; the payload follows immediately.
pub const SEGMENT_HEADER_LEN: usize = 9;

/// Encode a header plus payload into one packet no larger than `capacity`.
pub fn encode_packet(header: &BlockHeader, payload: &[u8], capacity: usize) -> Result<Vec<u8>, WireError> {
    let mut out = bincode::serialize(header).map_err(WireError::Encode)?;
    if out.len() + payload.len() > capacity {
        return Err(WireError::TooLarge);
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode the header at the front of `bytes`. Returns it with the trailing payload.
pub fn decode_packet(bytes: &[u8]) -> Result<(BlockHeader, &[u8]), WireError> {
    let header: BlockHeader = bincode::deserialize(bytes).map_err(WireError::Decode)?;
    let used = bincode::serialized_size(&header).map_err(WireError::Decode)? as usize;
    Ok((header, &bytes[used.min(bytes.len())..]))
}

/// Beacon user info: length of the block the advertiser will send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconFormat {
    pub send_length: u32,
}

/// Child SSID record: version tag and the GGID the child declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsidFormat {
    pub header: [u8; 4],
    pub ggid: u32,
}

pub const SSID_HEADER: [u8; 4] = *b"WXC1";

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(record).map_err(WireError::Encode)
}

pub fn decode_record<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WireError> {
    bincode::deserialize(bytes).map_err(WireError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("packet exceeds frame capacity")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(bincode::Error),
}
