//! Wire codec for the robot's write characteristic.
//!
//! All multi-byte fields are little-endian. A shot is a fixed 24-byte
//! record; fire commands wrap one or more records in a 7-byte frame.

use crate::shot::{self, ShotParameters};

pub const SHOT_RECORD_LEN: usize = 24;
pub const FRAME_HEADER_LEN: usize = 7;

/// Most records whose payload length still fits the 16-bit length field.
pub const MAX_RECORDS: usize = (u16::MAX as usize - 4) / SHOT_RECORD_LEN;

const CMD_FIRE: u8 = 0x81;
const FIRE_SUBTYPE: u8 = 0x01;
const FIRE_SEQUENCE_ID: u16 = 1;

pub const HANDSHAKE_START: [u8; 4] = [0x07, 0x00, 0x00, 0x00];
pub const HANDSHAKE_RESPONSE_HEADER: [u8; 3] = [0x08, 0x20, 0x00];
pub const AUTH_ACK_1: [u8; 3] = [0x01, 0x00, 0x00];
pub const AUTH_ACK_2: [u8; 3] = [0x02, 0x00, 0x00];
pub const READY_ANNOUNCE: [u8; 4] = [0x80, 0x01, 0x00, 0x00];
pub const STOP: [u8; 4] = [0x80, 0x01, 0x00, 0x01];

/// Sent by the robot when it has finished firing a batch.
pub const COMPLETION_MARKER: [u8; 7] = [0x00, 0x02, 0x03, 0x00, 0x05, 0x01, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Batch of {0} balls exceeds the limit of {MAX_RECORDS}")]
pub struct BatchTooLarge(pub usize);

/// Encode one ball into its 24-byte record.
pub fn encode_shot(params: &ShotParameters) -> [u8; SHOT_RECORD_LEN] {
    let top = shot::clamp_rpm(params.top);
    let bottom = shot::clamp_rpm(params.bottom);
    let height = params.height.clamp(shot::MIN_HEIGHT, shot::MAX_HEIGHT) as f64;
    let drop = params.drop.clamp(shot::MIN_DROP, shot::MAX_DROP);
    let freq = params.freq.clamp(shot::MIN_FREQ, shot::MAX_FREQ) as f64;

    let height_device = (height + 50.0) / 150.0 * 50.0 - 20.0;
    let drop_device = (drop + 10.0) / 20.0 * 44.0 - 22.0;
    let freq_device = freq / 100.0 + 0.5;

    let mut record = [0u8; SHOT_RECORD_LEN];
    record[0..4].copy_from_slice(&top.to_le_bytes());
    record[4..8].copy_from_slice(&bottom.to_le_bytes());
    record[8..12].copy_from_slice(&(height_device as f32).to_le_bytes());
    record[12..16].copy_from_slice(&(drop_device as f32).to_le_bytes());
    record[16..20].copy_from_slice(&(freq_device as f32).to_le_bytes());
    record[20..24].copy_from_slice(&params.reps.max(shot::MIN_REPS).to_le_bytes());
    record
}

/// Frame N shot records into one fire command.
pub fn build_framed_packet(records: &[[u8; SHOT_RECORD_LEN]]) -> Result<Vec<u8>, BatchTooLarge> {
    let payload_len = u16::try_from(4 + SHOT_RECORD_LEN * records.len())
        .map_err(|_| BatchTooLarge(records.len()))?;
    let mut packet = Vec::with_capacity(FRAME_HEADER_LEN + SHOT_RECORD_LEN * records.len());
    packet.push(CMD_FIRE);
    packet.extend_from_slice(&payload_len.to_le_bytes());
    packet.push(FIRE_SUBTYPE);
    packet.extend_from_slice(&FIRE_SEQUENCE_ID.to_le_bytes());
    packet.push(0x00);
    for record in records {
        packet.extend_from_slice(record);
    }
    Ok(packet)
}

/// Encode and frame a batch of shots.
pub fn build_fire_packet<'a>(
    shots: impl IntoIterator<Item = &'a ShotParameters>,
) -> Result<Vec<u8>, BatchTooLarge> {
    let records: Vec<_> = shots.into_iter().map(encode_shot).collect();
    build_framed_packet(&records)
}

pub fn build_stop_packet() -> Vec<u8> {
    STOP.to_vec()
}

pub fn build_handshake_start() -> Vec<u8> {
    HANDSHAKE_START.to_vec()
}

/// Number of shot records a fire packet announces, if `data` is one.
pub fn fire_packet_len(data: &[u8]) -> Option<usize> {
    if data.len() < FRAME_HEADER_LEN || data[0] != CMD_FIRE {
        return None;
    }
    let payload_len = u16::from_le_bytes([data[1], data[2]]) as usize;
    payload_len.checked_sub(4).map(|n| n / SHOT_RECORD_LEN)
}

/// True if a notification reports a finished batch.
pub fn contains_completion_marker(notification: &[u8]) -> bool {
    notification
        .windows(COMPLETION_MARKER.len())
        .any(|w| w == COMPLETION_MARKER)
}

/// Uppercase hex without separators, for the audit log.
pub fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02X}");
            s
        })
}
