//! Challenge-response authentication run right after link-up.
//!
//! The robot answers the start packet with a text challenge carrying its
//! serial and a one-time code. We reply with an MD5 of the serial, a salt
//! expansion of the serial, and the code; then three more notifications are
//! acknowledged in turn before the link is usable.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::codec;

const SALT: &[u8; 36] = b"Mjgx1jAwXDBaMFcxCz3JBgNVBAYT4kJF7Rkw";
const SERIAL_OFFSET: usize = 6;
const SERIAL_LEN: usize = 12;
const CODE_OFFSET: usize = SERIAL_OFFSET + SERIAL_LEN;

/// Position in the authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStage {
    Challenge,
    Auth1,
    Auth2,
    Auth3,
    Complete,
}

/// Result of feeding one notification to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send this packet; the machine has advanced to `next`.
    Reply { packet: Vec<u8>, next: HandshakeStage },
    /// Notification was not a usable challenge. Nothing sent, no transition.
    Ignored,
}

/// Serial and code extracted from the challenge notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub serial: String,
    pub code: String,
}

impl Challenge {
    /// Parse the challenge text. Anything of 18 UTF-16 units or fewer is not
    /// a challenge. The device sends ASCII; offsets and the salt index are
    /// taken in UTF-16 units.
    pub fn parse(notification: &[u8]) -> Option<Self> {
        let units: Vec<u16> = String::from_utf8_lossy(notification).encode_utf16().collect();
        if units.len() <= CODE_OFFSET {
            return None;
        }
        Some(Self {
            serial: String::from_utf16_lossy(&units[SERIAL_OFFSET..CODE_OFFSET]),
            code: String::from_utf16_lossy(&units[CODE_OFFSET..]),
        })
    }
}

/// Lowercase hex MD5 of `serial + salt(serial) + code`.
pub fn salted_digest(serial: &str, code: &str) -> String {
    let mut input = String::with_capacity(serial.len() * 2 + code.len());
    input.push_str(serial);
    for unit in serial.encode_utf16() {
        input.push(SALT[unit as usize % SALT.len()] as char);
    }
    input.push_str(code);

    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The reply to a challenge: response header followed by the ASCII digest.
pub fn challenge_response(challenge: &Challenge) -> Vec<u8> {
    let digest = salted_digest(&challenge.serial, &challenge.code);
    let mut packet = codec::HANDSHAKE_RESPONSE_HEADER.to_vec();
    packet.extend_from_slice(digest.as_bytes());
    packet
}

/// Strictly linear authentication state machine. Pure: the caller owns the
/// link and sends whatever `advance` returns.
#[derive(Debug, Clone)]
pub struct Handshake {
    stage: HandshakeStage,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            stage: HandshakeStage::Challenge,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    pub fn is_complete(&self) -> bool {
        self.stage == HandshakeStage::Complete
    }

    pub fn reset(&mut self) {
        self.stage = HandshakeStage::Challenge;
    }

    /// Feed one notification from the robot.
    pub fn advance(&mut self, notification: &[u8]) -> HandshakeStep {
        let (packet, next) = match self.stage {
            HandshakeStage::Challenge => match Challenge::parse(notification) {
                Some(challenge) => (challenge_response(&challenge), HandshakeStage::Auth1),
                None => return HandshakeStep::Ignored,
            },
            HandshakeStage::Auth1 => (codec::AUTH_ACK_1.to_vec(), HandshakeStage::Auth2),
            HandshakeStage::Auth2 => (codec::AUTH_ACK_2.to_vec(), HandshakeStage::Auth3),
            HandshakeStage::Auth3 => (codec::READY_ANNOUNCE.to_vec(), HandshakeStage::Complete),
            HandshakeStage::Complete => return HandshakeStep::Ignored,
        };
        self.stage = next;
        HandshakeStep::Reply { packet, next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &[u8] = b"NOVA01AAAAAAAAAAAAXYZ";

    #[test]
    fn parses_serial_and_code() {
        let c = Challenge::parse(CHALLENGE).unwrap();
        assert_eq!(c.serial, "AAAAAAAAAAAA");
        assert_eq!(c.code, "XYZ");
    }

    #[test]
    fn short_challenge_is_rejected() {
        assert!(Challenge::parse(b"NOVA01AAAAAAAAAAAA").is_none());
        assert!(Challenge::parse(b"").is_none());
    }

    #[test]
    fn digest_is_deterministic() {
        let a = salted_digest("AAAAAAAAAAAA", "XYZ");
        let b = salted_digest("AAAAAAAAAAAA", "XYZ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, salted_digest("AAAAAAAAAAAA", "XYW"));
    }

    #[test]
    fn digest_matches_manual_expansion() {
        // 'A' is 65; 65 % 36 = 29 -> SALT[29] = 'k'
        let expected: String = Md5::digest(b"AAAAAAAAAAAAkkkkkkkkkkkkXYZ")
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(salted_digest("AAAAAAAAAAAA", "XYZ"), expected);
    }

    #[test]
    fn non_ascii_serial_salts_by_utf16_unit() {
        // 'é' is 0xE9 = 233; 233 % 36 = 17 -> SALT[17] = 'z'
        let expected: String = Md5::digest("ézX".as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(salted_digest("é", "X"), expected);

        let c = Challenge::parse("NOVA01ééééééAAAAAAXYZ".as_bytes()).unwrap();
        assert_eq!(c.serial, "ééééééAAAAAA");
        assert_eq!(c.code, "XYZ");
    }

    #[test]
    fn full_exchange_is_linear() {
        let mut hs = Handshake::new();

        let HandshakeStep::Reply { packet, next } = hs.advance(CHALLENGE) else {
            panic!("challenge ignored");
        };
        assert_eq!(next, HandshakeStage::Auth1);
        assert_eq!(&packet[..3], &[0x08, 0x20, 0x00]);
        assert_eq!(packet.len(), 3 + 32);

        assert_eq!(
            hs.advance(b"whatever"),
            HandshakeStep::Reply {
                packet: vec![1, 0, 0],
                next: HandshakeStage::Auth2
            }
        );
        assert_eq!(
            hs.advance(&[]),
            HandshakeStep::Reply {
                packet: vec![2, 0, 0],
                next: HandshakeStage::Auth3
            }
        );
        assert_eq!(
            hs.advance(&[0xFF]),
            HandshakeStep::Reply {
                packet: vec![0x80, 1, 0, 0],
                next: HandshakeStage::Complete
            }
        );
        assert!(hs.is_complete());
        assert_eq!(hs.advance(CHALLENGE), HandshakeStep::Ignored);
    }

    #[test]
    fn malformed_challenge_stalls() {
        let mut hs = Handshake::new();
        assert_eq!(hs.advance(b"short"), HandshakeStep::Ignored);
        assert_eq!(hs.stage(), HandshakeStage::Challenge);
    }
}
