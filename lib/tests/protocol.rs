//! Drives the pure protocol pieces together the way the robot actor does.

use novadrill::codec::{self, COMPLETION_MARKER, FRAME_HEADER_LEN, SHOT_RECORD_LEN};
use novadrill::handshake::{Challenge, salted_digest};
use novadrill::{
    ConnectionState, DrillLibrary, DrillLookup, Handshake, HandshakeStage, HandshakeStep, Level,
};

#[test]
fn handshake_walks_connection_states_in_order() {
    let mut hs = Handshake::new();
    let mut states = vec![ConnectionState::from(hs.stage())];
    let notifications: [&[u8]; 4] = [b"NOVA01NV2024000001A7K3", b"\x01", b"\x02", b"\x03"];
    let mut sent = Vec::new();
    for n in notifications {
        match hs.advance(n) {
            HandshakeStep::Reply { packet, next } => {
                sent.push(packet);
                states.push(next.into());
            }
            HandshakeStep::Ignored => panic!("notification ignored"),
        }
    }

    assert_eq!(
        states,
        vec![
            ConnectionState::Handshake,
            ConnectionState::Auth1,
            ConnectionState::Auth2,
            ConnectionState::Auth3,
            ConnectionState::Ready,
        ]
    );
    let digest = salted_digest("NV2024000001", "A7K3");
    let mut expected = codec::HANDSHAKE_RESPONSE_HEADER.to_vec();
    expected.extend_from_slice(digest.as_bytes());
    assert_eq!(sent[0], expected);
    assert_eq!(sent[3], codec::READY_ANNOUNCE.to_vec());
}

#[test]
fn reset_restarts_at_challenge() {
    let mut hs = Handshake::new();
    hs.advance(b"NOVA01NV2024000001A7K3");
    hs.advance(&[]);
    assert_eq!(hs.stage(), HandshakeStage::Auth2);
    hs.reset();
    assert_eq!(hs.stage(), HandshakeStage::Challenge);
    assert_eq!(hs.advance(&[1, 0, 0]), HandshakeStep::Ignored);
}

#[test]
fn challenge_with_multibyte_text_splits_on_characters() {
    let c = Challenge::parse("NOVA01ÄBCDEFGHIJKLcode".as_bytes()).unwrap();
    assert_eq!(c.serial, "ÄBCDEFGHIJKL");
    assert_eq!(c.code, "code");
}

#[test]
fn builtin_drill_batches_frame_every_active_step() {
    let lib = DrillLibrary::builtin();
    let drill = lib.drill("loop(f)-drive(f)-drive(b)").unwrap();
    let steps = drill.active_steps(Level::Intermediate);
    let shots: Vec<_> = steps
        .iter()
        .filter_map(|s| s.active_variants().next())
        .collect();
    let packet = codec::build_fire_packet(shots.iter().copied()).unwrap();

    assert_eq!(packet.len(), FRAME_HEADER_LEN + 3 * SHOT_RECORD_LEN);
    assert_eq!(codec::fire_packet_len(&packet), Some(3));
    assert!(!codec::contains_completion_marker(&packet));
}

#[test]
fn completion_marker_is_detected_in_longer_notifications() {
    let mut notification = vec![0x10, 0x20];
    notification.extend_from_slice(&COMPLETION_MARKER);
    notification.push(0x99);
    assert!(codec::contains_completion_marker(&notification));
    assert_eq!(codec::hex(&COMPLETION_MARKER), "00020300050100");
}
