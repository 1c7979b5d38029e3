//! Shared test utilities: wire-frame and pipeline builders.
//!
//! These helpers de-duplicate CAN frame construction across the engine,
//! protocol and transport test suites. They intentionally cover just what
//! the tests need (broadcast J1939 frames, ISO-TP segment framing, an
//! engine over a simulated platform).

#![allow(dead_code)]

use std::sync::Arc;

use crate::engine::Engine;
use crate::pal::CanFrame;
use crate::pal::sim::SimPlatform;
use crate::protocol::j1939::{PGN_EEC1, PGN_ET1, can_id};

/// An engine on a fresh simulated platform, plus the platform handle for
/// injection and assertions.
pub fn sim_engine() -> (Engine, Arc<SimPlatform>) {
    let platform = Arc::new(SimPlatform::new());
    let engine = Engine::new(platform.clone());
    (engine, platform)
}

/// EEC1 broadcast frame from raw field values (torque byte, rpm LE word).
pub fn eec1_frame(torque_raw: u8, rpm_raw: u16, source: u8) -> CanFrame {
    let rpm = rpm_raw.to_le_bytes();
    CanFrame::new(
        can_id(6, PGN_EEC1, 0xFF, source),
        true,
        &[0xFF, 0xFF, torque_raw, rpm[0], rpm[1], 0xFF, 0xFF, 0xFF],
    )
}

/// ET1 broadcast frame from the raw coolant byte.
pub fn et1_frame(coolant_raw: u8, source: u8) -> CanFrame {
    CanFrame::new(
        can_id(6, PGN_ET1, 0xFF, source),
        true,
        &[coolant_raw, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
    )
}

/// ISO-TP single frame around a short payload.
pub fn isotp_sf(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 7);
    let mut v = vec![payload.len() as u8];
    v.extend_from_slice(payload);
    v
}

/// ISO-TP first frame announcing `total` bytes, carrying the first six.
pub fn isotp_ff(total: usize, first_six: &[u8; 6]) -> Vec<u8> {
    let mut v = vec![0x10 | (total >> 8) as u8, (total & 0xFF) as u8];
    v.extend_from_slice(first_six);
    v
}

/// ISO-TP consecutive frame with the given sequence number.
pub fn isotp_cf(sn: u8, chunk: &[u8]) -> Vec<u8> {
    assert!(chunk.len() <= 7);
    let mut v = vec![0x20 | (sn & 0x0F)];
    v.extend_from_slice(chunk);
    v
}
