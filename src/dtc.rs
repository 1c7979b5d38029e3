/*!
Diagnostic trouble code manager (J1939 flavor).

A DTC is identified by its SPN/FMI pair and packed on the wire as 32 bits:
SPN (19 bits, split low/mid/high), FMI (5 bits), occurrence count (7 bits)
and the conversion-method bit. The manager keeps up to `MAX_DTCS` entries,
each ACTIVE or STORED, and aggregates the malfunction lamp as the highest
severity among ACTIVE entries (RED > AMBER_FLASH > AMBER > OFF).

DM1 (active codes) is rate limited to one emission per second; DM2 carries
the previously-active (STORED) set and has no limiter because it is only
produced on request.

Payload layout (both DM1 and DM2):
  byte 0: lamp fields, 2 bits each: [MIL | RedStop | Amber | Protect]
  byte 1: reserved 0xFF
  then 4 bytes per code: [SPN low] [SPN mid] [SPN hi<<5 | FMI] [CM<<7 | OC]
  no codes: one FF FF FF FF placeholder; always padded to 8 bytes minimum.
*/

use log::debug;

use crate::error::{Error, Result};

pub const MAX_DTCS: usize = 32;

/// Interval below which repeated DM1 requests are suppressed.
pub const DM1_RATE_LIMIT_MS: u64 = 1000;

/// Lamp severity attached to a DTC, ordered for MIL aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LampSeverity {
    #[default]
    Off,
    Amber,
    AmberFlash,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtcState {
    Active,
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcEntry {
    pub spn: u32,
    pub fmi: u8,
    pub lamp: LampSeverity,
    pub occurrence_count: u8,
    pub first_time_us: u64,
    pub last_time_us: u64,
    pub state: DtcState,
}

impl DtcEntry {
    /// Pack into the 4-byte wire form.
    pub fn encode(&self) -> [u8; 4] {
        let spn = self.spn & 0x7FFFF;
        [
            (spn & 0xFF) as u8,
            (spn >> 8 & 0xFF) as u8,
            ((spn >> 16 & 0x07) as u8) << 5 | (self.fmi & 0x1F),
            self.occurrence_count & 0x7F,
        ]
    }
}

/// Decode the 4-byte wire form back to (spn, fmi, oc, cm).
pub fn decode_dtc(bytes: &[u8; 4]) -> (u32, u8, u8, bool) {
    let spn = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2] >> 5) << 16;
    let fmi = bytes[2] & 0x1F;
    let oc = bytes[3] & 0x7F;
    let cm = bytes[3] & 0x80 != 0;
    (spn, fmi, oc, cm)
}

pub struct DtcManager {
    entries: heapless::Vec<DtcEntry, MAX_DTCS>,
    last_dm1_us: Option<u64>,
}

impl Default for DtcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DtcManager {
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            last_dm1_us: None,
        }
    }

    /// Raise (or re-raise) a trouble code. Re-raising an ACTIVE entry
    /// increments its occurrence count (saturating at the 7-bit wire cap);
    /// re-raising a STORED entry reactivates it.
    pub fn set_active(&mut self, spn: u32, fmi: u8, lamp: LampSeverity, now_us: u64) -> Result<()> {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.spn == spn && e.fmi == fmi)
        {
            if e.state == DtcState::Active {
                e.occurrence_count = (e.occurrence_count + 1).min(0x7F);
            } else {
                e.state = DtcState::Active;
            }
            e.lamp = lamp;
            e.last_time_us = now_us;
            return Ok(());
        }
        let entry = DtcEntry {
            spn,
            fmi,
            lamp,
            occurrence_count: 1,
            first_time_us: now_us,
            last_time_us: now_us,
            state: DtcState::Active,
        };
        self.entries.push(entry).map_err(|_| Error::NoSpace)?;
        debug!("dtc raised: spn {spn} fmi {fmi}");
        Ok(())
    }

    /// Move an active code to the STORED (previously-active) set.
    pub fn clear(&mut self, spn: u32, fmi: u8, now_us: u64) -> Result<()> {
        let e = self
            .entries
            .iter_mut()
            .find(|e| e.spn == spn && e.fmi == fmi && e.state == DtcState::Active)
            .ok_or(Error::NotFound)?;
        e.state = DtcState::Stored;
        e.last_time_us = now_us;
        Ok(())
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == DtcState::Active)
            .count()
    }

    pub fn entries(&self) -> &[DtcEntry] {
        &self.entries
    }

    /// Aggregated malfunction lamp: highest severity among ACTIVE codes.
    pub fn mil_status(&self) -> LampSeverity {
        self.entries
            .iter()
            .filter(|e| e.state == DtcState::Active)
            .map(|e| e.lamp)
            .max()
            .unwrap_or(LampSeverity::Off)
    }

    /// Build the DM1 payload if the rate limiter allows an emission at
    /// `now_us`; `None` while suppressed.
    pub fn build_dm1(&mut self, now_us: u64) -> Option<heapless::Vec<u8, 64>> {
        if let Some(last) = self.last_dm1_us {
            if now_us.saturating_sub(last) < DM1_RATE_LIMIT_MS * 1000 {
                return None;
            }
        }
        self.last_dm1_us = Some(now_us);
        Some(self.format(DtcState::Active))
    }

    /// DM2: previously-active codes, produced on request (no limiter).
    pub fn build_dm2(&self) -> heapless::Vec<u8, 64> {
        self.format(DtcState::Stored)
    }

    fn format(&self, state: DtcState) -> heapless::Vec<u8, 64> {
        let mut out: heapless::Vec<u8, 64> = heapless::Vec::new();

        // Lamp byte: 2-bit fields [MIL | RedStop | Amber | Protect]. The
        // red-stop field mirrors RED, the amber field mirrors the two amber
        // severities; protect is unused by this manager.
        let mil = self.mil_status();
        let mil_bits: u8 = match mil {
            LampSeverity::Off => 0b00,
            _ => 0b01,
        };
        let redstop_bits: u8 = if mil == LampSeverity::Red { 0b01 } else { 0b00 };
        let amber_bits: u8 = match mil {
            LampSeverity::Amber | LampSeverity::AmberFlash => 0b01,
            _ => 0b00,
        };
        let _ = out.push(mil_bits << 6 | redstop_bits << 4 | amber_bits << 2);
        let _ = out.push(0xFF);

        let mut any = false;
        for e in self.entries.iter().filter(|e| e.state == state) {
            if out.extend_from_slice(&e.encode()).is_err() {
                // Payload cap reached; remaining codes wait for the next
                // emission cycle.
                break;
            }
            any = true;
        }
        if !any {
            let _ = out.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        }
        while out.len() < 8 {
            let _ = out.push(0xFF);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let e = DtcEntry {
            spn: 0x7_ABCD & 0x7FFFF,
            fmi: 19,
            lamp: LampSeverity::Amber,
            occurrence_count: 5,
            first_time_us: 0,
            last_time_us: 0,
            state: DtcState::Active,
        };
        let bytes = e.encode();
        let (spn, fmi, oc, cm) = decode_dtc(&bytes);
        assert_eq!(spn, e.spn);
        assert_eq!(fmi, 19);
        assert_eq!(oc, 5);
        assert!(!cm);
    }

    #[test]
    fn reraise_increments_occurrence() {
        let mut m = DtcManager::new();
        m.set_active(100, 3, LampSeverity::Amber, 0).unwrap();
        m.set_active(100, 3, LampSeverity::Amber, 10).unwrap();
        m.set_active(100, 3, LampSeverity::Amber, 20).unwrap();
        let e = m.entries()[0];
        assert_eq!(e.occurrence_count, 3);
        assert_eq!(e.first_time_us, 0);
        assert_eq!(e.last_time_us, 20);
        assert_eq!(m.entries().len(), 1);
    }

    #[test]
    fn lamp_priority_tracks_highest_active() {
        // Three codes with AMBER, RED, AMBER_FLASH: MIL reports RED; after
        // clearing the RED entry it falls back to AMBER_FLASH.
        let mut m = DtcManager::new();
        m.set_active(1, 1, LampSeverity::Amber, 0).unwrap();
        m.set_active(2, 2, LampSeverity::Red, 0).unwrap();
        m.set_active(3, 3, LampSeverity::AmberFlash, 0).unwrap();
        assert_eq!(m.mil_status(), LampSeverity::Red);

        m.clear(2, 2, 10).unwrap();
        assert_eq!(m.mil_status(), LampSeverity::AmberFlash);
    }

    #[test]
    fn cleared_codes_move_to_stored_and_reactivate() {
        let mut m = DtcManager::new();
        m.set_active(7, 4, LampSeverity::Amber, 0).unwrap();
        m.clear(7, 4, 5).unwrap();
        assert_eq!(m.active_count(), 0);
        assert_eq!(m.entries().len(), 1);

        m.set_active(7, 4, LampSeverity::Amber, 10).unwrap();
        assert_eq!(m.active_count(), 1);
        // Reactivation does not bump the count; only re-raises while active do.
        assert_eq!(m.entries()[0].occurrence_count, 1);
    }

    #[test]
    fn full_table_returns_nomem() {
        let mut m = DtcManager::new();
        for spn in 0..MAX_DTCS as u32 {
            m.set_active(spn, 0, LampSeverity::Amber, 0).unwrap();
        }
        assert_eq!(
            m.set_active(9999, 0, LampSeverity::Amber, 0),
            Err(Error::NoSpace)
        );
    }

    #[test]
    fn empty_dm1_is_padding_frame() {
        let mut m = DtcManager::new();
        let p = m.build_dm1(0).unwrap();
        assert_eq!(p.len(), 8);
        assert_eq!(p[0], 0x00); // all lamps off
        assert_eq!(&p[2..6], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn dm1_packs_lamps_and_codes() {
        let mut m = DtcManager::new();
        m.set_active(520_192, 12, LampSeverity::Red, 0).unwrap();
        let p = m.build_dm1(0).unwrap();
        // MIL on + red-stop on.
        assert_eq!(p[0], 0b01_01_00_00);
        let (spn, fmi, oc, _) = decode_dtc(&[p[2], p[3], p[4], p[5]]);
        assert_eq!(spn, 520_192);
        assert_eq!(fmi, 12);
        assert_eq!(oc, 1);
    }

    #[test]
    fn dm1_rate_limit_suppresses_within_a_second() {
        let mut m = DtcManager::new();
        assert!(m.build_dm1(0).is_some());
        assert!(m.build_dm1(999_999).is_none());
        assert!(m.build_dm1(1_000_000).is_some());
    }

    #[test]
    fn dm2_reports_stored_set_only() {
        let mut m = DtcManager::new();
        m.set_active(10, 1, LampSeverity::Amber, 0).unwrap();
        m.set_active(20, 2, LampSeverity::Amber, 0).unwrap();
        m.clear(10, 1, 5).unwrap();

        let p = m.build_dm2();
        let (spn, ..) = decode_dtc(&[p[2], p[3], p[4], p[5]]);
        assert_eq!(spn, 10);
        // Exactly one stored code follows the header.
        assert_eq!(p.len(), 8);
    }
}
