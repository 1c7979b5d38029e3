/*!
J1939 protocol driver.

Identifier layout (29-bit): [prio:3][EDP:1][DP:1][PF:8][PS:8][SA:8], with
PGN = (EDP<<17)|(DP<<16)|(PF<<8)|(PS when PF >= 240, else 0). PDU1 PGNs
(PF < 240) carry a destination address in PS instead.

Decoding is table-driven: a `DecodeMap` binds a PGN to up to eight signal
fields, each an 8- or 16-bit little-endian quantity with a milli-scale and
offset (the SAE "resolution + offset" pattern: raw * scale / 1000 +
offset). Built-in constructors cover the engine PGNs this system consumes;
arbitrary maps can be added at init.

Encoding inverts the same transform over the driver's signal cache, with
0xFF fill for unmapped bytes and for signals the cache has never seen
("not available" per SAE). Each `EncodeMap` has its own period and
transmits when due.

DM1/DM2 payloads come from the DTC manager; this driver only wraps them in
the right PGN and priority.
*/

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::{EventBuf, MessageBuf, MessageFlags, ProtocolDriver, ProtocolMessage};
use crate::signal::{SignalEvent, SignalStatus};

/// Electronic engine controller 1: torque and speed.
pub const PGN_EEC1: u32 = 65265;
/// Engine temperature 1: coolant.
pub const PGN_ET1: u32 = 65262;
/// Active diagnostic trouble codes.
pub const PGN_DM1: u32 = 65226;
/// Previously active diagnostic trouble codes.
pub const PGN_DM2: u32 = 65227;
/// PGN request (PDU1): data bytes 0-2 name the wanted PGN, LE.
pub const PGN_REQUEST: u32 = 0xEA00;

/// Signals the cyclic encoders can cache.
pub const CACHE_SLOTS: usize = 64;

pub const MAX_MAPS: usize = 8;
pub const MAX_FIELDS: usize = 8;

/// Extract the PGN from a 29-bit identifier.
pub fn pgn_of(id: u32) -> u32 {
    let pf = id >> 16 & 0xFF;
    let ps = id >> 8 & 0xFF;
    let dp = id >> 24 & 0x01;
    let edp = id >> 25 & 0x01;
    edp << 17 | dp << 16 | pf << 8 | if pf >= 240 { ps } else { 0 }
}

pub fn source_address(id: u32) -> u8 {
    (id & 0xFF) as u8
}

pub fn priority(id: u32) -> u8 {
    (id >> 26 & 0x07) as u8
}

/// Build a 29-bit identifier. `dest` fills PS for PDU1 PGNs and is ignored
/// for broadcast (PDU2) PGNs.
pub fn can_id(priority: u8, pgn: u32, dest: u8, source: u8) -> u32 {
    let pf = pgn >> 8 & 0xFF;
    let ps = if pf >= 240 { pgn & 0xFF } else { u32::from(dest) };
    u32::from(priority & 0x07) << 26
        | (pgn >> 16 & 0x03) << 24
        | pf << 16
        | ps << 8
        | u32::from(source)
}

/// One mapped quantity inside a PGN's 8-byte payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap {
    pub signal: u32,
    pub byte_offset: u8,
    /// 8 or 16 (little-endian).
    pub bit_len: u8,
    /// Milli-scale: decoded = raw * scale_millis / 1000 + offset.
    pub scale_millis: i32,
    pub offset: i32,
}

impl FieldMap {
    fn raw_span(&self) -> usize {
        usize::from(self.byte_offset) + usize::from(self.bit_len / 8)
    }

    fn decode(&self, data: &[u8]) -> Option<i32> {
        let at = usize::from(self.byte_offset);
        let raw: u32 = match self.bit_len {
            8 => u32::from(*data.get(at)?),
            16 => u32::from(*data.get(at)?) | u32::from(*data.get(at + 1)?) << 8,
            _ => return None,
        };
        let wide = i64::from(raw) * i64::from(self.scale_millis) / 1000 + i64::from(self.offset);
        Some(wide.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
    }

    fn encode(&self, value: i32, data: &mut [u8]) {
        if self.scale_millis == 0 {
            return;
        }
        let raw = (i64::from(value) - i64::from(self.offset)) * 1000 / i64::from(self.scale_millis);
        let at = usize::from(self.byte_offset);
        match self.bit_len {
            8 => {
                if let Some(b) = data.get_mut(at) {
                    *b = raw.clamp(0, 0xFF) as u8;
                }
            }
            16 => {
                let raw = raw.clamp(0, 0xFFFF) as u16;
                if data.len() > at + 1 {
                    data[at] = (raw & 0xFF) as u8;
                    data[at + 1] = (raw >> 8) as u8;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeMap {
    pub pgn: u32,
    pub fields: heapless::Vec<FieldMap, MAX_FIELDS>,
}

impl DecodeMap {
    pub fn new(pgn: u32, fields: &[FieldMap]) -> Self {
        let mut v = heapless::Vec::new();
        for f in fields.iter().take(MAX_FIELDS) {
            let _ = v.push(*f);
        }
        Self { pgn, fields: v }
    }

    /// EEC1: actual torque (byte 2, -125% offset, 1%/LSB) and engine speed
    /// (bytes 3-4 LE, 0.125 rpm/LSB).
    pub fn eec1(torque_signal: u32, rpm_signal: u32) -> Self {
        Self::new(
            PGN_EEC1,
            &[
                FieldMap {
                    signal: torque_signal,
                    byte_offset: 2,
                    bit_len: 8,
                    scale_millis: 1000,
                    offset: -125,
                },
                FieldMap {
                    signal: rpm_signal,
                    byte_offset: 3,
                    bit_len: 16,
                    scale_millis: 125,
                    offset: 0,
                },
            ],
        )
    }

    /// ET1: coolant temperature (byte 0, -40 C offset, 1 C/LSB).
    pub fn et1(coolant_signal: u32) -> Self {
        Self::new(
            PGN_ET1,
            &[FieldMap {
                signal: coolant_signal,
                byte_offset: 0,
                bit_len: 8,
                scale_millis: 1000,
                offset: -40,
            }],
        )
    }

    /// Shortest frame this map can decode from. Frames shorter than the
    /// farthest field yield zero events.
    fn min_len(&self) -> usize {
        self.fields.iter().map(|f| f.raw_span()).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeMap {
    pub pgn: u32,
    pub priority: u8,
    /// Destination address for PDU1 PGNs; ignored for broadcast.
    pub dest: u8,
    pub period_ms: u32,
    pub fields: heapless::Vec<FieldMap, MAX_FIELDS>,
    last_tx_us: Option<u64>,
}

impl EncodeMap {
    pub fn new(pgn: u32, priority: u8, period_ms: u32, fields: &[FieldMap]) -> Self {
        let mut v = heapless::Vec::new();
        for f in fields.iter().take(MAX_FIELDS) {
            let _ = v.push(*f);
        }
        Self {
            pgn,
            priority,
            dest: 0xFF,
            period_ms,
            fields: v,
            last_tx_us: None,
        }
    }

    fn due(&self, now_us: u64) -> bool {
        match self.last_tx_us {
            None => true,
            Some(last) => now_us.saturating_sub(last) >= u64::from(self.period_ms) * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CachedSignal {
    value: i32,
    valid: bool,
}

pub struct J1939Driver {
    source_address: u8,
    decode_maps: heapless::Vec<DecodeMap, MAX_MAPS>,
    encode_maps: heapless::Vec<EncodeMap, MAX_MAPS>,
    cache: [CachedSignal; CACHE_SLOTS],
    dm2_requested: bool,
}

impl J1939Driver {
    pub fn new(source_address: u8) -> Self {
        Self {
            source_address,
            decode_maps: heapless::Vec::new(),
            encode_maps: heapless::Vec::new(),
            cache: [CachedSignal::default(); CACHE_SLOTS],
            dm2_requested: false,
        }
    }

    pub fn add_decode_map(&mut self, map: DecodeMap) -> Result<()> {
        self.decode_maps.push(map).map_err(|_| Error::NoSpace)
    }

    pub fn add_encode_map(&mut self, map: EncodeMap) -> Result<()> {
        self.encode_maps.push(map).map_err(|_| Error::NoSpace)
    }

    pub fn source(&self) -> u8 {
        self.source_address
    }

    /// Wrap a DM1/DM2 payload from the DTC manager in its PGN envelope.
    pub fn dm_message(&self, pgn: u32, payload: &[u8], now_us: u64) -> ProtocolMessage {
        ProtocolMessage::extended(can_id(6, pgn, 0xFF, self.source_address), payload, now_us)
    }

    /// True once per received DM2 request; the engine answers it with the
    /// stored-code payload.
    pub fn take_dm2_request(&mut self) -> bool {
        std::mem::take(&mut self.dm2_requested)
    }

    fn cached(&self, signal: u32) -> Option<i32> {
        let slot = self.cache.get(signal as usize)?;
        slot.valid.then_some(slot.value)
    }

    fn build_frame(&self, map: &EncodeMap) -> [u8; 8] {
        let mut data = [0xFF; 8];
        for f in map.fields.iter() {
            if let Some(value) = self.cached(f.signal) {
                f.encode(value, &mut data);
            }
        }
        data
    }
}

impl ProtocolDriver for J1939Driver {
    fn name(&self) -> &'static str {
        "j1939"
    }

    fn decode(&mut self, now_us: u64, msg: &ProtocolMessage, out: &mut EventBuf) -> Result<usize> {
        if !msg.flags.contains(MessageFlags::EXTENDED_ID) {
            // 11-bit traffic is not J1939; not ours.
            return Ok(0);
        }
        let pgn = pgn_of(msg.address);
        if pgn == PGN_REQUEST {
            // Request PGN: only DM2 is served on demand here; anything else
            // is answered by the cyclic schedule or not at all.
            if msg.data.len() >= 3 {
                let wanted = u32::from(msg.data[0])
                    | u32::from(msg.data[1]) << 8
                    | u32::from(msg.data[2]) << 16;
                if wanted == PGN_DM2 {
                    self.dm2_requested = true;
                }
            }
            return Ok(0);
        }
        let Some(map) = self.decode_maps.iter().find(|m| m.pgn == pgn) else {
            return Ok(0);
        };
        if msg.data.len() < map.min_len() {
            trace!("j1939: short frame for pgn {pgn} ({} bytes)", msg.data.len());
            return Ok(0);
        }
        let mut produced = 0;
        for f in map.fields.iter() {
            if let Some(value) = f.decode(&msg.data) {
                let ev = SignalEvent {
                    signal: f.signal,
                    value,
                    status: SignalStatus::Ok,
                    timestamp_us: now_us,
                };
                out.push(ev).map_err(|_| Error::NoSpace)?;
                produced += 1;
            }
        }
        Ok(produced)
    }

    fn encode(&mut self, events: &[SignalEvent]) -> Result<ProtocolMessage> {
        let first = events.first().ok_or(Error::InvalidArgument)?;
        let map = self
            .encode_maps
            .iter()
            .find(|m| m.fields.iter().any(|f| f.signal == first.signal))
            .ok_or(Error::NotFound)?;

        let mut data = [0xFF; 8];
        for ev in events {
            if let Some(f) = map.fields.iter().find(|f| f.signal == ev.signal) {
                f.encode(ev.value, &mut data);
            }
        }
        Ok(ProtocolMessage::extended(
            can_id(map.priority, map.pgn, map.dest, self.source_address),
            &data,
            first.timestamp_us,
        ))
    }

    fn get_cyclic(&mut self, now_us: u64, out: &mut MessageBuf) -> usize {
        let mut produced = 0;
        let source = self.source_address;
        // Collect frames first; the cache borrow and the map iteration are
        // both reads, the deadline update is the only write.
        for i in 0..self.encode_maps.len() {
            if !self.encode_maps[i].due(now_us) {
                continue;
            }
            let frame = self.build_frame(&self.encode_maps[i]);
            let map = &mut self.encode_maps[i];
            let msg = ProtocolMessage::extended(
                can_id(map.priority, map.pgn, map.dest, source),
                &frame,
                now_us,
            );
            if out.push(msg).is_err() {
                break;
            }
            map.last_tx_us = Some(now_us);
            produced += 1;
        }
        produced
    }

    fn update_signal(&mut self, signal: u32, value: i32, _timestamp_us: u64) {
        if let Some(slot) = self.cache.get_mut(signal as usize) {
            *slot = CachedSignal { value, valid: true };
        }
    }
}
