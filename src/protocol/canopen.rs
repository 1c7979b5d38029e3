/*!
CANopen protocol driver (classical 11-bit addressing).

COB-ID layout: [function_code:4][node_id:7]. The driver models one device
node: it consumes NMT commands, SYNC pulses, RPDOs, expedited SDO requests
and LSS configuration, and produces TPDOs, heartbeat, emergency frames and
SDO/LSS responses.

State kept here:
- `nmt_state`: PRE-OPERATIONAL / OPERATIONAL / STOPPED. PDO exchange and
  heartbeat run in OPERATIONAL only.
- `sync_counter`: total SYNC pulses seen; each TPDO with a SYNC-N
  transmission type counts pulses independently.
- `lss_state`: WAITING / CONFIGURATION. Node-id reconfiguration is only
  accepted in CONFIGURATION, and only for ids 1..=127 or 255 (the
  "unconfigured" marker).
- A three-entry object dictionary behind expedited SDO: device type
  (0x1000, ro), error register (0x1001, ro), heartbeat period (0x1017, rw).

Responses (SDO, LSS) are queued internally and drained by `get_cyclic`, so
`decode` never needs a transmit path.
*/

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{EventBuf, MessageBuf, ProtocolDriver, ProtocolMessage};
use crate::signal::{SignalEvent, SignalStatus};

pub const FC_NMT: u32 = 0x000;
pub const FC_SYNC: u32 = 0x080;
pub const FC_EMCY: u32 = 0x080; // EMCY = 0x080 + node id
pub const FC_TPDO1: u32 = 0x180;
pub const FC_RPDO1: u32 = 0x200;
pub const FC_SDO_TX: u32 = 0x580;
pub const FC_SDO_RX: u32 = 0x600;
pub const FC_HEARTBEAT: u32 = 0x700;
pub const LSS_RX: u32 = 0x7E5;
pub const LSS_TX: u32 = 0x7E4;

pub const MAX_PDOS: usize = 4;
pub const MAX_MAPPINGS: usize = 8;
pub const CACHE_SLOTS: usize = 64;

pub fn function_code(id: u32) -> u32 {
    id & 0x780
}

pub fn node_of(id: u32) -> u8 {
    (id & 0x7F) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtState {
    #[default]
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    /// Wire encoding used in heartbeat frames.
    pub fn wire(self) -> u8 {
        match self {
            NmtState::PreOperational => 0x7F,
            NmtState::Operational => 0x05,
            NmtState::Stopped => 0x04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LssState {
    #[default]
    Waiting,
    Configuration,
}

/// One mapped value inside a PDO, packed little-endian in mapping order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapping {
    pub signal: u32,
    /// 8, 16 or 32.
    pub bit_length: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpdoTransmission {
    /// Transmit on every Nth SYNC pulse.
    SyncN(u8),
    /// Transmit when the event timer expires, but never inside the inhibit
    /// window of the previous transmission.
    EventDriven {
        event_time_ms: u32,
        inhibit_time_ms: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoConfig {
    pub mappings: heapless::Vec<PdoMapping, MAX_MAPPINGS>,
}

impl PdoConfig {
    pub fn new(mappings: &[PdoMapping]) -> Result<Self> {
        let mut v: heapless::Vec<PdoMapping, MAX_MAPPINGS> = heapless::Vec::new();
        let mut bits = 0u32;
        for m in mappings {
            if !matches!(m.bit_length, 8 | 16 | 32) {
                return Err(Error::InvalidArgument);
            }
            bits += u32::from(m.bit_length);
            v.push(*m).map_err(|_| Error::NoSpace)?;
        }
        if bits > 64 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self { mappings: v })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TpdoSlot {
    config: PdoConfig,
    transmission: TpdoTransmission,
    syncs_seen: u8,
    last_tx_us: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CachedSignal {
    value: i32,
    valid: bool,
}

pub struct CanOpenDriver {
    node_id: u8,
    nmt_state: NmtState,
    lss_state: LssState,
    sync_counter: u32,
    heartbeat_period_ms: u16,
    last_heartbeat_us: Option<u64>,
    emcy_pending: Option<(u16, u8)>,
    error_register: u8,
    device_type: u32,
    rpdos: heapless::Vec<Option<PdoConfig>, MAX_PDOS>,
    tpdos: heapless::Vec<Option<TpdoSlot>, MAX_PDOS>,
    pending_tx: heapless::Vec<ProtocolMessage, 4>,
    cache: [CachedSignal; CACHE_SLOTS],
}

impl CanOpenDriver {
    pub fn new(node_id: u8, heartbeat_period_ms: u16) -> Self {
        let mut rpdos = heapless::Vec::new();
        let mut tpdos = heapless::Vec::new();
        for _ in 0..MAX_PDOS {
            let _ = rpdos.push(None);
            let _ = tpdos.push(None);
        }
        Self {
            node_id: node_id & 0x7F,
            nmt_state: NmtState::PreOperational,
            lss_state: LssState::Waiting,
            sync_counter: 0,
            heartbeat_period_ms,
            last_heartbeat_us: None,
            emcy_pending: None,
            error_register: 0,
            device_type: 0x0001_0192, // profile 402 style device type
            rpdos,
            tpdos,
            pending_tx: heapless::Vec::new(),
            cache: [CachedSignal::default(); CACHE_SLOTS],
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    pub fn lss_state(&self) -> LssState {
        self.lss_state
    }

    pub fn sync_counter(&self) -> u32 {
        self.sync_counter
    }

    pub fn set_rpdo(&mut self, index: usize, config: PdoConfig) -> Result<()> {
        let slot = self.rpdos.get_mut(index).ok_or(Error::InvalidArgument)?;
        *slot = Some(config);
        Ok(())
    }

    pub fn set_tpdo(
        &mut self,
        index: usize,
        config: PdoConfig,
        transmission: TpdoTransmission,
    ) -> Result<()> {
        let slot = self.tpdos.get_mut(index).ok_or(Error::InvalidArgument)?;
        *slot = Some(TpdoSlot {
            config,
            transmission,
            syncs_seen: 0,
            last_tx_us: None,
        });
        Ok(())
    }

    /// Latch an emergency; the next `get_cyclic` emits it once.
    pub fn raise_emergency(&mut self, code: u16, error_register: u8) {
        self.error_register = error_register;
        self.emcy_pending = Some((code, error_register));
    }

    fn handle_nmt(&mut self, data: &[u8]) {
        let (Some(&command), Some(&target)) = (data.first(), data.get(1)) else {
            return;
        };
        if target != 0 && target != self.node_id {
            return;
        }
        let next = match command {
            0x01 => NmtState::Operational,
            0x02 => NmtState::Stopped,
            0x80 | 0x81 | 0x82 => NmtState::PreOperational,
            _ => return,
        };
        if next != self.nmt_state {
            debug!("canopen node {} nmt {:?} -> {:?}", self.node_id, self.nmt_state, next);
        }
        self.nmt_state = next;
    }

    fn handle_sync(&mut self) {
        self.sync_counter = self.sync_counter.wrapping_add(1);
        for slot in self.tpdos.iter_mut().flatten() {
            if matches!(slot.transmission, TpdoTransmission::SyncN(_)) {
                slot.syncs_seen = slot.syncs_seen.saturating_add(1);
            }
        }
    }

    fn decode_rpdo(
        &mut self,
        now_us: u64,
        pdo_index: usize,
        data: &[u8],
        out: &mut EventBuf,
    ) -> Result<usize> {
        let Some(Some(config)) = self.rpdos.get(pdo_index) else {
            return Ok(0);
        };
        let mut produced = 0;
        let mut bit = 0usize;
        for m in config.mappings.iter() {
            let bytes = usize::from(m.bit_length / 8);
            let at = bit / 8;
            if at + bytes > data.len() {
                break; // short PDO: keep what we already decoded
            }
            let mut raw: u32 = 0;
            for (i, &b) in data[at..at + bytes].iter().enumerate() {
                raw |= u32::from(b) << (8 * i);
            }
            let value = match m.bit_length {
                8 => i32::from(raw as u8),
                16 => i32::from(raw as u16),
                _ => raw as i32,
            };
            out.push(SignalEvent {
                signal: m.signal,
                value,
                status: SignalStatus::Ok,
                timestamp_us: now_us,
            })
            .map_err(|_| Error::NoSpace)?;
            produced += 1;
            bit += usize::from(m.bit_length);
        }
        Ok(produced)
    }

    fn handle_sdo(&mut self, now_us: u64, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let command = data[0];
        let index = u16::from(data[1]) | u16::from(data[2]) << 8;
        let sub = data[3];
        let tx_id = FC_SDO_TX | u32::from(self.node_id);

        let respond = |payload: [u8; 8], pending: &mut heapless::Vec<ProtocolMessage, 4>| {
            let _ = pending.push(ProtocolMessage::standard(tx_id, &payload, now_us));
        };

        match command >> 5 {
            // Upload request (read).
            0x02 => {
                let (resp_cmd, value): (u8, u32) = match (index, sub) {
                    (0x1000, 0) => (0x43, self.device_type),
                    (0x1001, 0) => (0x4F, u32::from(self.error_register)),
                    (0x1017, 0) => (0x4B, u32::from(self.heartbeat_period_ms)),
                    _ => {
                        respond(
                            sdo_abort(index, sub, 0x0602_0000),
                            &mut self.pending_tx,
                        );
                        return;
                    }
                };
                let v = value.to_le_bytes();
                respond(
                    [resp_cmd, data[1], data[2], sub, v[0], v[1], v[2], v[3]],
                    &mut self.pending_tx,
                );
            }
            // Expedited download (write).
            0x01 => {
                match (index, sub) {
                    (0x1017, 0) => {
                        if data.len() >= 6 {
                            self.heartbeat_period_ms =
                                u16::from(data[4]) | u16::from(data[5]) << 8;
                        }
                        respond(
                            [0x60, data[1], data[2], sub, 0, 0, 0, 0],
                            &mut self.pending_tx,
                        );
                    }
                    (0x1000, 0) | (0x1001, 0) => {
                        // Read-only objects.
                        respond(
                            sdo_abort(index, sub, 0x0601_0002),
                            &mut self.pending_tx,
                        );
                    }
                    _ => {
                        respond(
                            sdo_abort(index, sub, 0x0602_0000),
                            &mut self.pending_tx,
                        );
                    }
                }
            }
            _ => trace!("canopen: unsupported sdo command {command:#x}"),
        }
    }

    fn handle_lss(&mut self, now_us: u64, data: &[u8]) {
        let Some(&cs) = data.first() else {
            return;
        };
        match cs {
            // Switch state global.
            0x04 => {
                self.lss_state = match data.get(1) {
                    Some(1) => LssState::Configuration,
                    _ => LssState::Waiting,
                };
            }
            // Configure node-id, CONFIGURATION state only.
            0x11 => {
                if self.lss_state != LssState::Configuration {
                    return;
                }
                let requested = data.get(1).copied().unwrap_or(0);
                let ok = matches!(requested, 1..=127 | 255);
                if ok && requested != 255 {
                    debug!("canopen node id {} -> {}", self.node_id, requested);
                    self.node_id = requested;
                }
                let err: u8 = if ok { 0 } else { 1 };
                let _ = self.pending_tx.push(ProtocolMessage::standard(
                    LSS_TX,
                    &[0x11, err, 0, 0, 0, 0, 0, 0],
                    now_us,
                ));
            }
            _ => {}
        }
    }

    fn build_pdo_data(&self, config: &PdoConfig) -> heapless::Vec<u8, 8> {
        let mut data: heapless::Vec<u8, 8> = heapless::Vec::new();
        for m in config.mappings.iter() {
            let value = self
                .cache
                .get(m.signal as usize)
                .filter(|c| c.valid)
                .map(|c| c.value)
                .unwrap_or(0);
            let bytes = usize::from(m.bit_length / 8);
            let le = (value as u32).to_le_bytes();
            for &b in le.iter().take(bytes) {
                if data.push(b).is_err() {
                    return data;
                }
            }
        }
        data
    }
}

fn sdo_abort(index: u16, sub: u8, code: u32) -> [u8; 8] {
    let c = code.to_le_bytes();
    [
        0x80,
        (index & 0xFF) as u8,
        (index >> 8) as u8,
        sub,
        c[0],
        c[1],
        c[2],
        c[3],
    ]
}

impl ProtocolDriver for CanOpenDriver {
    fn name(&self) -> &'static str {
        "canopen"
    }

    fn decode(&mut self, now_us: u64, msg: &ProtocolMessage, out: &mut EventBuf) -> Result<usize> {
        let id = msg.address & 0x7FF;

        if id == FC_NMT {
            self.handle_nmt(&msg.data);
            return Ok(0);
        }
        if id == FC_SYNC {
            self.handle_sync();
            return Ok(0);
        }
        if id == LSS_RX {
            self.handle_lss(now_us, &msg.data);
            return Ok(0);
        }

        let fc = function_code(id);
        let node = node_of(id);
        if node != self.node_id {
            return Ok(0);
        }
        match fc {
            FC_RPDO1 | 0x300 | 0x400 | 0x500 => {
                let pdo_index = ((fc - FC_RPDO1) >> 8) as usize;
                self.decode_rpdo(now_us, pdo_index, &msg.data, out)
            }
            FC_SDO_RX => {
                self.handle_sdo(now_us, &msg.data);
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    fn encode(&mut self, events: &[SignalEvent]) -> Result<ProtocolMessage> {
        // Find the TPDO carrying the first event's signal and pack the
        // current cache (updated with the given events) into it.
        let first = events.first().ok_or(Error::InvalidArgument)?;
        for ev in events {
            self.update_signal(ev.signal, ev.value, ev.timestamp_us);
        }
        for (i, slot) in self.tpdos.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if slot
                .config
                .mappings
                .iter()
                .any(|m| m.signal == first.signal)
            {
                let data = self.build_pdo_data(&slot.config);
                let id = FC_TPDO1 + (i as u32) * 0x100 | u32::from(self.node_id);
                return Ok(ProtocolMessage::standard(id, &data, first.timestamp_us));
            }
        }
        Err(Error::NotFound)
    }

    fn get_cyclic(&mut self, now_us: u64, out: &mut MessageBuf) -> usize {
        let mut produced = 0;

        // Queued SDO/LSS responses go first; they are answers, not cycles.
        let mut sent = 0;
        for msg in self.pending_tx.iter() {
            if out.push(msg.clone()).is_err() {
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            let len = self.pending_tx.len();
            for i in sent..len {
                let m = self.pending_tx[i].clone();
                self.pending_tx[i - sent] = m;
            }
            self.pending_tx.truncate(len - sent);
            produced += sent;
        }
        if !self.pending_tx.is_empty() {
            // Out of room mid-drain: the rest waits for the next call.
            return produced;
        }

        // Emergency: one shot, highest urgency after responses.
        if let Some((code, err)) = self.emcy_pending.take() {
            let id = FC_EMCY | u32::from(self.node_id);
            let c = code.to_le_bytes();
            let msg = ProtocolMessage::standard(id, &[c[0], c[1], err, 0, 0, 0, 0, 0], now_us);
            if out.push(msg).is_err() {
                self.emcy_pending = Some((code, err));
                return produced;
            }
            produced += 1;
        }

        if self.nmt_state != NmtState::Operational {
            return produced;
        }

        // Heartbeat, OPERATIONAL only.
        if self.heartbeat_period_ms > 0 {
            let due = match self.last_heartbeat_us {
                None => true,
                Some(last) => {
                    now_us.saturating_sub(last) >= u64::from(self.heartbeat_period_ms) * 1000
                }
            };
            if due {
                let id = FC_HEARTBEAT | u32::from(self.node_id);
                let msg =
                    ProtocolMessage::standard(id, &[self.nmt_state.wire()], now_us);
                if out.push(msg).is_ok() {
                    self.last_heartbeat_us = Some(now_us);
                    produced += 1;
                }
            }
        }

        // TPDOs.
        for i in 0..self.tpdos.len() {
            let Some(slot) = &self.tpdos[i] else { continue };
            let due = match slot.transmission {
                TpdoTransmission::SyncN(n) => n > 0 && slot.syncs_seen >= n,
                TpdoTransmission::EventDriven {
                    event_time_ms,
                    inhibit_time_ms,
                } => {
                    let since = slot
                        .last_tx_us
                        .map(|l| now_us.saturating_sub(l))
                        .unwrap_or(u64::MAX);
                    since >= u64::from(event_time_ms) * 1000
                        && since >= u64::from(inhibit_time_ms) * 1000
                }
            };
            if !due {
                continue;
            }
            let data = self.build_pdo_data(&slot.config);
            let id = FC_TPDO1 + (i as u32) * 0x100 | u32::from(self.node_id);
            let msg = ProtocolMessage::standard(id, &data, now_us);
            if out.push(msg).is_err() {
                break;
            }
            if let Some(slot) = self.tpdos[i].as_mut() {
                slot.syncs_seen = 0;
                slot.last_tx_us = Some(now_us);
            }
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
