/*!
Protocol drivers: one trait, one message shape, per-protocol contexts.

A driver translates between raw bus frames and signal events. The engine
talks to every protocol through the same surface:

- `decode(now, msg, out)`: inbound frame to zero or more `SignalEvent`s, in
  the order the frame carries them. Unknown addresses decode to nothing.
- `encode(events)`: pack a set of events into one outbound message (used by
  request/response paths; the cyclic path goes through the cache instead).
- `get_cyclic(now, out)`: due periodic traffic, encoded from the driver's
  own cache of recent signal values.
- `update_signal(signal, value, ts)`: feed that cache. The engine calls
  this for every `OutputEvent` routed at the protocol.

Drivers own all their state; nothing here is shared between drivers, and
none of these calls block.
*/

pub mod canopen;
pub mod j1939;

pub use canopen::CanOpenDriver;
pub use j1939::J1939Driver;

use crate::error::Result;
use crate::signal::SignalEvent;

/// Upper bound on decoded events per inbound frame (a PDO carries at most
/// 8 mapped signals; J1939 maps are smaller).
pub const MAX_EVENTS_PER_FRAME: usize = 16;
/// Upper bound on cyclic messages returned by one `get_cyclic` call.
pub const MAX_CYCLIC_MESSAGES: usize = 8;

pub type EventBuf = heapless::Vec<SignalEvent, MAX_EVENTS_PER_FRAME>;
pub type MessageBuf = heapless::Vec<ProtocolMessage, MAX_CYCLIC_MESSAGES>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        /// 29-bit identifier on the wire.
        const EXTENDED_ID = 1 << 0;
        /// Remote transmission request.
        const REMOTE = 1 << 1;
        /// Addressed to every node (NMT broadcast, global LSS).
        const BROADCAST = 1 << 2;
    }
}

/// A protocol-level message: a bus address plus up to 64 data bytes.
/// Classical CAN uses the first 8; ISO-TP reassembly and DM1 with several
/// trouble codes use the rest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolMessage {
    pub address: u32,
    pub data: heapless::Vec<u8, 64>,
    pub timestamp_us: u64,
    pub flags: MessageFlags,
}

impl ProtocolMessage {
    pub fn new(address: u32, data: &[u8], timestamp_us: u64, flags: MessageFlags) -> Self {
        let mut msg = Self {
            address,
            data: heapless::Vec::new(),
            timestamp_us,
            flags,
        };
        let take = data.len().min(64);
        let _ = msg.data.extend_from_slice(&data[..take]);
        msg
    }

    pub fn extended(address: u32, data: &[u8], timestamp_us: u64) -> Self {
        Self::new(address, data, timestamp_us, MessageFlags::EXTENDED_ID)
    }

    pub fn standard(address: u32, data: &[u8], timestamp_us: u64) -> Self {
        Self::new(address, data, timestamp_us, MessageFlags::empty())
    }
}

/// The capability set every protocol driver implements.
pub trait ProtocolDriver: Send {
    fn name(&self) -> &'static str;

    /// Decode one inbound message into signal events appended to `out`.
    /// Returns the number of events produced. A frame for an unmapped
    /// address is not an error; it simply yields zero events.
    fn decode(&mut self, now_us: u64, msg: &ProtocolMessage, out: &mut EventBuf) -> Result<usize>;

    /// Pack `events` into a single outbound message.
    fn encode(&mut self, events: &[SignalEvent]) -> Result<ProtocolMessage>;

    /// Collect all periodic traffic due at `now_us`.
    fn get_cyclic(&mut self, now_us: u64, out: &mut MessageBuf) -> usize;

    /// Update the driver's signal cache used by the cyclic encoders.
    fn update_signal(&mut self, signal: u32, value: i32, timestamp_us: u64);
}
