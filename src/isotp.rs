/*!
ISO 15765-2 transport channel: segmentation and reassembly over CAN.

Frame types, distinguished by the top nibble of byte 0:
- Single Frame (0): up to 7 payload bytes, length in the low nibble.
- First Frame (1): 12-bit total length, 6 payload bytes, opens a reception
  and triggers an immediate Flow Control answer.
- Consecutive Frame (2): 4-bit sequence number cycling 1..15,0,1..; 7
  payload bytes each. A wrong sequence number aborts the reception.
- Flow Control (3): status CTS/WAIT/OVERFLOW plus the receiver's block
  size (CFs between FCs, 0 = unlimited) and STmin (minimum CF separation
  in ms, which the *sender* must honor).

One channel handles one transfer at a time, either direction. `on_frame`
feeds inbound frames; `poll` drives paced transmission and the N_Bs (FC
wait) / N_Cr (CF wait) timeouts. Outbound frames leave through a caller
supplied `FrameSink`, so the channel never touches the platform directly.
Timeout or protocol violation resets the channel to idle with no partial
state left behind; the error names what happened.
*/

use log::{debug, trace};

use crate::error::{Error, Result};

/// Largest message a 12-bit First Frame length can announce.
pub const ISOTP_MAX_PAYLOAD: usize = 4095;

pub type IsoTpPayload = heapless::Vec<u8, ISOTP_MAX_PAYLOAD>;

const SF_MAX: usize = 7;
const FF_DATA: usize = 6;
const CF_DATA: usize = 7;

const TYPE_SF: u8 = 0x0;
const TYPE_FF: u8 = 0x1;
const TYPE_CF: u8 = 0x2;
const TYPE_FC: u8 = 0x3;

const FC_CTS: u8 = 0x0;
const FC_WAIT: u8 = 0x1;
const FC_OVERFLOW: u8 = 0x2;

/// Outbound frame sink; implemented for closures so tests and transports
/// can capture frames without a dedicated type.
pub trait FrameSink {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(u32, &[u8]) -> Result<()>,
{
    fn send(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self(id, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpConfig {
    /// Identifier we transmit with.
    pub tx_id: u32,
    /// Identifier we listen on.
    pub rx_id: u32,
    /// Block size we request as receiver. 0 = no intermediate FCs.
    pub block_size: u8,
    /// STmin we request as receiver, in ms.
    pub st_min_ms: u8,
    /// Sender-side wait for a Flow Control frame.
    pub n_bs_ms: u32,
    /// Receiver-side wait for the next Consecutive Frame.
    pub n_cr_ms: u32,
}

impl IsoTpConfig {
    pub fn new(tx_id: u32, rx_id: u32) -> Self {
        Self {
            tx_id,
            rx_id,
            block_size: 0,
            st_min_ms: 0,
            n_bs_ms: 1000,
            n_cr_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Idle,
    /// First Frame sent, waiting for the peer's Flow Control.
    TxWaitFc,
    /// Cleared to send Consecutive Frames.
    TxSending,
    /// Paused by a WAIT Flow Control.
    TxPaused,
    RxReceiving,
}

pub struct IsoTpChannel {
    config: IsoTpConfig,
    state: State,

    // Transmit side.
    tx_buf: IsoTpPayload,
    tx_offset: usize,
    tx_sn: u8,
    /// CFs left before the peer owes us another FC; `None` = unlimited.
    tx_credit: Option<u8>,
    tx_st_min_ms: u8,
    next_cf_at_us: u64,
    fc_deadline_us: u64,

    // Receive side.
    rx_buf: IsoTpPayload,
    rx_expected: usize,
    rx_sn: u8,
    rx_since_fc: u8,
    cf_deadline_us: u64,
}

impl IsoTpChannel {
    pub fn new(config: IsoTpConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            tx_buf: heapless::Vec::new(),
            tx_offset: 0,
            tx_sn: 0,
            tx_credit: None,
            tx_st_min_ms: 0,
            next_cf_at_us: 0,
            fc_deadline_us: 0,
            rx_buf: heapless::Vec::new(),
            rx_expected: 0,
            rx_sn: 0,
            rx_since_fc: 0,
            cf_deadline_us: 0,
        }
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    fn reset(&mut self) {
        self.state = State::Idle;
        self.tx_buf.clear();
        self.tx_offset = 0;
        self.rx_buf.clear();
        self.rx_expected = 0;
    }

    /// Begin transmitting `payload`. Short payloads leave as one Single
    /// Frame immediately; longer ones send the First Frame and wait for
    /// flow control. `WouldBlock` when a transfer is already in flight.
    pub fn send<S: FrameSink>(&mut self, now_us: u64, payload: &[u8], sink: &mut S) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::WouldBlock);
        }
        if payload.is_empty() || payload.len() > ISOTP_MAX_PAYLOAD {
            return Err(Error::InvalidArgument);
        }

        if payload.len() <= SF_MAX {
            let mut frame: heapless::Vec<u8, 8> = heapless::Vec::new();
            let _ = frame.push(payload.len() as u8); // TYPE_SF << 4 | len
            let _ = frame.extend_from_slice(payload);
            return sink.send(self.config.tx_id, &frame);
        }

        self.tx_buf.clear();
        self.tx_buf
            .extend_from_slice(payload)
            .map_err(|_| Error::NoSpace)?;
        let len = payload.len();
        let frame = [
            TYPE_FF << 4 | (len >> 8) as u8,
            (len & 0xFF) as u8,
            payload[0],
            payload[1],
            payload[2],
            payload[3],
            payload[4],
            payload[5],
        ];
        sink.send(self.config.tx_id, &frame)?;
        self.tx_offset = FF_DATA;
        self.tx_sn = 1;
        self.state = State::TxWaitFc;
        self.fc_deadline_us = now_us + u64::from(self.config.n_bs_ms) * 1000;
        Ok(())
    }

    /// Feed one inbound frame addressed to this channel. Returns a
    /// complete reassembled payload when one finishes.
    pub fn on_frame<S: FrameSink>(
        &mut self,
        now_us: u64,
        data: &[u8],
        sink: &mut S,
    ) -> Result<Option<IsoTpPayload>> {
        let Some(&first) = data.first() else {
            return Err(Error::InvalidArgument);
        };
        match first >> 4 {
            TYPE_SF => self.on_single(data),
            TYPE_FF => self.on_first(now_us, data, sink).map(|_| None),
            TYPE_CF => self.on_consecutive(now_us, data, sink),
            TYPE_FC => self.on_flow_control(now_us, data).map(|_| None),
            _ => Err(Error::InvalidArgument),
        }
    }

    fn on_single(&mut self, data: &[u8]) -> Result<Option<IsoTpPayload>> {
        let len = usize::from(data[0] & 0x0F);
        if len == 0 || len > SF_MAX || data.len() < 1 + len {
            return Err(Error::InvalidArgument);
        }
        if self.state == State::RxReceiving {
            // A new transfer preempts a stalled reassembly.
            debug!("isotp: single frame preempts in-flight reception");
            self.reset();
        }
        let mut payload = IsoTpPayload::new();
        let _ = payload.extend_from_slice(&data[1..1 + len]);
        Ok(Some(payload))
    }

    fn on_first<S: FrameSink>(&mut self, now_us: u64, data: &[u8], sink: &mut S) -> Result<()> {
        if data.len() < 8 {
            return Err(Error::InvalidArgument);
        }
        let announced = usize::from(data[0] & 0x0F) << 8 | usize::from(data[1]);
        if announced <= SF_MAX {
            return Err(Error::InvalidArgument);
        }
        if announced > ISOTP_MAX_PAYLOAD {
            sink.send(self.config.tx_id, &[TYPE_FC << 4 | FC_OVERFLOW, 0, 0])?;
            return Err(Error::NoSpace);
        }

        self.rx_buf.clear();
        let _ = self.rx_buf.extend_from_slice(&data[2..8]);
        self.rx_expected = announced;
        self.rx_sn = 1;
        self.rx_since_fc = 0;
        self.state = State::RxReceiving;
        self.cf_deadline_us = now_us + u64::from(self.config.n_cr_ms) * 1000;

        // Clear-to-send with our BS and STmin.
        sink.send(
            self.config.tx_id,
            &[
                TYPE_FC << 4 | FC_CTS,
                self.config.block_size,
                self.config.st_min_ms,
            ],
        )
    }

    fn on_consecutive<S: FrameSink>(
        &mut self,
        now_us: u64,
        data: &[u8],
        sink: &mut S,
    ) -> Result<Option<IsoTpPayload>> {
        if self.state != State::RxReceiving {
            trace!("isotp: stray consecutive frame ignored");
            return Ok(None);
        }
        let sn = data[0] & 0x0F;
        if sn != self.rx_sn {
            debug!("isotp: sequence error (got {sn}, wanted {})", self.rx_sn);
            self.reset();
            return Err(Error::InvalidArgument);
        }
        self.rx_sn = (self.rx_sn + 1) & 0x0F;

        let remaining = self.rx_expected - self.rx_buf.len();
        let take = remaining.min(CF_DATA).min(data.len().saturating_sub(1));
        let _ = self.rx_buf.extend_from_slice(&data[1..1 + take]);

        if self.rx_buf.len() >= self.rx_expected {
            let mut payload = IsoTpPayload::new();
            let _ = payload.extend_from_slice(&self.rx_buf[..self.rx_expected]);
            self.reset();
            return Ok(Some(payload));
        }

        self.cf_deadline_us = now_us + u64::from(self.config.n_cr_ms) * 1000;
        self.rx_since_fc += 1;
        if self.config.block_size > 0 && self.rx_since_fc >= self.config.block_size {
            self.rx_since_fc = 0;
            sink.send(
                self.config.tx_id,
                &[
                    TYPE_FC << 4 | FC_CTS,
                    self.config.block_size,
                    self.config.st_min_ms,
                ],
            )?;
        }
        Ok(None)
    }

    fn on_flow_control(&mut self, now_us: u64, data: &[u8]) -> Result<()> {
        if !matches!(self.state, State::TxWaitFc | State::TxPaused | State::TxSending) {
            trace!("isotp: unexpected flow control ignored");
            return Ok(());
        }
        if data.len() < 3 {
            return Err(Error::InvalidArgument);
        }
        match data[0] & 0x0F {
            FC_CTS => {
                let bs = data[1];
                self.tx_credit = (bs > 0).then_some(bs);
                self.tx_st_min_ms = data[2];
                self.next_cf_at_us = now_us;
                self.state = State::TxSending;
                Ok(())
            }
            FC_WAIT => {
                self.state = State::TxPaused;
                self.fc_deadline_us = now_us + u64::from(self.config.n_bs_ms) * 1000;
                Ok(())
            }
            FC_OVERFLOW => {
                debug!("isotp: peer overflow, aborting transmit");
                self.reset();
                Err(Error::NoSpace)
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Drive pacing and timeouts. Call once per engine tick (or faster).
    pub fn poll<S: FrameSink>(&mut self, now_us: u64, sink: &mut S) -> Result<()> {
        match self.state {
            State::Idle => Ok(()),
            State::TxWaitFc | State::TxPaused => {
                if now_us > self.fc_deadline_us {
                    debug!("isotp: N_Bs expired");
                    self.reset();
                    return Err(Error::Timeout);
                }
                Ok(())
            }
            State::RxReceiving => {
                if now_us > self.cf_deadline_us {
                    debug!("isotp: N_Cr expired");
                    self.reset();
                    return Err(Error::Timeout);
                }
                Ok(())
            }
            State::TxSending => self.pump_tx(now_us, sink),
        }
    }

    fn pump_tx<S: FrameSink>(&mut self, now_us: u64, sink: &mut S) -> Result<()> {
        while self.tx_offset < self.tx_buf.len() {
            if now_us < self.next_cf_at_us {
                return Ok(());
            }
            if let Some(credit) = self.tx_credit {
                if credit == 0 {
                    // Block exhausted; the peer owes us another FC.
                    self.state = State::TxWaitFc;
                    self.fc_deadline_us = now_us + u64::from(self.config.n_bs_ms) * 1000;
                    return Ok(());
                }
            }

            let take = (self.tx_buf.len() - self.tx_offset).min(CF_DATA);
            let mut frame: heapless::Vec<u8, 8> = heapless::Vec::new();
            let _ = frame.push(TYPE_CF << 4 | self.tx_sn);
            let _ = frame.extend_from_slice(&self.tx_buf[self.tx_offset..self.tx_offset + take]);
            sink.send(self.config.tx_id, &frame)?;

            self.tx_offset += take;
            self.tx_sn = (self.tx_sn + 1) & 0x0F;
            if let Some(credit) = self.tx_credit.as_mut() {
                *credit -= 1;
            }
            if self.tx_st_min_ms > 0 {
                self.next_cf_at_us = now_us + u64::from(self.tx_st_min_ms) * 1000;
                break; // one frame per poll while paced
            }
        }
        if self.tx_offset >= self.tx_buf.len() {
            self.reset();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture {
        frames: Vec<(u32, Vec<u8>)>,
    }

    impl Capture {
        fn new() -> Self {
            Self { frames: Vec::new() }
        }

        fn sink(&mut self) -> impl FnMut(u32, &[u8]) -> Result<()> + '_ {
            |id, data| {
                self.frames.push((id, data.to_vec()));
                Ok(())
            }
        }
    }

    fn channel() -> IsoTpChannel {
        IsoTpChannel::new(IsoTpConfig::new(0x7E8, 0x7E0))
    }

    #[test]
    fn single_frame_round_trip() {
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &[0x3E, 0x00], &mut cap.sink()).unwrap();
        assert_eq!(cap.frames[0].1, vec![0x02, 0x3E, 0x00]);
        assert!(ch.is_idle());

        let got = ch.on_frame(0, &[0x02, 0x3E, 0x00], &mut cap.sink()).unwrap();
        assert_eq!(got.unwrap().as_slice(), &[0x3E, 0x00]);
    }

    #[test]
    fn twenty_byte_reception_matches_wire_example() {
        // FF announcing 20 bytes, then two CFs; reassembly starts 62 F1 90.
        let mut ch = channel();
        let mut cap = Capture::new();

        let got = ch
            .on_frame(0, &[0x10, 0x14, 0x62, 0xF1, 0x90, 0x31, 0x48, 0x47], &mut cap.sink())
            .unwrap();
        assert!(got.is_none());
        // CTS went out immediately.
        assert_eq!(cap.frames[0].1[0], 0x30);

        let got = ch
            .on_frame(1_000, &[0x21, 0x42, 0x48, 0x34, 0x31, 0x4A, 0x58, 0x4D], &mut cap.sink())
            .unwrap();
        assert!(got.is_none());
        let got = ch
            .on_frame(2_000, &[0x22, 0x4E, 0x31, 0x30, 0x39, 0x31, 0x38, 0x36], &mut cap.sink())
            .unwrap()
            .expect("complete at 20 bytes");

        assert_eq!(got.len(), 20);
        assert_eq!(&got[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(
            got.as_slice(),
            &[
                0x62, 0xF1, 0x90, 0x31, 0x48, 0x47, 0x42, 0x48, 0x34, 0x31, 0x4A, 0x58, 0x4D,
                0x4E, 0x31, 0x30, 0x39, 0x31, 0x38, 0x36
            ]
        );
        assert!(ch.is_idle());
    }

    #[test]
    fn multi_frame_send_waits_for_cts() {
        // P10 from the transmit side: FF carries 6 bytes, CFs 7 each.
        let payload: Vec<u8> = (0..20u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();

        ch.send(0, &payload, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 1);
        assert_eq!(cap.frames[0].1[..2], [0x10, 0x14]);
        assert_eq!(&cap.frames[0].1[2..], &payload[..6]);

        // Nothing moves until flow control arrives.
        ch.poll(100, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 1);

        ch.on_frame(200, &[0x30, 0x00, 0x00], &mut cap.sink()).unwrap();
        ch.poll(300, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 3);
        assert_eq!(cap.frames[1].1[0], 0x21);
        assert_eq!(&cap.frames[1].1[1..], &payload[6..13]);
        assert_eq!(cap.frames[2].1[0], 0x22);
        assert_eq!(&cap.frames[2].1[1..], &payload[13..20]);
        assert!(ch.is_idle());
    }

    #[test]
    fn sequence_numbers_wrap_fifteen_to_zero() {
        // 6 + 16*7 = 118 bytes: SNs run 1..=15, 0, 1.
        let payload: Vec<u8> = (0..118u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();
        ch.on_frame(0, &[0x30, 0x00, 0x00], &mut cap.sink()).unwrap();
        ch.poll(0, &mut cap.sink()).unwrap();

        let sns: Vec<u8> = cap.frames[1..].iter().map(|(_, f)| f[0] & 0x0F).collect();
        assert_eq!(sns.len(), 16);
        assert_eq!(sns[13], 14);
        assert_eq!(sns[14], 15);
        assert_eq!(sns[15], 0);
    }

    #[test]
    fn wrong_sequence_number_aborts() {
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.on_frame(0, &[0x10, 0x14, 1, 2, 3, 4, 5, 6], &mut cap.sink())
            .unwrap();
        // SN 2 arrives where 1 was expected.
        let err = ch
            .on_frame(100, &[0x22, 0, 0, 0, 0, 0, 0, 0], &mut cap.sink())
            .unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
        assert!(ch.is_idle());
    }

    #[test]
    fn block_size_requests_fc_between_blocks() {
        let mut cfg = IsoTpConfig::new(0x7E8, 0x7E0);
        cfg.block_size = 2;
        let mut ch = IsoTpChannel::new(cfg);
        let mut cap = Capture::new();

        // 6 + 4*7 = 34 bytes announced.
        ch.on_frame(0, &[0x10, 0x22, 0, 0, 0, 0, 0, 0], &mut cap.sink())
            .unwrap();
        ch.on_frame(1, &[0x21, 0, 0, 0, 0, 0, 0, 0], &mut cap.sink()).unwrap();
        ch.on_frame(2, &[0x22, 0, 0, 0, 0, 0, 0, 0], &mut cap.sink()).unwrap();

        // Initial CTS plus one mid-transfer CTS after the 2-CF block.
        let fcs: Vec<_> = cap
            .frames
            .iter()
            .filter(|(_, f)| f[0] >> 4 == 0x3)
            .collect();
        assert_eq!(fcs.len(), 2);
        assert_eq!(fcs[1].1[1], 2); // advertised BS rides along
    }

    #[test]
    fn sender_honors_block_size_and_stmin() {
        let payload: Vec<u8> = (0..34u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();

        // CTS with BS=2, STmin=10 ms.
        ch.on_frame(0, &[0x30, 0x02, 0x0A], &mut cap.sink()).unwrap();

        // STmin pacing: the first poll sends exactly one CF.
        ch.poll(0, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 2);
        ch.poll(5_000, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 2); // inside STmin window
        ch.poll(10_000, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 3);

        // Block exhausted: sender stops until the next FC.
        ch.poll(20_000, &mut cap.sink()).unwrap();
        ch.poll(30_000, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 3);

        ch.on_frame(30_000, &[0x30, 0x02, 0x00], &mut cap.sink()).unwrap();
        ch.poll(30_001, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 5);
        assert!(ch.is_idle());
    }

    #[test]
    fn wait_flow_control_defers_until_cts() {
        let payload: Vec<u8> = (0..20u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();

        ch.on_frame(100, &[0x31, 0x00, 0x00], &mut cap.sink()).unwrap(); // WAIT
        ch.poll(200, &mut cap.sink()).unwrap();
        assert_eq!(cap.frames.len(), 1);

        ch.on_frame(300, &[0x30, 0x00, 0x00], &mut cap.sink()).unwrap();
        ch.poll(400, &mut cap.sink()).unwrap();
        assert!(ch.is_idle());
        assert_eq!(cap.frames.len(), 3);
    }

    #[test]
    fn overflow_flow_control_aborts_transmit() {
        let payload: Vec<u8> = (0..20u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();

        let err = ch
            .on_frame(100, &[0x32, 0x00, 0x00], &mut cap.sink())
            .unwrap_err();
        assert_eq!(err, Error::NoSpace);
        assert!(ch.is_idle());
    }

    #[test]
    fn n_bs_timeout_frees_the_channel() {
        let payload: Vec<u8> = (0..20u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();

        ch.poll(999_000, &mut cap.sink()).unwrap();
        let err = ch.poll(1_000_001, &mut cap.sink()).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(ch.is_idle());

        // Channel is reusable immediately.
        ch.send(1_100_000, &[1, 2, 3], &mut cap.sink()).unwrap();
    }

    #[test]
    fn n_cr_timeout_aborts_reception() {
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.on_frame(0, &[0x10, 0x14, 1, 2, 3, 4, 5, 6], &mut cap.sink())
            .unwrap();
        let err = ch.poll(1_000_001, &mut cap.sink()).unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(ch.is_idle());
    }

    #[test]
    fn busy_channel_rejects_concurrent_send() {
        let payload: Vec<u8> = (0..20u8).collect();
        let mut ch = channel();
        let mut cap = Capture::new();
        ch.send(0, &payload, &mut cap.sink()).unwrap();
        assert_eq!(
            ch.send(1, &[1, 2, 3], &mut cap.sink()),
            Err(Error::WouldBlock)
        );
    }

    #[test]
    fn oversize_first_frame_answers_overflow() {
        let mut ch = channel();
        let mut cap = Capture::new();
        // 12-bit length field cannot exceed 4095, so overflow is only
        // reachable through the explicit bound check; announce exactly the
        // cap to confirm acceptance instead.
        ch.on_frame(0, &[0x1F, 0xFF, 1, 2, 3, 4, 5, 6], &mut cap.sink())
            .unwrap();
        assert!(!ch.is_idle());
        assert_eq!(cap.frames[0].1[0], 0x30);
    }
}
