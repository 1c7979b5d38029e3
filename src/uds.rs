/*!
UDS diagnostic server (ISO 14229 subset) on top of the ISO-TP channel.

Services: DiagnosticSessionControl (0x10), SecurityAccess (0x27),
ReadDataByIdentifier (0x22), WriteDataByIdentifier (0x2E), RoutineControl
(0x31) and TesterPresent (0x3E). Dispatch is data-driven: DIDs and routines
are table entries whose handlers are tagged variants, not function
pointers, so the set is fixed at boot and inspectable.

Session rules:
- Non-default sessions expire after `S3` of silence; expiry drops back to
  DEFAULT and relocks security (`periodic` drives this).
- TesterPresent sub-function 0 refreshes the timer; sub-function 0x80 does
  too but suppresses the positive response.

Security access: odd sub-function hands out a 4-byte seed (zeros when
already unlocked), even sub-function takes the key (`seed ^ 0x5A5A5A5A`).
Three bad keys earn `EXCEED_NUMBER_OF_ATTEMPTS` and a 10-second cooldown
during which seed requests fail with `REQUIRED_TIME_DELAY_NOT_EXPIRED`.
Security clears on any session change.

The engine side of diagnostics (signal reads, calibration mode, DTC
clearing) is reached through the `DiagBackend` capability so this module
never holds the engine itself.
*/

use log::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::isotp::{FrameSink, IsoTpChannel, IsoTpConfig};

/// Silence window after which a non-default session decays.
pub const S3_TIMEOUT_MS: u64 = 5_000;
pub const SECURITY_MAX_ATTEMPTS: u8 = 3;
pub const SECURITY_LOCKOUT_MS: u64 = 10_000;
const SECURITY_KEY_MASK: u32 = 0x5A5A_5A5A;

pub const SID_SESSION_CONTROL: u8 = 0x10;
pub const SID_SECURITY_ACCESS: u8 = 0x27;
pub const SID_READ_DID: u8 = 0x22;
pub const SID_WRITE_DID: u8 = 0x2E;
pub const SID_ROUTINE_CONTROL: u8 = 0x31;
pub const SID_TESTER_PRESENT: u8 = 0x3E;

const POSITIVE_OFFSET: u8 = 0x40;
const NEGATIVE_SID: u8 = 0x7F;
const SUPPRESS_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdsSession {
    #[default]
    Default,
    Programming,
    ExtendedDiagnostic,
    SafetySystem,
}

impl UdsSession {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(UdsSession::Default),
            0x02 => Some(UdsSession::Programming),
            0x03 => Some(UdsSession::ExtendedDiagnostic),
            0x04 => Some(UdsSession::SafetySystem),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            UdsSession::Default => 0x01,
            UdsSession::Programming => 0x02,
            UdsSession::ExtendedDiagnostic => 0x03,
            UdsSession::SafetySystem => 0x04,
        }
    }
}

/// Negative response codes this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nrc {
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLength,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceedNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    ServiceNotSupportedInActiveSession,
}

impl Nrc {
    pub fn code(self) -> u8 {
        match self {
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLength => 0x13,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceedNumberOfAttempts => 0x36,
            Nrc::RequiredTimeDelayNotExpired => 0x37,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
        }
    }
}

/// What the diagnostic layer may do to the rest of the system.
pub trait DiagBackend {
    fn signal_value(&self, id: usize) -> Option<i32>;
    fn enter_calibration(&mut self) -> Result<()>;
    fn exit_calibration(&mut self) -> Result<()>;
    fn clear_dtcs(&mut self);
}

impl DiagBackend for Engine {
    fn signal_value(&self, id: usize) -> Option<i32> {
        self.table().value(id)
    }

    fn enter_calibration(&mut self) -> Result<()> {
        self.registry_mut().enter_calibration()
    }

    fn exit_calibration(&mut self) -> Result<()> {
        self.registry_mut().exit_calibration()
    }

    fn clear_dtcs(&mut self) {
        self.dtc_mut().clear_all();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DidHandler {
    /// Fixed identification string (e.g. VIN-style 0xF190).
    Ident(&'static str),
    /// One byte reporting the active session.
    ActiveSession,
    /// Big-endian i32 read of a signal table entry.
    SignalValue(usize),
    /// Small writable scratch object.
    Stored {
        data: heapless::Vec<u8, 16>,
        writable: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidEntry {
    pub did: u16,
    pub handler: DidHandler,
    pub security_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineHandler {
    EnterCalibration,
    ExitCalibration,
    ClearDtcs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineEntry {
    pub id: u16,
    pub handler: RoutineHandler,
    pub security_required: bool,
}

pub type UdsResponse = heapless::Vec<u8, 64>;

pub struct UdsServer {
    channel: IsoTpChannel,
    session: UdsSession,
    security_unlocked: bool,
    last_activity_us: u64,
    pending_seed: Option<u32>,
    seed_state: u32,
    failed_attempts: u8,
    lockout_until_us: Option<u64>,
    dids: heapless::Vec<DidEntry, 16>,
    routines: heapless::Vec<RoutineEntry, 8>,
}

impl UdsServer {
    pub fn new(isotp: IsoTpConfig) -> Self {
        let mut server = Self {
            channel: IsoTpChannel::new(isotp),
            session: UdsSession::Default,
            security_unlocked: false,
            last_activity_us: 0,
            pending_seed: None,
            seed_state: 0xC0FF_EE01,
            failed_attempts: 0,
            lockout_until_us: None,
            dids: heapless::Vec::new(),
            routines: heapless::Vec::new(),
        };
        server.install_builtin_tables();
        server
    }

    fn install_builtin_tables(&mut self) {
        let _ = self.dids.push(DidEntry {
            did: 0xF190,
            handler: DidHandler::Ident("LNB-ECU-0001"),
            security_required: false,
        });
        let _ = self.dids.push(DidEntry {
            did: 0xF186,
            handler: DidHandler::ActiveSession,
            security_required: false,
        });
        let _ = self.routines.push(RoutineEntry {
            id: 0x0200,
            handler: RoutineHandler::EnterCalibration,
            security_required: true,
        });
        let _ = self.routines.push(RoutineEntry {
            id: 0x0201,
            handler: RoutineHandler::ExitCalibration,
            security_required: true,
        });
        let _ = self.routines.push(RoutineEntry {
            id: 0x0202,
            handler: RoutineHandler::ClearDtcs,
            security_required: false,
        });
    }

    pub fn add_did(&mut self, entry: DidEntry) -> Result<()> {
        self.dids
            .push(entry)
            .map_err(|_| crate::error::Error::NoSpace)
    }

    pub fn add_routine(&mut self, entry: RoutineEntry) -> Result<()> {
        self.routines
            .push(entry)
            .map_err(|_| crate::error::Error::NoSpace)
    }

    pub fn session(&self) -> UdsSession {
        self.session
    }

    pub fn security_unlocked(&self) -> bool {
        self.security_unlocked
    }

    /// Feed one raw CAN frame addressed to the server. A complete request
    /// is handled immediately and its response queued back through the
    /// transport.
    pub fn process_frame<S: FrameSink, B: DiagBackend>(
        &mut self,
        now_us: u64,
        frame_data: &[u8],
        backend: &mut B,
        sink: &mut S,
    ) -> Result<()> {
        let completed = self.channel.on_frame(now_us, frame_data, sink)?;
        if let Some(request) = completed {
            self.last_activity_us = now_us;
            if let Some(response) = self.handle_request(now_us, &request, backend) {
                self.channel.send(now_us, &response, sink)?;
            }
        }
        Ok(())
    }

    /// Housekeeping: transport pacing/timeouts and S3 session decay. Call
    /// once per tick.
    pub fn periodic<S: FrameSink>(&mut self, now_us: u64, sink: &mut S) {
        let _ = self.channel.poll(now_us, sink);

        if self.session != UdsSession::Default
            && now_us.saturating_sub(self.last_activity_us) > S3_TIMEOUT_MS * 1000
        {
            info!("uds: S3 expired, dropping to default session");
            self.session = UdsSession::Default;
            self.security_unlocked = false;
            self.pending_seed = None;
        }
    }

    /// Service dispatch over one reassembled request.
    pub fn handle_request<B: DiagBackend>(
        &mut self,
        now_us: u64,
        request: &[u8],
        backend: &mut B,
    ) -> Option<UdsResponse> {
        let Some(&sid) = request.first() else {
            return None;
        };
        match sid {
            SID_SESSION_CONTROL => self.session_control(request),
            SID_SECURITY_ACCESS => self.security_access(now_us, request),
            SID_READ_DID => self.read_did(request, backend),
            SID_WRITE_DID => self.write_did(request),
            SID_ROUTINE_CONTROL => self.routine_control(request, backend),
            SID_TESTER_PRESENT => self.tester_present(request),
            _ => Some(negative(sid, Nrc::ServiceNotSupported)),
        }
    }

    fn session_control(&mut self, request: &[u8]) -> Option<UdsResponse> {
        let Some(&sub) = request.get(1) else {
            return Some(negative(SID_SESSION_CONTROL, Nrc::IncorrectMessageLength));
        };
        let suppress = sub & SUPPRESS_BIT != 0;
        let Some(session) = UdsSession::from_byte(sub & !SUPPRESS_BIT) else {
            return Some(negative(SID_SESSION_CONTROL, Nrc::SubFunctionNotSupported));
        };

        if session != self.session {
            debug!("uds: session {:?} -> {:?}", self.session, session);
            // Any session change relocks security.
            self.security_unlocked = false;
            self.pending_seed = None;
        }
        self.session = session;

        if suppress {
            return None;
        }
        let s3 = S3_TIMEOUT_MS as u16;
        let mut resp = UdsResponse::new();
        let _ = resp.extend_from_slice(&[
            SID_SESSION_CONTROL + POSITIVE_OFFSET,
            session.byte(),
            (s3 >> 8) as u8,
            (s3 & 0xFF) as u8,
        ]);
        Some(resp)
    }

    fn security_access(&mut self, now_us: u64, request: &[u8]) -> Option<UdsResponse> {
        if self.session == UdsSession::Default {
            return Some(negative(
                SID_SECURITY_ACCESS,
                Nrc::ServiceNotSupportedInActiveSession,
            ));
        }
        let Some(&sub) = request.get(1) else {
            return Some(negative(SID_SECURITY_ACCESS, Nrc::IncorrectMessageLength));
        };

        if sub & 0x01 == 1 {
            // Seed request.
            if let Some(until) = self.lockout_until_us {
                if now_us < until {
                    return Some(negative(
                        SID_SECURITY_ACCESS,
                        Nrc::RequiredTimeDelayNotExpired,
                    ));
                }
                self.lockout_until_us = None;
                self.failed_attempts = 0;
            }
            let seed = if self.security_unlocked {
                // Already unlocked: all-zero seed by convention.
                0
            } else {
                let seed = self.next_seed(now_us);
                self.pending_seed = Some(seed);
                seed
            };
            let b = seed.to_be_bytes();
            let mut resp = UdsResponse::new();
            let _ = resp.extend_from_slice(&[
                SID_SECURITY_ACCESS + POSITIVE_OFFSET,
                sub,
                b[0],
                b[1],
                b[2],
                b[3],
            ]);
            return Some(resp);
        }

        // Key submission.
        if self.lockout_until_us.is_some_and(|until| now_us < until) {
            return Some(negative(
                SID_SECURITY_ACCESS,
                Nrc::RequiredTimeDelayNotExpired,
            ));
        }
        let Some(seed) = self.pending_seed else {
            return Some(negative(SID_SECURITY_ACCESS, Nrc::RequestOutOfRange));
        };
        if request.len() < 6 {
            return Some(negative(SID_SECURITY_ACCESS, Nrc::IncorrectMessageLength));
        }
        let key = u32::from_be_bytes([request[2], request[3], request[4], request[5]]);
        if key == seed ^ SECURITY_KEY_MASK {
            info!("uds: security unlocked");
            self.security_unlocked = true;
            self.pending_seed = None;
            self.failed_attempts = 0;
            let mut resp = UdsResponse::new();
            let _ = resp.extend_from_slice(&[SID_SECURITY_ACCESS + POSITIVE_OFFSET, sub]);
            return Some(resp);
        }

        self.failed_attempts += 1;
        if self.failed_attempts >= SECURITY_MAX_ATTEMPTS {
            self.lockout_until_us = Some(now_us + SECURITY_LOCKOUT_MS * 1000);
            self.pending_seed = None;
            return Some(negative(SID_SECURITY_ACCESS, Nrc::ExceedNumberOfAttempts));
        }
        Some(negative(SID_SECURITY_ACCESS, Nrc::InvalidKey))
    }

    fn next_seed(&mut self, now_us: u64) -> u32 {
        // Deterministic mixer, seeded per boot and stirred with the clock.
        let mut x = self.seed_state ^ (now_us as u32).wrapping_mul(0x9E37_79B9);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed_state = x;
        // Never hand out the all-zero "unlocked" marker.
        if x == 0 { 0xDEAD_BEEF } else { x }
    }

    fn read_did<B: DiagBackend>(&self, request: &[u8], backend: &B) -> Option<UdsResponse> {
        if request.len() < 3 {
            return Some(negative(SID_READ_DID, Nrc::IncorrectMessageLength));
        }
        let did = u16::from(request[1]) << 8 | u16::from(request[2]);
        let Some(entry) = self.dids.iter().find(|e| e.did == did) else {
            return Some(negative(SID_READ_DID, Nrc::RequestOutOfRange));
        };
        if entry.security_required && !self.security_unlocked {
            return Some(negative(SID_READ_DID, Nrc::SecurityAccessDenied));
        }

        let mut resp = UdsResponse::new();
        let _ = resp.extend_from_slice(&[SID_READ_DID + POSITIVE_OFFSET, request[1], request[2]]);
        match &entry.handler {
            DidHandler::Ident(s) => {
                let _ = resp.extend_from_slice(s.as_bytes());
            }
            DidHandler::ActiveSession => {
                let _ = resp.push(self.session.byte());
            }
            DidHandler::SignalValue(id) => match backend.signal_value(*id) {
                Some(v) => {
                    let _ = resp.extend_from_slice(&v.to_be_bytes());
                }
                None => return Some(negative(SID_READ_DID, Nrc::RequestOutOfRange)),
            },
            DidHandler::Stored { data, .. } => {
                let _ = resp.extend_from_slice(data);
            }
        }
        Some(resp)
    }

    fn write_did(&mut self, request: &[u8]) -> Option<UdsResponse> {
        if self.session == UdsSession::Default {
            return Some(negative(
                SID_WRITE_DID,
                Nrc::ServiceNotSupportedInActiveSession,
            ));
        }
        if !self.security_unlocked {
            return Some(negative(SID_WRITE_DID, Nrc::SecurityAccessDenied));
        }
        if request.len() < 4 {
            return Some(negative(SID_WRITE_DID, Nrc::IncorrectMessageLength));
        }
        let did = u16::from(request[1]) << 8 | u16::from(request[2]);
        let Some(entry) = self.dids.iter_mut().find(|e| e.did == did) else {
            return Some(negative(SID_WRITE_DID, Nrc::RequestOutOfRange));
        };
        match &mut entry.handler {
            DidHandler::Stored { data, writable } if *writable => {
                data.clear();
                let take = request[3..].len().min(16);
                let _ = data.extend_from_slice(&request[3..3 + take]);
            }
            _ => return Some(negative(SID_WRITE_DID, Nrc::RequestOutOfRange)),
        }
        let mut resp = UdsResponse::new();
        let _ = resp.extend_from_slice(&[SID_WRITE_DID + POSITIVE_OFFSET, request[1], request[2]]);
        Some(resp)
    }

    fn routine_control<B: DiagBackend>(
        &mut self,
        request: &[u8],
        backend: &mut B,
    ) -> Option<UdsResponse> {
        if self.session == UdsSession::Default {
            return Some(negative(
                SID_ROUTINE_CONTROL,
                Nrc::ServiceNotSupportedInActiveSession,
            ));
        }
        if request.len() < 4 {
            return Some(negative(SID_ROUTINE_CONTROL, Nrc::IncorrectMessageLength));
        }
        let sub = request[1];
        if sub != 0x01 {
            // Only routine start; stop/results have no meaning for these.
            return Some(negative(SID_ROUTINE_CONTROL, Nrc::SubFunctionNotSupported));
        }
        let rid = u16::from(request[2]) << 8 | u16::from(request[3]);
        let Some(entry) = self.routines.iter().find(|e| e.id == rid).copied() else {
            return Some(negative(SID_ROUTINE_CONTROL, Nrc::RequestOutOfRange));
        };
        if entry.security_required && !self.security_unlocked {
            return Some(negative(SID_ROUTINE_CONTROL, Nrc::SecurityAccessDenied));
        }

        let outcome = match entry.handler {
            RoutineHandler::EnterCalibration => backend.enter_calibration(),
            RoutineHandler::ExitCalibration => backend.exit_calibration(),
            RoutineHandler::ClearDtcs => {
                backend.clear_dtcs();
                Ok(())
            }
        };
        let status: u8 = if outcome.is_ok() { 0x00 } else { 0x01 };
        let mut resp = UdsResponse::new();
        let _ = resp.extend_from_slice(&[
            SID_ROUTINE_CONTROL + POSITIVE_OFFSET,
            sub,
            request[2],
            request[3],
            status,
        ]);
        Some(resp)
    }

    fn tester_present(&mut self, request: &[u8]) -> Option<UdsResponse> {
        match request.get(1).copied().unwrap_or(0) {
            0x00 => {
                let mut resp = UdsResponse::new();
                let _ = resp.extend_from_slice(&[SID_TESTER_PRESENT + POSITIVE_OFFSET, 0x00]);
                Some(resp)
            }
            0x80 => None, // keep-alive with suppressed response
            _ => Some(negative(SID_TESTER_PRESENT, Nrc::SubFunctionNotSupported)),
        }
    }
}

fn negative(sid: u8, nrc: Nrc) -> UdsResponse {
    let mut resp = UdsResponse::new();
    let _ = resp.extend_from_slice(&[NEGATIVE_SID, sid, nrc.code()]);
    resp
}

/// Convenience for transports: true when `payload` is a negative response.
pub fn is_negative(payload: &[u8]) -> bool {
    payload.first() == Some(&NEGATIVE_SID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct MockBackend {
        calibrating: bool,
        dtcs_cleared: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                calibrating: false,
                dtcs_cleared: false,
            }
        }
    }

    impl DiagBackend for MockBackend {
        fn signal_value(&self, id: usize) -> Option<i32> {
            (id < 32).then_some(1_000 + id as i32)
        }

        fn enter_calibration(&mut self) -> Result<()> {
            self.calibrating = true;
            Ok(())
        }

        fn exit_calibration(&mut self) -> Result<()> {
            if !self.calibrating {
                return Err(Error::AccessDenied);
            }
            self.calibrating = false;
            Ok(())
        }

        fn clear_dtcs(&mut self) {
            self.dtcs_cleared = true;
        }
    }

    fn server() -> UdsServer {
        UdsServer::new(IsoTpConfig::new(0x7E8, 0x7E0))
    }

    fn unlock(s: &mut UdsServer, b: &mut MockBackend, now: u64) {
        let seed_resp = s.handle_request(now, &[0x27, 0x01], b).unwrap();
        let seed = u32::from_be_bytes([seed_resp[2], seed_resp[3], seed_resp[4], seed_resp[5]]);
        let key = (seed ^ 0x5A5A_5A5A).to_be_bytes();
        let resp = s
            .handle_request(now, &[0x27, 0x02, key[0], key[1], key[2], key[3]], b)
            .unwrap();
        assert_eq!(resp[0], 0x67);
    }

    #[test]
    fn session_control_reports_s3() {
        let mut s = server();
        let mut b = MockBackend::new();
        let resp = s.handle_request(0, &[0x10, 0x03], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x50, 0x03, 0x13, 0x88]);
        assert_eq!(s.session(), UdsSession::ExtendedDiagnostic);
    }

    #[test]
    fn session_decays_after_s3_silence() {
        // Switch to EXTENDED at t=0; at t=5001 ms the periodic pass drops
        // to DEFAULT and relocks security.
        let mut s = server();
        let mut b = MockBackend::new();
        s.handle_request(0, &[0x10, 0x03], &mut b);
        unlock(&mut s, &mut b, 0);
        assert!(s.security_unlocked());

        let mut sink = |_id: u32, _d: &[u8]| Ok(());
        s.periodic(5_001_000, &mut sink);
        assert_eq!(s.session(), UdsSession::Default);
        assert!(!s.security_unlocked());
    }

    #[test]
    fn tester_present_refreshes_the_timer() {
        let mut s = server();
        let mut b = MockBackend::new();
        let mut sink = |_id: u32, _d: &[u8]| Ok(());

        s.handle_request(0, &[0x10, 0x03], &mut b);
        s.last_activity_us = 0;

        // Keep-alive at 4 s, then check at 8 s: still extended.
        let resp = s.handle_request(4_000_000, &[0x3E, 0x00], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7E, 0x00]);
        s.last_activity_us = 4_000_000;
        s.periodic(8_000_000, &mut sink);
        assert_eq!(s.session(), UdsSession::ExtendedDiagnostic);
    }

    #[test]
    fn tester_present_suppress_bit_mutes_response() {
        let mut s = server();
        let mut b = MockBackend::new();
        assert!(s.handle_request(0, &[0x3E, 0x80], &mut b).is_none());
    }

    #[test]
    fn security_access_requires_non_default_session() {
        let mut s = server();
        let mut b = MockBackend::new();
        let resp = s.handle_request(0, &[0x27, 0x01], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x27, 0x7F]);
    }

    #[test]
    fn seed_key_exchange_unlocks() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.handle_request(0, &[0x10, 0x03], &mut b);
        unlock(&mut s, &mut b, 10);
        assert!(s.security_unlocked());

        // Unlocked seed request returns zeros.
        let resp = s.handle_request(20, &[0x27, 0x01], &mut b).unwrap();
        assert_eq!(&resp[2..6], &[0, 0, 0, 0]);
    }

    #[test]
    fn three_bad_keys_trigger_lockout_and_cooldown() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.handle_request(0, &[0x10, 0x03], &mut b);

        for attempt in 0..3 {
            s.handle_request(0, &[0x27, 0x01], &mut b).unwrap();
            let resp = s
                .handle_request(0, &[0x27, 0x02, 0, 0, 0, 0], &mut b)
                .unwrap();
            let expect = if attempt == 2 { 0x36 } else { 0x35 };
            assert_eq!(resp.as_slice(), &[0x7F, 0x27, expect], "attempt {attempt}");
        }

        // Inside the 10 s cooldown: delay NRC. After it: seeds again.
        let resp = s.handle_request(5_000_000, &[0x27, 0x01], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x27, 0x37]);
        let resp = s.handle_request(10_000_001, &[0x27, 0x01], &mut b).unwrap();
        assert_eq!(resp[0], 0x67);
    }

    #[test]
    fn session_change_relocks_security() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.handle_request(0, &[0x10, 0x03], &mut b);
        unlock(&mut s, &mut b, 0);
        s.handle_request(10, &[0x10, 0x02], &mut b);
        assert!(!s.security_unlocked());
    }

    #[test]
    fn read_did_ident_and_session() {
        let mut s = server();
        let mut b = MockBackend::new();
        let resp = s.handle_request(0, &[0x22, 0xF1, 0x90], &mut b).unwrap();
        assert_eq!(&resp[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&resp[3..], b"LNB-ECU-0001");

        s.handle_request(0, &[0x10, 0x03], &mut b);
        let resp = s.handle_request(0, &[0x22, 0xF1, 0x86], &mut b).unwrap();
        assert_eq!(resp[3], 0x03);
    }

    #[test]
    fn read_did_signal_value_is_big_endian() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.add_did(DidEntry {
            did: 0x0105,
            handler: DidHandler::SignalValue(5),
            security_required: false,
        })
        .unwrap();
        let resp = s.handle_request(0, &[0x22, 0x01, 0x05], &mut b).unwrap();
        assert_eq!(&resp[3..], &1_005i32.to_be_bytes());
    }

    #[test]
    fn secured_did_needs_unlock() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.add_did(DidEntry {
            did: 0x0110,
            handler: DidHandler::SignalValue(1),
            security_required: true,
        })
        .unwrap();

        let resp = s.handle_request(0, &[0x22, 0x01, 0x10], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x22, 0x33]);

        s.handle_request(0, &[0x10, 0x03], &mut b);
        unlock(&mut s, &mut b, 0);
        let resp = s.handle_request(0, &[0x22, 0x01, 0x10], &mut b).unwrap();
        assert_eq!(resp[0], 0x62);
    }

    #[test]
    fn write_did_gated_by_session_and_security() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.add_did(DidEntry {
            did: 0x0200,
            handler: DidHandler::Stored {
                data: heapless::Vec::new(),
                writable: true,
            },
            security_required: false,
        })
        .unwrap();

        // Default session: refused outright.
        let resp = s.handle_request(0, &[0x2E, 0x02, 0x00, 0xAA], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x2E, 0x7F]);

        s.handle_request(0, &[0x10, 0x03], &mut b);
        let resp = s.handle_request(0, &[0x2E, 0x02, 0x00, 0xAA], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x2E, 0x33]);

        unlock(&mut s, &mut b, 0);
        let resp = s.handle_request(0, &[0x2E, 0x02, 0x00, 0xAA, 0xBB], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x6E, 0x02, 0x00]);

        let resp = s.handle_request(0, &[0x22, 0x02, 0x00], &mut b).unwrap();
        assert_eq!(&resp[3..], &[0xAA, 0xBB]);
    }

    #[test]
    fn calibration_routines_drive_the_backend() {
        let mut s = server();
        let mut b = MockBackend::new();
        s.handle_request(0, &[0x10, 0x03], &mut b);
        unlock(&mut s, &mut b, 0);

        let resp = s
            .handle_request(0, &[0x31, 0x01, 0x02, 0x00], &mut b)
            .unwrap();
        assert_eq!(resp.as_slice(), &[0x71, 0x01, 0x02, 0x00, 0x00]);
        assert!(b.calibrating);

        let resp = s
            .handle_request(0, &[0x31, 0x01, 0x02, 0x01], &mut b)
            .unwrap();
        assert_eq!(resp[4], 0x00);
        assert!(!b.calibrating);
    }

    #[test]
    fn clear_dtcs_routine_is_open_but_session_gated() {
        let mut s = server();
        let mut b = MockBackend::new();
        let resp = s
            .handle_request(0, &[0x31, 0x01, 0x02, 0x02], &mut b)
            .unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x31, 0x7F]);

        s.handle_request(0, &[0x10, 0x03], &mut b);
        s.handle_request(0, &[0x31, 0x01, 0x02, 0x02], &mut b).unwrap();
        assert!(b.dtcs_cleared);
    }

    #[test]
    fn unknown_service_and_did() {
        let mut s = server();
        let mut b = MockBackend::new();
        let resp = s.handle_request(0, &[0x85, 0x01], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x85, 0x11]);

        let resp = s.handle_request(0, &[0x22, 0xAB, 0xCD], &mut b).unwrap();
        assert_eq!(resp.as_slice(), &[0x7F, 0x22, 0x31]);
    }

    #[test]
    fn full_request_travels_through_isotp() {
        // SF request in, SF response out through the frame sink.
        let mut s = server();
        let mut b = MockBackend::new();
        let mut frames: Vec<(u32, Vec<u8>)> = Vec::new();
        {
            let mut sink = |id: u32, d: &[u8]| {
                frames.push((id, d.to_vec()));
                Ok(())
            };
            s.process_frame(0, &[0x02, 0x3E, 0x00], &mut b, &mut sink)
                .unwrap();
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 0x7E8);
        assert_eq!(frames[0].1, vec![0x02, 0x7E, 0x00]);
    }
}
