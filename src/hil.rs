/*!
Hardware-in-the-loop interceptor.

`HilPlatform` wraps any inner platform. While a twin connection is active,
outbound I/O (GPIO, PWM, CAN) is serialized over a line-oriented TCP link
to the test twin *and* mirrored to the inner platform, so the binary under
test behaves identically with or without the harness attached. Inbound
lines from the twin inject CAN frames (served to `can_recv` ahead of the
inner platform) and raw samples (handed to the application via
`poll_twin`, which feeds them to the engine's input ring).

Wire format, one event per line:
  out:  `gpio <pin> <0|1>`
        `pwm <channel> <duty> <freq>`
        `can <bus> <id-hex> <0|1> <data-hex>`
  in:   `can <bus> <id-hex> <0|1> <data-hex>`
        `sample <source> <value>`

When no twin is connected every call passes straight through. A write
error drops the connection and the engine keeps running on the inner
platform alone.
*/

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::pal::{CanFrame, Platform};

/// An event injected by the twin that the application must route itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwinEvent {
    Sample { source: u8, value: u32 },
}

struct Twin {
    stream: TcpStream,
    rx_buf: Vec<u8>,
}

struct HilState {
    twin: Option<Twin>,
    injected_can: [VecDeque<CanFrame>; 4],
    samples: VecDeque<TwinEvent>,
}

pub struct HilPlatform<P: Platform> {
    inner: P,
    state: Mutex<HilState>,
}

impl<P: Platform> HilPlatform<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            state: Mutex::new(HilState {
                twin: None,
                injected_can: Default::default(),
                samples: VecDeque::new(),
            }),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Attach to a twin. Reads are non-blocking; `poll_twin` drains them.
    pub fn connect(&self, addr: &str) -> Result<()> {
        let stream = TcpStream::connect(addr).map_err(|_| Error::Io)?;
        stream.set_nonblocking(true).map_err(|_| Error::Io)?;
        stream.set_nodelay(true).ok();
        info!("hil: twin attached at {addr}");
        let mut st = self.state.lock().unwrap();
        st.twin = Some(Twin {
            stream,
            rx_buf: Vec::new(),
        });
        Ok(())
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().twin = None;
    }

    pub fn active(&self) -> bool {
        self.state.lock().unwrap().twin.is_some()
    }

    /// Drain twin input. CAN lines are queued for `can_recv`; sample lines
    /// are returned for the caller to push into the engine's input ring.
    pub fn poll_twin(&self) -> Vec<TwinEvent> {
        let mut st = self.state.lock().unwrap();
        let mut dead = false;
        let mut lines: Vec<String> = Vec::new();
        if let Some(twin) = st.twin.as_mut() {
            let mut chunk = [0u8; 512];
            loop {
                match twin.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => twin.rx_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        dead = true;
                        break;
                    }
                }
            }

            // Split out complete lines, keep any partial tail.
            while let Some(pos) = twin.rx_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = twin.rx_buf.drain(..=pos).collect();
                if let Ok(s) = String::from_utf8(line) {
                    lines.push(s.trim().to_string());
                }
            }
        }
        for line in lines {
            Self::apply_line(&mut st, &line);
        }
        if dead {
            warn!("hil: twin connection lost");
            st.twin = None;
        }
        st.samples.drain(..).collect()
    }

    fn apply_line(st: &mut HilState, line: &str) {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("can") => {
                let (Some(bus), Some(id), Some(ext), Some(hex)) = (
                    parts.next().and_then(|s| s.parse::<u8>().ok()),
                    parts.next().and_then(|s| u32::from_str_radix(s, 16).ok()),
                    parts.next().map(|s| s == "1"),
                    parts.next(),
                ) else {
                    warn!("hil: malformed can line: {line}");
                    return;
                };
                let Some(data) = decode_hex(hex) else {
                    warn!("hil: bad hex in can line: {line}");
                    return;
                };
                if let Some(q) = st.injected_can.get_mut(bus as usize) {
                    q.push_back(CanFrame::new(id, ext, &data));
                }
            }
            Some("sample") => {
                let (Some(source), Some(value)) = (
                    parts.next().and_then(|s| s.parse::<u8>().ok()),
                    parts.next().and_then(|s| s.parse::<u32>().ok()),
                ) else {
                    warn!("hil: malformed sample line: {line}");
                    return;
                };
                st.samples.push_back(TwinEvent::Sample { source, value });
            }
            _ => warn!("hil: unknown twin line: {line}"),
        }
    }

    /// Write one line to the twin; on failure the twin is detached.
    fn twin_send(&self, line: &str) {
        let mut st = self.state.lock().unwrap();
        let Some(twin) = st.twin.as_mut() else {
            return;
        };
        let ok = twin
            .stream
            .write_all(line.as_bytes())
            .and_then(|_| twin.stream.write_all(b"\n"))
            .is_ok();
        if !ok {
            warn!("hil: twin write failed, detaching");
            st.twin = None;
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s == "-" {
        return Some(Vec::new());
    }
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn encode_hex(data: &[u8]) -> String {
    if data.is_empty() {
        return "-".to_string();
    }
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

impl<P: Platform> Platform for HilPlatform<P> {
    fn now_us(&self) -> u64 {
        self.inner.now_us()
    }

    fn sleep_ms(&self, ms: u32) {
        self.inner.sleep_ms(ms);
    }

    fn gpio_set(&self, pin: u32, level: bool) -> Result<()> {
        self.twin_send(&format!("gpio {pin} {}", u8::from(level)));
        self.inner.gpio_set(pin, level)
    }

    fn gpio_get(&self, pin: u32) -> Result<bool> {
        self.inner.gpio_get(pin)
    }

    fn gpio_toggle(&self, pin: u32) -> Result<()> {
        let level = !self.inner.gpio_get(pin)?;
        self.gpio_set(pin, level)
    }

    fn pwm_set(&self, channel: u32, duty: u16, freq_hz: u32) -> Result<()> {
        self.twin_send(&format!("pwm {channel} {duty} {freq_hz}"));
        self.inner.pwm_set(channel, duty, freq_hz)
    }

    fn can_send(&self, bus: u8, id: u32, extended: bool, data: &[u8]) -> Result<()> {
        self.twin_send(&format!(
            "can {bus} {id:x} {} {}",
            u8::from(extended),
            encode_hex(data)
        ));
        self.inner.can_send(bus, id, extended, data)
    }

    fn can_recv(&self, bus: u8, timeout_ms: u32) -> Result<CanFrame> {
        // Twin-injected traffic outranks the inner platform's receive path.
        {
            let mut st = self.state.lock().unwrap();
            if let Some(frame) = st
                .injected_can
                .get_mut(bus as usize)
                .and_then(|q| q.pop_front())
            {
                return Ok(frame);
            }
        }
        self.inner.can_recv(bus, timeout_ms)
    }

    fn uart_write(&self, port: u8, data: &[u8], timeout_ms: u32) -> Result<usize> {
        self.inner.uart_write(port, data, timeout_ms)
    }

    fn uart_read(&self, port: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.inner.uart_read(port, buf, timeout_ms)
    }

    fn spi_transfer(&self, bus: u8, tx: &[u8], rx: &mut [u8], timeout_ms: u32) -> Result<()> {
        self.inner.spi_transfer(bus, tx, rx, timeout_ms)
    }

    fn i2c_write(&self, bus: u8, addr: u8, data: &[u8], timeout_ms: u32) -> Result<()> {
        self.inner.i2c_write(bus, addr, data, timeout_ms)
    }

    fn i2c_read(&self, bus: u8, addr: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.inner.i2c_read(bus, addr, buf, timeout_ms)
    }
}
