/*!
Wall-clock platform for running the engine on a development host.

GPIO, PWM and CAN state live in memory: `gpio_set` flips a bit in a pin
array, `can_send` appends to a per-bus transmit log, and `can_recv` pops
frames previously injected with `inject_can`. This is enough for the demo
binary and for exercising the full engine loop without hardware.

UART/SPI/I2C are loopback stubs: writes are logged and reads drain whatever
a test injected. A board support crate would replace this whole file.
*/

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::pal::{CanFrame, Platform};

const GPIO_PINS: usize = 256;
const CAN_BUSES: usize = 4;

struct HostState {
    gpio: [bool; GPIO_PINS],
    pwm: Vec<(u32, u16, u32)>,
    can_tx: [Vec<CanFrame>; CAN_BUSES],
    can_rx: [VecDeque<CanFrame>; CAN_BUSES],
    uart_rx: VecDeque<u8>,
    uart_tx: Vec<u8>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            gpio: [false; GPIO_PINS],
            pwm: Vec::new(),
            can_tx: Default::default(),
            can_rx: Default::default(),
            uart_rx: VecDeque::new(),
            uart_tx: Vec::new(),
        }
    }
}

pub struct HostPlatform {
    epoch: Instant,
    state: Mutex<HostState>,
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Queue a frame so a later `can_recv` on `bus` returns it.
    pub fn inject_can(&self, bus: u8, frame: CanFrame) {
        let mut st = self.state.lock().unwrap();
        if let Some(q) = st.can_rx.get_mut(bus as usize) {
            q.push_back(frame);
        }
    }

    /// Drain and return everything sent on `bus` so far.
    pub fn take_can_tx(&self, bus: u8) -> Vec<CanFrame> {
        let mut st = self.state.lock().unwrap();
        st.can_tx
            .get_mut(bus as usize)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn gpio_level(&self, pin: u32) -> Option<bool> {
        let st = self.state.lock().unwrap();
        st.gpio.get(pin as usize).copied()
    }

    pub fn inject_uart(&self, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.uart_rx.extend(data.iter().copied());
    }
}

impl Platform for HostPlatform {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }

    fn gpio_set(&self, pin: u32, level: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let slot = st
            .gpio
            .get_mut(pin as usize)
            .ok_or(Error::InvalidArgument)?;
        *slot = level;
        Ok(())
    }

    fn gpio_get(&self, pin: u32) -> Result<bool> {
        let st = self.state.lock().unwrap();
        st.gpio
            .get(pin as usize)
            .copied()
            .ok_or(Error::InvalidArgument)
    }

    fn gpio_toggle(&self, pin: u32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let slot = st
            .gpio
            .get_mut(pin as usize)
            .ok_or(Error::InvalidArgument)?;
        *slot = !*slot;
        Ok(())
    }

    fn pwm_set(&self, channel: u32, duty: u16, freq_hz: u32) -> Result<()> {
        if duty > 10_000 {
            return Err(Error::InvalidArgument);
        }
        let mut st = self.state.lock().unwrap();
        st.pwm.push((channel, duty, freq_hz));
        Ok(())
    }

    fn can_send(&self, bus: u8, id: u32, extended: bool, data: &[u8]) -> Result<()> {
        if data.len() > super::CAN_MAX_DATA {
            return Err(Error::InvalidArgument);
        }
        let mut st = self.state.lock().unwrap();
        let log = st
            .can_tx
            .get_mut(bus as usize)
            .ok_or(Error::NoDevice)?;
        log.push(CanFrame::new(id, extended, data));
        Ok(())
    }

    fn can_recv(&self, bus: u8, timeout_ms: u32) -> Result<CanFrame> {
        let deadline = Instant::now() + std::time::Duration::from_millis(timeout_ms as u64);
        loop {
            {
                let mut st = self.state.lock().unwrap();
                let q = st.can_rx.get_mut(bus as usize).ok_or(Error::NoDevice)?;
                if let Some(frame) = q.pop_front() {
                    return Ok(frame);
                }
            }
            if timeout_ms == 0 {
                return Err(Error::WouldBlock);
            }
            if timeout_ms != u32::MAX && Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn uart_write(&self, _port: u8, data: &[u8], _timeout_ms: u32) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        st.uart_tx.extend_from_slice(data);
        Ok(data.len())
    }

    fn uart_read(&self, _port: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        if st.uart_rx.is_empty() {
            return if timeout_ms == 0 {
                Err(Error::WouldBlock)
            } else {
                Err(Error::Timeout)
            };
        }
        let mut n = 0;
        while n < buf.len() {
            match st.uart_rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn spi_transfer(&self, _bus: u8, tx: &[u8], rx: &mut [u8], _timeout_ms: u32) -> Result<()> {
        if rx.len() < tx.len() {
            return Err(Error::InvalidArgument);
        }
        // Loopback: what goes out comes back.
        rx[..tx.len()].copy_from_slice(tx);
        Ok(())
    }

    fn i2c_write(&self, _bus: u8, _addr: u8, _data: &[u8], _timeout_ms: u32) -> Result<()> {
        Ok(())
    }

    fn i2c_read(&self, _bus: u8, _addr: u8, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Ok(buf.len())
    }
}
