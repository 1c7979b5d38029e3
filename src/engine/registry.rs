/*!
Config registry: runtime access to remap and scale configs.

Lifecycle gate
- During boot (before the engine is sealed) configuration is open.
- After sealing, mutation requires calibration mode.
- Exiting calibration latches `config_locked`; from then until the next
  boot every mutation attempt, including re-entering calibration, fails
  with `AccessDenied`.

`config_version` bumps on every successful mutation and is an atomic so
telemetry can read it without taking the engine.

Removal keeps the active range contiguous: trailing entries shift down, so
indices handed out earlier may move. Diagnostic tooling re-reads by index
after a version change.
*/

use std::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::error::{Error, Result};
use crate::stages::remap::RemapConfig;
use crate::stages::scale::ScaleConfig;

pub const MAX_REMAPS: usize = 16;
pub const MAX_SCALES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Boot,
    Sealed,
    Calibrating,
    Latched,
}

pub struct ConfigRegistry {
    remaps: heapless::Vec<RemapConfig, MAX_REMAPS>,
    scales: heapless::Vec<ScaleConfig, MAX_SCALES>,
    gate: Gate,
    version: AtomicU32,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            remaps: heapless::Vec::new(),
            scales: heapless::Vec::new(),
            gate: Gate::Boot,
            version: AtomicU32::new(0),
        }
    }

    /// End of engine init: further writes need calibration mode.
    pub fn seal(&mut self) {
        if self.gate == Gate::Boot {
            self.gate = Gate::Sealed;
        }
    }

    pub fn enter_calibration(&mut self) -> Result<()> {
        match self.gate {
            Gate::Latched => Err(Error::AccessDenied),
            Gate::Calibrating => Ok(()),
            Gate::Boot | Gate::Sealed => {
                info!("config registry entering calibration mode");
                self.gate = Gate::Calibrating;
                Ok(())
            }
        }
    }

    /// Leave calibration and latch the lock until the next boot.
    pub fn exit_calibration(&mut self) -> Result<()> {
        match self.gate {
            Gate::Calibrating => {
                info!("config registry locked (calibration complete)");
                self.gate = Gate::Latched;
                Ok(())
            }
            _ => Err(Error::AccessDenied),
        }
    }

    pub fn calibrating(&self) -> bool {
        self.gate == Gate::Calibrating
    }

    pub fn locked(&self) -> bool {
        self.gate == Gate::Latched
    }

    /// Monotonic mutation counter; readable lock-free.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn writable(&self) -> Result<()> {
        match self.gate {
            Gate::Boot | Gate::Calibrating => Ok(()),
            Gate::Sealed | Gate::Latched => Err(Error::AccessDenied),
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    // Remap table.

    pub fn add_remap(&mut self, cfg: RemapConfig) -> Result<usize> {
        self.writable()?;
        self.remaps.push(cfg).map_err(|_| Error::NoSpace)?;
        self.bump();
        Ok(self.remaps.len() - 1)
    }

    pub fn remap(&self, index: usize) -> Option<&RemapConfig> {
        self.remaps.get(index)
    }

    pub fn update_remap(&mut self, index: usize, cfg: RemapConfig) -> Result<()> {
        self.writable()?;
        let slot = self.remaps.get_mut(index).ok_or(Error::NotFound)?;
        *slot = cfg;
        self.bump();
        Ok(())
    }

    pub fn remove_remap(&mut self, index: usize) -> Result<()> {
        self.writable()?;
        if index >= self.remaps.len() {
            return Err(Error::NotFound);
        }
        // Shift trailing entries down to keep the active range contiguous.
        for i in index..self.remaps.len() - 1 {
            self.remaps[i] = self.remaps[i + 1];
        }
        self.remaps.pop();
        self.bump();
        Ok(())
    }

    pub fn remaps(&self) -> &[RemapConfig] {
        &self.remaps
    }

    // Scale table.

    pub fn add_scale(&mut self, cfg: ScaleConfig) -> Result<usize> {
        self.writable()?;
        cfg.validate()?;
        self.scales.push(cfg).map_err(|_| Error::NoSpace)?;
        self.bump();
        Ok(self.scales.len() - 1)
    }

    pub fn scale(&self, index: usize) -> Option<&ScaleConfig> {
        self.scales.get(index)
    }

    pub fn update_scale(&mut self, index: usize, cfg: ScaleConfig) -> Result<()> {
        self.writable()?;
        cfg.validate()?;
        let slot = self.scales.get_mut(index).ok_or(Error::NotFound)?;
        *slot = cfg;
        self.bump();
        Ok(())
    }

    pub fn remove_scale(&mut self, index: usize) -> Result<()> {
        self.writable()?;
        if index >= self.scales.len() {
            return Err(Error::NotFound);
        }
        for i in index..self.scales.len() - 1 {
            self.scales[i] = self.scales[i + 1];
        }
        self.scales.pop();
        self.bump();
        Ok(())
    }

    pub fn scales(&self) -> &[ScaleConfig] {
        &self.scales
    }

    /// Mutable access for the stage pass and the limp-home swap. Not a
    /// config "write": the fault monitor rewrites live parameters without
    /// touching the version.
    pub(crate) fn scales_mut(&mut self) -> &mut [ScaleConfig] {
        &mut self.scales
    }

    pub(crate) fn remaps_slice(&self) -> &[RemapConfig] {
        &self.remaps
    }
}
