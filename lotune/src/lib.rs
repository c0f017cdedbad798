//! Control core for a millimeter-wave receiver cartridge LO and bias chain.
//!
//! The crate tunes a YTO-based local oscillator to a commanded frequency,
//! searches for and verifies PLL lock, and servos amplifier drain voltages
//! until a mixer current readback hits its target. Hardware access goes
//! through the [`Hardware`] trait; status goes out through an injected
//! [`events::EventSink`].
//!
//! Long running procedures are meant to run inside a [`worker::WorkerTask`],
//! one OS thread per task, cancellable between hardware steps.
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, thread, time::Duration};
use thiserror::Error;

#[cfg(test)]
use proptest_derive::Arbitrary;

pub mod bias;
pub mod config;
pub mod events;
pub mod maximizer;
pub mod pll;
pub mod registers;
pub mod sim;
pub mod tuning;
pub mod worker;

pub use registers::Register;

#[derive(Error, Debug)]
pub enum Error {
    #[error("hardware access failed: {0}")]
    Hardware(String),
    #[error("value {value} outside [{min}, {max}]")]
    OutOfRange { value: f32, min: f32, max: f32 },
    #[error("tuning code {0} out of range")]
    CodeOutOfRange(i32),
    #[error("invalid tuning calibration: low {low} GHz must be below high {high} GHz")]
    InvalidCalibration { low: f64, high: f64 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("readback not ready after {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    #[error("no PLL lock found for band {band}")]
    NoLock { band: Band },
    #[error("PLL lost lock")]
    LockLost,
    #[error("search did not converge")]
    NotConverged,
    #[error("dependent value identical at three consecutive samples")]
    FlatResponse,
    #[error("iteration limit of {0} reached")]
    IterationLimit(u32),
    #[error("cancelled by request")]
    Cancelled,
    #[error("task is already running")]
    AlreadyRunning,
    #[error("task did not stop in time")]
    StopTimeout,
    #[error("invalid config file")]
    Config(#[from] toml::de::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if the operation was stopped by request rather than by a failure
    /// of the algorithm. Callers should not log these as errors.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Cartridge band number, 1 through 10.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Band(pub u8);

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum Polarization {
    Pol0,
    Pol1,
}

impl Polarization {
    pub fn index(self) -> u16 {
        match self {
            Polarization::Pol0 => 0,
            Polarization::Pol1 => 1,
        }
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pol{}", self.index())
    }
}

/// Synchronous register access to one cartridge.
///
/// Every call may fail with [`Error::Hardware`] on a communication fault.
/// The control loops treat such faults as "did not reach target", never as
/// a reason to panic.
pub trait Hardware: Send {
    fn read_float(&mut self, reg: Register) -> Result<f32>;
    fn write_float(&mut self, reg: Register, value: f32) -> Result<()>;
    fn read_bool(&mut self, reg: Register) -> Result<bool>;
    fn write_bool(&mut self, reg: Register, value: bool) -> Result<()>;
    fn read_code(&mut self, reg: Register) -> Result<u16>;
    fn write_code(&mut self, reg: Register, value: u16) -> Result<()>;
}

impl<H: Hardware + ?Sized> Hardware for &mut H {
    fn read_float(&mut self, reg: Register) -> Result<f32> {
        (**self).read_float(reg)
    }
    fn write_float(&mut self, reg: Register, value: f32) -> Result<()> {
        (**self).write_float(reg, value)
    }
    fn read_bool(&mut self, reg: Register) -> Result<bool> {
        (**self).read_bool(reg)
    }
    fn write_bool(&mut self, reg: Register, value: bool) -> Result<()> {
        (**self).write_bool(reg, value)
    }
    fn read_code(&mut self, reg: Register) -> Result<u16> {
        (**self).read_code(reg)
    }
    fn write_code(&mut self, reg: Register, value: u16) -> Result<()> {
        (**self).write_code(reg, value)
    }
}

impl<H: Hardware + ?Sized> Hardware for Box<H> {
    fn read_float(&mut self, reg: Register) -> Result<f32> {
        (**self).read_float(reg)
    }
    fn write_float(&mut self, reg: Register, value: f32) -> Result<()> {
        (**self).write_float(reg, value)
    }
    fn read_bool(&mut self, reg: Register) -> Result<bool> {
        (**self).read_bool(reg)
    }
    fn write_bool(&mut self, reg: Register, value: bool) -> Result<()> {
        (**self).write_bool(reg, value)
    }
    fn read_code(&mut self, reg: Register) -> Result<u16> {
        (**self).read_code(reg)
    }
    fn write_code(&mut self, reg: Register, value: u16) -> Result<()> {
        (**self).write_code(reg, value)
    }
}

/// Polled by long running searches at each bounded wait.
pub trait Cancel {
    fn cancelled(&self) -> bool;
}

/// Never cancels. Used by the blocking entry points.
pub struct Never;

impl Cancel for Never {
    fn cancelled(&self) -> bool {
        false
    }
}

impl Cancel for std::sync::atomic::AtomicBool {
    fn cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl<C: Cancel + ?Sized> Cancel for Arc<C> {
    fn cancelled(&self) -> bool {
        (**self).cancelled()
    }
}

/// Wait out a settle time between a hardware write and its readback.
pub(crate) fn settle(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}
