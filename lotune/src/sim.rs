//! A deterministic software model of one cartridge.
//!
//! The model is just detailed enough to drive every control loop in the
//! crate without hardware: a YTO whose PLL captures within a window around a
//! lock code, PA drain voltages that move the SIS mixer current linearly, and
//! an IF power detector that peaks at one drain voltage per polarization.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::trace;

use crate::{
    tuning::MAX_CODE,
    Error, Hardware, Polarization, Register, Result,
};

pub const LOCK_DETECT_LOCKED: f32 = 4.8;
pub const LOCK_DETECT_UNLOCKED: f32 = 0.2;
/// Correction voltage while the loop is open.
pub const CV_RAIL: f32 = -10.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Write {
    Float(Register, f32),
    Bool(Register, bool),
    Code(Register, u16),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PllModel {
    /// Code at which the correction voltage is zero.
    pub lock_center: u16,
    /// Codes either side of the center the loop still captures.
    pub capture_range: u16,
    /// Correction voltage change per code step, falling with the code.
    pub volts_per_code: f32,
    pub ref_total_power: f32,
    pub if_total_power: f32,
    /// Lock detector stuck low, as on bands where it can't be trusted.
    pub lock_detect_broken: bool,
}

impl Default for PllModel {
    fn default() -> Self {
        Self {
            lock_center: 2048,
            capture_range: 6,
            volts_per_code: 0.4,
            ref_total_power: -1.2,
            if_total_power: -0.9,
            lock_detect_broken: false,
        }
    }
}

/// Per polarization bias chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiasModel {
    /// SIS current in uA per volt of PA drain.
    pub ua_per_volt: f32,
    pub offset_ua: f32,
    /// Drain voltage giving the most IF power.
    pub if_peak_volts: f32,
    pub if_peak_dbm: f32,
}

impl Default for BiasModel {
    fn default() -> Self {
        Self {
            ua_per_volt: 20.0,
            offset_ua: 0.0,
            if_peak_volts: 1.2,
            if_peak_dbm: -30.0,
        }
    }
}

pub struct SimulatedFrontEnd {
    pub pll: PllModel,
    pub bias: [BiasModel; 2],
    yto_code: u16,
    integrator_nulled: bool,
    unlock_latch: bool,
    lock_below_ref: bool,
    drain_voltage: [f32; 2],
    faults: HashSet<Register>,
    writes: Vec<Write>,
}

impl Default for SimulatedFrontEnd {
    fn default() -> Self {
        Self::new(PllModel::default())
    }
}

impl SimulatedFrontEnd {
    pub fn new(pll: PllModel) -> Self {
        Self {
            pll,
            bias: [BiasModel::default(); 2],
            yto_code: 0,
            integrator_nulled: false,
            unlock_latch: false,
            lock_below_ref: false,
            drain_voltage: [0.0; 2],
            faults: HashSet::new(),
            writes: Vec::new(),
        }
    }

    pub fn locked(&self) -> bool {
        !self.integrator_nulled && self.yto_code.abs_diff(self.pll.lock_center) <= self.pll.capture_range
    }

    pub fn yto_code(&self) -> u16 {
        self.yto_code
    }

    pub fn drain_voltage(&self, pol: Polarization) -> f32 {
        self.drain_voltage[usize::from(pol.index())]
    }

    pub fn sis_current(&self, pol: Polarization) -> f32 {
        let m = &self.bias[usize::from(pol.index())];
        m.offset_ua + m.ua_per_volt * self.drain_voltage(pol)
    }

    pub fn if_power(&self, pol: Polarization) -> f32 {
        let m = &self.bias[usize::from(pol.index())];
        let dv = self.drain_voltage(pol) - m.if_peak_volts;
        m.if_peak_dbm - 10.0 * dv * dv
    }

    /// Every access to `reg` fails from now on.
    pub fn inject_fault(&mut self, reg: Register) {
        self.faults.insert(reg);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn code_writes(&self) -> impl Iterator<Item = u16> + '_ {
        self.writes.iter().filter_map(|w| match w {
            Write::Code(Register::YtoCoarseTune, c) => Some(*c),
            _ => None,
        })
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn check(&self, reg: Register) -> Result<()> {
        if self.faults.contains(&reg) {
            Err(Error::Hardware(format!("no response from {reg:?} (0x{:04X})", reg.addr())))
        } else {
            Ok(())
        }
    }

    fn update_lock<F: FnOnce(&mut Self)>(&mut self, f: F) {
        let was_locked = self.locked();
        f(self);
        if was_locked && !self.locked() {
            self.unlock_latch = true;
        }
    }

    fn correction_voltage(&self) -> f32 {
        if self.locked() {
            self.pll.volts_per_code * (f32::from(self.pll.lock_center) - f32::from(self.yto_code))
        } else {
            CV_RAIL
        }
    }
}

fn not_a(kind: &str, reg: Register) -> Error {
    Error::Hardware(format!("{reg:?} is not a {kind} register"))
}

fn pol_of(reg: Register) -> Polarization {
    match reg {
        Register::PaPol1DrainVoltage
        | Register::SisPol1Sb1Current
        | Register::SisPol1Sb2Current
        | Register::SisPol1Sb1Voltage
        | Register::IfPol1Power => Polarization::Pol1,
        _ => Polarization::Pol0,
    }
}

impl Hardware for SimulatedFrontEnd {
    fn read_float(&mut self, reg: Register) -> Result<f32> {
        self.check(reg)?;
        let pol = pol_of(reg);
        let v = match reg {
            Register::PllLockDetectVoltage if self.locked() && !self.pll.lock_detect_broken => LOCK_DETECT_LOCKED,
            Register::PllLockDetectVoltage => LOCK_DETECT_UNLOCKED,
            Register::PllCorrectionVoltage => self.correction_voltage(),
            Register::PllRefTotalPower => self.pll.ref_total_power,
            Register::PllIfTotalPower => self.pll.if_total_power,
            Register::PaPol0DrainVoltage | Register::PaPol1DrainVoltage => self.drain_voltage(pol),
            Register::SisPol0Sb1Current
            | Register::SisPol0Sb2Current
            | Register::SisPol1Sb1Current
            | Register::SisPol1Sb2Current => self.sis_current(pol),
            Register::SisPol0Sb1Voltage | Register::SisPol1Sb1Voltage => 2.2,
            Register::IfPol0Power | Register::IfPol1Power => self.if_power(pol),
            _ => return Err(not_a("float", reg)),
        };
        trace!("read {reg:?} = {v}");
        Ok(v)
    }

    fn write_float(&mut self, reg: Register, value: f32) -> Result<()> {
        self.check(reg)?;
        match reg {
            Register::PaPol0DrainVoltage | Register::PaPol1DrainVoltage => {
                self.drain_voltage[usize::from(pol_of(reg).index())] = value;
            }
            _ => return Err(not_a("writable float", reg)),
        }
        self.writes.push(Write::Float(reg, value));
        Ok(())
    }

    fn read_bool(&mut self, reg: Register) -> Result<bool> {
        self.check(reg)?;
        match reg {
            Register::PllUnlockDetectLatch => Ok(self.unlock_latch),
            Register::PllNullLoopIntegrator => Ok(self.integrator_nulled),
            Register::PllSidebandLockBelow => Ok(self.lock_below_ref),
            _ => Err(not_a("bool", reg)),
        }
    }

    fn write_bool(&mut self, reg: Register, value: bool) -> Result<()> {
        self.check(reg)?;
        match reg {
            Register::PllClearUnlockLatch => {
                if value {
                    self.unlock_latch = false;
                }
            }
            Register::PllNullLoopIntegrator => self.update_lock(|s| s.integrator_nulled = value),
            Register::PllSidebandLockBelow => self.lock_below_ref = value,
            _ => return Err(not_a("writable bool", reg)),
        }
        self.writes.push(Write::Bool(reg, value));
        Ok(())
    }

    fn read_code(&mut self, reg: Register) -> Result<u16> {
        self.check(reg)?;
        match reg {
            Register::YtoCoarseTune => Ok(self.yto_code),
            _ => Err(not_a("code", reg)),
        }
    }

    fn write_code(&mut self, reg: Register, value: u16) -> Result<()> {
        self.check(reg)?;
        match reg {
            Register::YtoCoarseTune if value <= MAX_CODE => self.update_lock(|s| s.yto_code = value),
            Register::YtoCoarseTune => return Err(Error::CodeOutOfRange(i32::from(value))),
            _ => return Err(not_a("code", reg)),
        }
        self.writes.push(Write::Code(reg, value));
        Ok(())
    }
}

/// A hardware handle shared between threads, locked per register access.
pub struct SharedHardware<H> {
    inner: Arc<Mutex<H>>,
}

impl<H> Clone for SharedHardware<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Hardware> SharedHardware<H> {
    pub fn new(hw: H) -> Self {
        Self {
            inner: Arc::new(Mutex::new(hw)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, H>> {
        self.inner
            .lock()
            .map_err(|_| Error::Hardware("hardware mutex poisoned".into()))
    }
}

impl<H: Hardware> Hardware for SharedHardware<H> {
    fn read_float(&mut self, reg: Register) -> Result<f32> {
        self.lock()?.read_float(reg)
    }
    fn write_float(&mut self, reg: Register, value: f32) -> Result<()> {
        self.lock()?.write_float(reg, value)
    }
    fn read_bool(&mut self, reg: Register) -> Result<bool> {
        self.lock()?.read_bool(reg)
    }
    fn write_bool(&mut self, reg: Register, value: bool) -> Result<()> {
        self.lock()?.write_bool(reg, value)
    }
    fn read_code(&mut self, reg: Register) -> Result<u16> {
        self.lock()?.read_code(reg)
    }
    fn write_code(&mut self, reg: Register, value: u16) -> Result<()> {
        self.lock()?.write_code(reg, value)
    }
}

#[test]
fn capture_window() {
    let mut sim = SimulatedFrontEnd::default();
    sim.write_code(Register::YtoCoarseTune, 2040).unwrap();
    assert!(!sim.locked());
    sim.write_code(Register::YtoCoarseTune, 2045).unwrap();
    assert!(sim.locked());
    assert_eq!(LOCK_DETECT_LOCKED, sim.read_float(Register::PllLockDetectVoltage).unwrap());
    assert!(sim.read_float(Register::PllCorrectionVoltage).unwrap() > 0.0);

    sim.write_bool(Register::PllNullLoopIntegrator, true).unwrap();
    assert!(!sim.locked());
    assert!(sim.read_bool(Register::PllUnlockDetectLatch).unwrap());
    sim.write_bool(Register::PllNullLoopIntegrator, false).unwrap();
    sim.write_bool(Register::PllClearUnlockLatch, true).unwrap();
    assert!(sim.locked());
    assert!(!sim.read_bool(Register::PllUnlockDetectLatch).unwrap());
}

#[test]
fn rejects_bad_access() {
    let mut sim = SimulatedFrontEnd::default();
    assert!(matches!(sim.write_code(Register::YtoCoarseTune, 4096), Err(Error::CodeOutOfRange(4096))));
    assert!(matches!(sim.read_float(Register::PllClearUnlockLatch), Err(Error::Hardware(_))));
    sim.inject_fault(Register::PaPol1DrainVoltage);
    assert!(sim.write_float(Register::PaPol1DrainVoltage, 1.0).is_err());
    assert!(sim.write_float(Register::PaPol0DrainVoltage, 1.0).is_ok());
    assert_eq!(1, sim.writes().len());
}

#[test]
fn shared_between_threads() {
    let shared = SharedHardware::new(SimulatedFrontEnd::default());
    let mut writer = shared.clone();
    std::thread::spawn(move || writer.write_float(Register::PaPol1DrainVoltage, 1.5).unwrap())
        .join()
        .unwrap();
    assert_eq!(30.0, shared.lock().unwrap().sis_current(Polarization::Pol1));
}
