/* Register map for one cartridge
 *
 * Addresses are relative to the cartridge's node on the monitor and control
 * bus. Per polarization registers are laid out as pol0 then pol1, so the
 * pol helpers below are the only place that knows the offsets.
 * */
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

use crate::Polarization;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u16)]
#[rustfmt::skip]
pub enum Register {
    /* LO: YTO */
    YtoCoarseTune           = 0x0800, // 12 bit tuning code
    /* LO: PLL */
    PllLockDetectVoltage    = 0x0810, // V, high when locked
    PllCorrectionVoltage    = 0x0811, // V, loop error feedback
    PllRefTotalPower        = 0x0812, // V, detector, negative
    PllIfTotalPower         = 0x0813, // V, detector, negative
    PllUnlockDetectLatch    = 0x0814, // RO, sticky unlock
    PllClearUnlockLatch     = 0x0815, // WO
    PllNullLoopIntegrator   = 0x0816, // RW, true holds the integrator at zero
    PllSidebandLockBelow    = 0x0818, // RW, lock below the reference
    /* LO: power amplifier drain voltage */
    PaPol0DrainVoltage      = 0x0C00, // V, 0 to 2.5
    PaPol1DrainVoltage      = 0x0C01, // V, 0 to 2.5
    /* Cold cartridge: SIS mixers */
    SisPol0Sb1Current       = 0x1000, // uA
    SisPol0Sb2Current       = 0x1001, // uA
    SisPol1Sb1Current       = 0x1002, // uA
    SisPol1Sb2Current       = 0x1003, // uA
    SisPol0Sb1Voltage       = 0x1010, // mV
    SisPol1Sb1Voltage       = 0x1012, // mV
    /* IF power detector used by the maximizer */
    IfPol0Power             = 0x1400, // dBm
    IfPol1Power             = 0x1401, // dBm
}

impl Register {
    pub fn pa_drain_voltage(pol: Polarization) -> Self {
        match pol {
            Polarization::Pol0 => Register::PaPol0DrainVoltage,
            Polarization::Pol1 => Register::PaPol1DrainVoltage,
        }
    }

    /// Mixer current readback, sideband 1 or 2.
    pub fn sis_current(pol: Polarization, sb: u8) -> Self {
        match (pol, sb) {
            (Polarization::Pol0, 2) => Register::SisPol0Sb2Current,
            (Polarization::Pol1, 2) => Register::SisPol1Sb2Current,
            (Polarization::Pol0, _) => Register::SisPol0Sb1Current,
            (Polarization::Pol1, _) => Register::SisPol1Sb1Current,
        }
    }

    pub fn if_power(pol: Polarization) -> Self {
        match pol {
            Polarization::Pol0 => Register::IfPol0Power,
            Polarization::Pol1 => Register::IfPol1Power,
        }
    }

    pub fn addr(self) -> u16 {
        self.into()
    }
}

#[cfg(test)]
proptest! {
    #[test]
    fn register_addr_inverse(r: Register) {
        assert_eq!(r, Register::try_from(r.addr()).unwrap());
    }

    #[test]
    fn pol_registers_distinct(sb in 1u8..=2) {
        assert_ne!(
            Register::sis_current(Polarization::Pol0, sb),
            Register::sis_current(Polarization::Pol1, sb)
        );
        assert_ne!(
            Register::pa_drain_voltage(Polarization::Pol0),
            Register::pa_drain_voltage(Polarization::Pol1)
        );
    }
}

bitflags! {
    /// Summary of one PLL health readback.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LockFlags: u8 {
        const LOCK_DETECT  = 0x01;
        const REF_POWER    = 0x02;
        const IF_POWER     = 0x04;
        const UNLOCK_LATCH = 0x08;
    }
}

impl LockFlags {
    /// Everything the voltage threshold test needs.
    pub fn healthy(self) -> bool {
        self.contains(LockFlags::LOCK_DETECT | LockFlags::REF_POWER | LockFlags::IF_POWER)
    }
}

/// The PLL monitor block, as last read back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PllReadings {
    pub lock_detect_voltage: f32,
    pub correction_voltage: f32,
    pub ref_total_power: f32,
    pub if_total_power: f32,
    pub unlock_detected: bool,
}

impl PllReadings {
    pub fn read<H: crate::Hardware + ?Sized>(hw: &mut H) -> crate::Result<Self> {
        Ok(Self {
            lock_detect_voltage: hw.read_float(Register::PllLockDetectVoltage)?,
            correction_voltage: hw.read_float(Register::PllCorrectionVoltage)?,
            ref_total_power: hw.read_float(Register::PllRefTotalPower)?,
            if_total_power: hw.read_float(Register::PllIfTotalPower)?,
            unlock_detected: hw.read_bool(Register::PllUnlockDetectLatch)?,
        })
    }

    /// Classify against thresholds. Total power detectors report negative
    /// voltages, so magnitudes are compared.
    pub fn flags(&self, lock_threshold: f32, min_ref_power: f32, min_if_power: f32) -> LockFlags {
        let mut flags = LockFlags::empty();
        if self.lock_detect_voltage > lock_threshold {
            flags |= LockFlags::LOCK_DETECT;
        }
        if self.ref_total_power.abs() > min_ref_power {
            flags |= LockFlags::REF_POWER;
        }
        if self.if_total_power.abs() > min_if_power {
            flags |= LockFlags::IF_POWER;
        }
        if self.unlock_detected {
            flags |= LockFlags::UNLOCK_LATCH;
        }
        flags
    }
}

#[test]
fn flags_from_negative_detectors() {
    let r = PllReadings {
        lock_detect_voltage: 4.8,
        correction_voltage: 0.2,
        ref_total_power: -1.2,
        if_total_power: -0.9,
        unlock_detected: false,
    };
    assert!(r.flags(3.0, 0.5, 0.5).healthy());
    assert!(!r.flags(5.0, 0.5, 0.5).healthy());
    assert!(!r.flags(3.0, 0.5, 1.0).healthy());
}
