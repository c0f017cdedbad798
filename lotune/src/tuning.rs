//! Frequency to YTO tuning code mapping.
//!
//! The YTO is tuned by a 12 bit coarse code that maps linearly onto the
//! calibrated frequency range of the oscillator. Converting a frequency to a
//! code quantizes; converting a code back is exact. So
//! `code_from_frequency(frequency_from_code(c)) == c` for every valid code,
//! but the other direction only lands within half a code step.
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;

use crate::{Error, Result};

/// Number of distinct tuning codes.
pub const CODE_STEPS: u16 = 4096;
pub const MAX_CODE: u16 = CODE_STEPS - 1;

/// Calibrated YTO endpoints, in GHz, for tuning codes 0 and [`MAX_CODE`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TuningCalibration {
    pub low_ghz: f64,
    pub high_ghz: f64,
}

impl TuningCalibration {
    pub fn new(low_ghz: f64, high_ghz: f64) -> Result<Self> {
        let cal = Self { low_ghz, high_ghz };
        cal.validate()?;
        Ok(cal)
    }

    pub fn validate(&self) -> Result<()> {
        if self.low_ghz.is_finite() && self.high_ghz.is_finite() && self.low_ghz < self.high_ghz {
            Ok(())
        } else {
            Err(Error::InvalidCalibration {
                low: self.low_ghz,
                high: self.high_ghz,
            })
        }
    }
}

/// A validated calibration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TuningMap {
    low: f64,
    high: f64,
}

impl TuningMap {
    pub fn new(cal: &TuningCalibration) -> Result<Self> {
        cal.validate()?;
        Ok(Self {
            low: cal.low_ghz,
            high: cal.high_ghz,
        })
    }

    pub fn low_ghz(&self) -> f64 {
        self.low
    }

    pub fn high_ghz(&self) -> f64 {
        self.high
    }

    /// Frequency covered by one code step.
    pub fn ghz_per_code(&self) -> f64 {
        (self.high - self.low) / f64::from(MAX_CODE)
    }

    /// `None` if the frequency lies outside the calibrated range.
    pub fn code_from_frequency(&self, ghz: f64) -> Option<u16> {
        if !(self.low..=self.high).contains(&ghz) {
            return None;
        }
        let code = ((ghz - self.low) / (self.high - self.low) * f64::from(MAX_CODE)).round();
        // Range check above keeps this within 0..=MAX_CODE
        Some(code as u16)
    }

    /// `None` for codes at or above [`CODE_STEPS`].
    pub fn frequency_from_code(&self, code: u16) -> Option<f64> {
        if code > MAX_CODE {
            return None;
        }
        // min() absorbs rounding at the top code so it stays inside the range
        Some((self.low + f64::from(code) * self.ghz_per_code()).min(self.high))
    }

    /// Starting code for an LO frequency, through the multiplier chain.
    pub fn code_for_lo(&self, chain: &LoChain, lo_ghz: f64) -> Result<u16> {
        let yto = chain.yto_frequency(lo_ghz)?;
        self.code_from_frequency(yto).ok_or(Error::OutOfRange {
            value: yto as f32,
            min: self.low as f32,
            max: self.high as f32,
        })
    }
}

/// The multiplier chain between the YTO and the LO delivered to the mixer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoChain {
    pub warm_multiplier: u32,
    pub cold_multiplier: u32,
    /// Offset the PLL locks at, relative to the reference harmonic.
    pub floog_ghz: f64,
    /// Lock with the YTO below the reference harmonic.
    #[serde(default)]
    pub lock_below_ref: bool,
}

impl LoChain {
    pub fn multiplier(&self) -> u32 {
        self.warm_multiplier * self.cold_multiplier
    }

    pub fn yto_frequency(&self, lo_ghz: f64) -> Result<f64> {
        if self.multiplier() == 0 {
            return Err(Error::InvalidParameter("LO multiplier must be non-zero"));
        }
        Ok(lo_ghz / f64::from(self.multiplier()))
    }

    /// Reference harmonic the PLL must see for this LO frequency.
    pub fn reference_frequency(&self, lo_ghz: f64) -> Result<f64> {
        let yto = self.yto_frequency(lo_ghz)?;
        Ok(if self.lock_below_ref {
            yto + self.floog_ghz
        } else {
            yto - self.floog_ghz
        })
    }
}

#[cfg(test)]
fn band6_map() -> TuningMap {
    TuningMap::new(&TuningCalibration {
        low_ghz: 14.91,
        high_ghz: 18.99,
    })
    .unwrap()
}

#[cfg(test)]
proptest! {
    #[test]
    fn code_round_trip(code in 0..CODE_STEPS, low in 1.0f64..30.0, span in 0.5f64..20.0) {
        let map = TuningMap::new(&TuningCalibration { low_ghz: low, high_ghz: low + span }).unwrap();
        let f = map.frequency_from_code(code).unwrap();
        assert_eq!(Some(code), map.code_from_frequency(f));
    }

    #[test]
    fn frequency_strictly_increasing(code in 0..MAX_CODE) {
        let map = band6_map();
        assert!(map.frequency_from_code(code).unwrap() < map.frequency_from_code(code + 1).unwrap());
    }

    #[test]
    fn frequency_round_trip_within_half_step(f in 14.91f64..18.99) {
        let map = band6_map();
        let back = map.frequency_from_code(map.code_from_frequency(f).unwrap()).unwrap();
        assert!((back - f).abs() <= map.ghz_per_code() / 2.0 + 1e-12);
    }
}

#[test]
fn endpoints() {
    let map = band6_map();
    assert_eq!(Some(0), map.code_from_frequency(14.91));
    assert_eq!(Some(MAX_CODE), map.code_from_frequency(18.99));
    assert_eq!(None, map.code_from_frequency(14.9));
    assert_eq!(None, map.code_from_frequency(19.0));
    assert_eq!(None, map.frequency_from_code(CODE_STEPS));
}

#[test]
fn rejects_inverted_calibration() {
    let cal = TuningCalibration {
        low_ghz: 18.0,
        high_ghz: 12.0,
    };
    assert!(matches!(TuningMap::new(&cal), Err(Error::InvalidCalibration { .. })));
}

#[test]
fn lo_chain() {
    let chain = LoChain {
        warm_multiplier: 6,
        cold_multiplier: 3,
        floog_ghz: 0.0315,
        lock_below_ref: false,
    };
    let map = band6_map();
    let yto = chain.yto_frequency(300.0).unwrap();
    assert!((yto - 300.0 / 18.0).abs() < 1e-12);
    assert!((chain.reference_frequency(300.0).unwrap() - (yto - 0.0315)).abs() < 1e-12);
    assert!(map.code_for_lo(&chain, 300.0).is_ok());
    assert!(map.code_for_lo(&chain, 400.0).is_err());
}
