use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fs, path::Path};
#[cfg(test)] use proptest::prelude::*;

use crate::{
    bias::BiasServoParams,
    maximizer::MaximizeParams,
    pll::LockDetectionStrategy,
    tuning::{LoChain, TuningCalibration, CODE_STEPS},
    Band, Error, Result,
};

pub mod band;

/// Lock search and correction voltage trim parameters for one band.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub initial_strategy: LockDetectionStrategy,
    /// Retry a failed voltage threshold search with the correction voltage
    /// variance test. Only meaningful on the high bands.
    pub allow_variance_fallback: bool,
    /// Lock detect voltage above which the loop is considered locked, V.
    pub lock_threshold: f32,
    /// Minimum reference and IF total power detector magnitudes, V.
    pub min_ref_power: f32,
    pub min_if_power: f32,
    /// Settle after each code write, per strategy.
    pub settle_ms_threshold: u64,
    pub settle_ms_double_sample: u64,
    pub settle_ms_variance: u64,
    pub double_sample_delay_ms: u64,
    /// Largest correction voltage spread still considered locked, V.
    pub variance_threshold: f32,
    pub variance_samples: u32,
    /// Codes either side of the coarse code searched by default.
    pub window_steps: u16,
    pub step_size: u16,
    /// Correction voltage trim tolerance, V.
    pub adjust_window: f32,
    pub adjust_max_iterations: u32,
    /// Furthest the trim may walk from its starting code.
    pub max_displacement: u16,
    pub adjust_settle_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl LockConfig {
    pub const DEFAULT: Self = Self {
        initial_strategy: LockDetectionStrategy::VoltageThreshold,
        allow_variance_fallback: false,
        lock_threshold: 3.0,
        min_ref_power: 0.5,
        min_if_power: 0.5,
        settle_ms_threshold: 20,
        settle_ms_double_sample: 20,
        settle_ms_variance: 40,
        double_sample_delay_ms: 3,
        variance_threshold: 0.5,
        variance_samples: 5,
        window_steps: 50,
        step_size: 1,
        adjust_window: 0.5,
        adjust_max_iterations: 50,
        max_displacement: 20,
        adjust_settle_ms: 5,
    };

    pub fn settle_ms(&self, strategy: LockDetectionStrategy) -> u64 {
        match strategy {
            LockDetectionStrategy::VoltageThreshold => self.settle_ms_threshold,
            LockDetectionStrategy::DoubleSampleVoltage => self.settle_ms_double_sample,
            LockDetectionStrategy::CorrectionVoltageVariance => self.settle_ms_variance,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_size == 0 {
            return Err(Error::InvalidParameter("lock search step size must be non-zero"));
        }
        if self.window_steps >= CODE_STEPS {
            return Err(Error::InvalidParameter("lock search window wider than the code range"));
        }
        if self.variance_samples < 2 {
            return Err(Error::InvalidParameter("variance test needs at least two samples"));
        }
        if !(self.adjust_window.is_finite() && self.adjust_window > 0.0) {
            return Err(Error::InvalidParameter("PLL adjust window must be positive"));
        }
        if !(self.variance_threshold.is_finite() && self.variance_threshold > 0.0) {
            return Err(Error::InvalidParameter("variance threshold must be positive"));
        }
        Ok(())
    }
}

/// Everything needed to drive one cartridge band.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandConfig {
    pub band: Band,
    pub calibration: TuningCalibration,
    pub lo_chain: LoChain,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub bias: BiasServoParams,
    #[serde(default)]
    pub maximizer: MaximizeParams,
}

impl BandConfig {
    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;
        if self.lo_chain.multiplier() == 0 {
            return Err(Error::InvalidParameter("LO multiplier must be non-zero"));
        }
        self.lock.validate()?;
        self.bias.validate()?;
        self.maximizer.validate()
    }

    /// Drop every settle and sampling delay, for running against the
    /// simulated front end.
    pub fn without_delays(mut self) -> Self {
        self.lock.settle_ms_threshold = 0;
        self.lock.settle_ms_double_sample = 0;
        self.lock.settle_ms_variance = 0;
        self.lock.double_sample_delay_ms = 0;
        self.lock.adjust_settle_ms = 0;
        self.bias.settle_ms = 0;
        self.maximizer.poll_interval_ms = 0;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub bands: Vec<BandConfig>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// The built in band presets.
    pub fn presets() -> Self {
        Self {
            bands: band::ALL.to_vec(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for b in &self.bands {
            if !seen.insert(b.band) {
                return Err(Error::InvalidParameter("band configured twice"));
            }
            b.validate()?;
        }
        Ok(())
    }

    pub fn band(&self, band: Band) -> Option<&BandConfig> {
        self.bands.iter().find(|b| b.band == band)
    }
}

#[cfg(test)]
proptest! {
    #[test]
    fn settle_per_strategy(strategy: LockDetectionStrategy) {
        let lock = LockConfig { settle_ms_threshold: 1, settle_ms_double_sample: 2, settle_ms_variance: 3, ..LockConfig::DEFAULT };
        let ms = lock.settle_ms(strategy);
        assert!((1..=3).contains(&ms));
        assert_eq!(0, band::BAND6.without_delays().lock.settle_ms(strategy));
    }
}

#[test]
fn presets_validate() {
    Config::presets().validate().unwrap();
}

#[test]
fn toml_defaults() {
    let config = Config::from_toml_str(
        r#"
        [[bands]]
        band = 6
        calibration = { low_ghz = 12.2, high_ghz = 14.8 }
        lo_chain = { warm_multiplier = 6, cold_multiplier = 3, floog_ghz = 0.0315 }

        [bands.lock]
        allow_variance_fallback = true
        window_steps = 80
        "#,
    )
    .unwrap();
    let b = config.band(Band(6)).unwrap();
    assert!(b.lock.allow_variance_fallback);
    assert_eq!(80, b.lock.window_steps);
    assert_eq!(LockConfig::DEFAULT.lock_threshold, b.lock.lock_threshold);
    assert_eq!(BiasServoParams::DEFAULT, b.bias);
    assert!(!b.lo_chain.lock_below_ref);
    assert!(config.band(Band(7)).is_none());
}

#[test]
fn toml_rejects_inverted_calibration() {
    let r = Config::from_toml_str(
        r#"
        [[bands]]
        band = 3
        calibration = { low_ghz = 18.0, high_ghz = 15.0 }
        lo_chain = { warm_multiplier = 6, cold_multiplier = 1, floog_ghz = 0.0315 }
        "#,
    );
    assert!(matches!(r, Err(Error::InvalidCalibration { .. })));
}

#[test]
fn toml_rejects_duplicate_band() {
    let one = r#"
        [[bands]]
        band = 3
        calibration = { low_ghz = 15.0, high_ghz = 18.0 }
        lo_chain = { warm_multiplier = 6, cold_multiplier = 1, floog_ghz = 0.0315 }
        "#;
    let r = Config::from_toml_str(&format!("{one}{one}"));
    assert!(matches!(r, Err(Error::InvalidParameter(_))));
}

#[test]
fn toml_syntax_error() {
    assert!(matches!(Config::from_toml_str("bands = ["), Err(Error::Config(_))));
}

#[test]
fn example_file() {
    let config = Config::from_toml_str(include_str!("../../bands.toml")).unwrap();
    assert_eq!(2, config.bands.len());
    let b8 = config.band(Band(8)).unwrap();
    assert_eq!(LockDetectionStrategy::DoubleSampleVoltage, b8.lock.initial_strategy);
    assert_eq!(0.02, b8.maximizer.step);
    assert_eq!(MaximizeParams::DEFAULT.max, b8.maximizer.max);
}
