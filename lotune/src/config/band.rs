use crate::{
    bias::BiasServoParams,
    config::{BandConfig, LockConfig},
    maximizer::MaximizeParams,
    pll::LockDetectionStrategy,
    tuning::{LoChain, TuningCalibration},
    Band,
};

const FLOOG_GHZ: f64 = 0.0315;

pub const BAND3: BandConfig = BandConfig {
    band: Band(3),
    calibration: TuningCalibration { low_ghz: 15.20, high_ghz: 18.10 },
    lo_chain: LoChain {
        warm_multiplier: 6,
        cold_multiplier: 1,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: false,
    },
    lock: LockConfig::DEFAULT,
    bias: BiasServoParams::DEFAULT,
    maximizer: MaximizeParams::DEFAULT,
};

pub const BAND4: BandConfig = BandConfig {
    band: Band(4),
    calibration: TuningCalibration { low_ghz: 16.50, high_ghz: 19.60 },
    lo_chain: LoChain {
        warm_multiplier: 2,
        cold_multiplier: 4,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: false,
    },
    // Lock detector chatters while the loop settles
    lock: LockConfig {
        initial_strategy: LockDetectionStrategy::DoubleSampleVoltage,
        ..LockConfig::DEFAULT
    },
    bias: BiasServoParams::DEFAULT,
    maximizer: MaximizeParams::DEFAULT,
};

pub const BAND6: BandConfig = BandConfig {
    band: Band(6),
    calibration: TuningCalibration { low_ghz: 12.20, high_ghz: 14.80 },
    lo_chain: LoChain {
        warm_multiplier: 6,
        cold_multiplier: 3,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: false,
    },
    lock: LockConfig {
        allow_variance_fallback: true,
        ..LockConfig::DEFAULT
    },
    bias: BiasServoParams::DEFAULT,
    maximizer: MaximizeParams::DEFAULT,
};

pub const BAND7: BandConfig = BandConfig {
    band: Band(7),
    calibration: TuningCalibration { low_ghz: 15.60, high_ghz: 20.40 },
    lo_chain: LoChain {
        warm_multiplier: 6,
        cold_multiplier: 3,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: false,
    },
    lock: LockConfig {
        allow_variance_fallback: true,
        ..LockConfig::DEFAULT
    },
    bias: BiasServoParams::DEFAULT,
    maximizer: MaximizeParams::DEFAULT,
};

pub const BAND8: BandConfig = BandConfig {
    band: Band(8),
    calibration: TuningCalibration { low_ghz: 10.80, high_ghz: 13.80 },
    lo_chain: LoChain {
        warm_multiplier: 6,
        cold_multiplier: 6,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: false,
    },
    lock: LockConfig {
        initial_strategy: LockDetectionStrategy::DoubleSampleVoltage,
        ..LockConfig::DEFAULT
    },
    bias: BiasServoParams::DEFAULT,
    maximizer: MaximizeParams::DEFAULT,
};

pub const BAND9: BandConfig = BandConfig {
    band: Band(9),
    calibration: TuningCalibration { low_ghz: 22.60, high_ghz: 26.40 },
    lo_chain: LoChain {
        warm_multiplier: 3,
        cold_multiplier: 9,
        floog_ghz: FLOOG_GHZ,
        lock_below_ref: true,
    },
    lock: LockConfig {
        allow_variance_fallback: true,
        // Wider capture, slower settling
        settle_ms_variance: 60,
        window_steps: 80,
        ..LockConfig::DEFAULT
    },
    bias: BiasServoParams {
        average_count: 5,
        ..BiasServoParams::DEFAULT
    },
    maximizer: MaximizeParams::DEFAULT,
};

pub const ALL: [BandConfig; 6] = [BAND3, BAND4, BAND6, BAND7, BAND8, BAND9];

#[test]
fn double_sample_bands() {
    let double: Vec<_> = ALL
        .iter()
        .filter(|b| b.lock.initial_strategy == LockDetectionStrategy::DoubleSampleVoltage)
        .map(|b| b.band)
        .collect();
    assert_eq!(vec![Band(4), Band(8)], double);
}

#[test]
fn lo_ranges_fit_calibration() {
    use crate::tuning::TuningMap;
    // Nominal LO tuning ranges in GHz
    for (b, lo_low, lo_high) in [(BAND3, 92.0, 108.0), (BAND6, 221.0, 265.0), (BAND7, 283.0, 365.0), (BAND9, 614.0, 708.0)] {
        let map = TuningMap::new(&b.calibration).unwrap();
        assert!(map.code_for_lo(&b.lo_chain, lo_low).is_ok(), "band {}", b.band);
        assert!(map.code_for_lo(&b.lo_chain, lo_high).is_ok(), "band {}", b.band);
    }
}
