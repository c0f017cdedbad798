/* PLL lock search and correction voltage trim
 *
 * A search steps the YTO coarse tune outward from a starting code, nulling
 * the loop integrator around each write so the loop reacquires from zero,
 * and tests each code for lock with the band's detection strategy. Once
 * locked the correction voltage can be trimmed toward a target one code at
 * a time.
 * */
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

use crate::{
    config::BandConfig,
    events::{Event, EventCode, EventSink},
    registers::PllReadings,
    settle,
    tuning::{TuningMap, MAX_CODE},
    worker::{finish_with, Procedure, TaskContext},
    Cancel, Error, Hardware, Never, Register, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum LockDetectionStrategy {
    /// Lock detect voltage and both total power detectors above threshold.
    VoltageThreshold,
    /// [`VoltageThreshold`](Self::VoltageThreshold) twice, a few ms apart.
    DoubleSampleVoltage,
    /// Correction voltage falls as the code rises and holds still at a
    /// fixed code. For bands whose lock detector can't be trusted.
    CorrectionVoltageVariance,
}

/// Running min/max of correction voltage samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CorrectionVoltageStatistics {
    count: u32,
    min: f32,
    max: f32,
}

impl CorrectionVoltageStatistics {
    pub fn record(&mut self, cv: f32) {
        if self.count == 0 {
            self.min = cv;
            self.max = cv;
        } else {
            self.min = self.min.min(cv);
            self.max = self.max.max(cv);
        }
        self.count += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn min(&self) -> Option<f32> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f32> {
        (self.count > 0).then_some(self.max)
    }

    pub fn spread(&self) -> Option<f32> {
        (self.count > 0).then_some(self.max - self.min)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Searching(LockDetectionStrategy),
    Locked(LockDetectionStrategy),
    Failed,
}

pub struct PllLockController<H> {
    hw: H,
    config: BandConfig,
    map: TuningMap,
    sink: Arc<dyn EventSink>,
    strategy: LockDetectionStrategy,
    locked_with: Option<LockDetectionStrategy>,
    state: LockState,
    stats: CorrectionVoltageStatistics,
    readings: PllReadings,
    code: u16,
    window: (u16, u16),
}

impl<H: Hardware> PllLockController<H> {
    pub fn new(hw: H, config: BandConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hw,
            map: TuningMap::new(&config.calibration)?,
            strategy: config.lock.initial_strategy,
            config,
            sink,
            locked_with: None,
            state: LockState::Unlocked,
            stats: CorrectionVoltageStatistics::default(),
            readings: PllReadings::default(),
            code: 0,
            window: (0, MAX_CODE),
        })
    }

    pub fn config(&self) -> &BandConfig {
        &self.config
    }

    pub fn map(&self) -> &TuningMap {
        &self.map
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn into_inner(self) -> H {
        self.hw
    }

    /// Strategy currently believed to work for this band.
    pub fn strategy(&self) -> LockDetectionStrategy {
        self.strategy
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn statistics(&self) -> &CorrectionVoltageStatistics {
        &self.stats
    }

    /// Monitor values as of the last operation or [`refresh_monitor`](Self::refresh_monitor).
    pub fn readings(&self) -> &PllReadings {
        &self.readings
    }

    /// Last commanded tuning code.
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn search_for_lock(&mut self, coarse_code: u16, window_steps: u16, step_size: u16) -> Result<u16> {
        self.search_for_lock_cancellable(coarse_code, window_steps, step_size, &Never)
    }

    pub fn search_for_lock_cancellable(
        &mut self,
        coarse_code: u16,
        window_steps: u16,
        step_size: u16,
        cancel: &dyn Cancel,
    ) -> Result<u16> {
        let band = self.config.band;
        let result = self.search(coarse_code, window_steps, step_size, cancel);
        match &result {
            Ok(code) => {
                self.sink.emit_event(
                    Event::new(EventCode::LockFound, band)
                        .param(i32::from(*code))
                        .progress(100)
                        .message(format!("{:?}", self.strategy)),
                );
                self.sink.emit_status_message(
                    true,
                    &format!(
                        "band {band}: locked at code {code} ({:.4} GHz), CV {:.2} V",
                        self.map.frequency_from_code(*code).unwrap_or(f64::NAN),
                        self.readings.correction_voltage
                    ),
                );
            }
            Err(e) if e.is_cancelled() => {
                self.state = LockState::Unlocked;
                self.sink
                    .emit_status_message(true, &format!("band {band}: lock search cancelled at code {}", self.code));
            }
            Err(e) => {
                self.state = LockState::Failed;
                self.sink
                    .emit_event(Event::new(EventCode::LockFailed, band).param(i32::from(coarse_code)));
                self.sink.emit_status_message(
                    false,
                    &format!(
                        "band {band}: {e} (coarse {coarse_code}, window {window_steps}, LD {:.2} V, ref {:.2} V, IF {:.2} V)",
                        self.readings.lock_detect_voltage, self.readings.ref_total_power, self.readings.if_total_power
                    ),
                );
            }
        }
        result
    }

    fn search(&mut self, coarse: u16, window_steps: u16, step_size: u16, cancel: &dyn Cancel) -> Result<u16> {
        if coarse > MAX_CODE {
            return Err(Error::CodeOutOfRange(i32::from(coarse)));
        }
        if step_size == 0 {
            return Err(Error::InvalidParameter("lock search step size must be non-zero"));
        }
        self.stats.reset();
        self.locked_with = None;
        self.window = (coarse.saturating_sub(window_steps), coarse.saturating_add(window_steps).min(MAX_CODE));
        let candidates = candidates(coarse, step_size, self.window);
        self.sink
            .emit_event(Event::new(EventCode::LockSearchStarted, self.config.band).param(i32::from(coarse)));

        let mut strategy = self.config.lock.initial_strategy;
        loop {
            info!(band = %self.config.band, ?strategy, coarse, window = ?self.window, "searching for lock");
            self.state = LockState::Searching(strategy);
            if let Some(code) = self.scan(&candidates, strategy, cancel)? {
                self.hw.write_bool(Register::PllClearUnlockLatch, true)?;
                self.readings = PllReadings::read(&mut self.hw)?;
                self.strategy = strategy;
                self.locked_with = Some(strategy);
                self.state = LockState::Locked(strategy);
                info!(band = %self.config.band, ?strategy, code, "locked");
                return Ok(code);
            }
            if strategy == LockDetectionStrategy::VoltageThreshold && self.config.lock.allow_variance_fallback {
                warn!(band = %self.config.band, "no lock by voltage threshold, retrying with correction voltage variance");
                strategy = LockDetectionStrategy::CorrectionVoltageVariance;
                continue;
            }
            return Err(Error::NoLock { band: self.config.band });
        }
    }

    fn scan(&mut self, candidates: &[u16], strategy: LockDetectionStrategy, cancel: &dyn Cancel) -> Result<Option<u16>> {
        for (i, &code) in candidates.iter().enumerate() {
            if cancel.cancelled() {
                return Err(Error::Cancelled);
            }
            self.apply_code(code, strategy)?;
            self.sink.emit_event(
                Event::new(EventCode::LockSearchProgress, self.config.band)
                    .param(i32::from(code))
                    .progress(u8::try_from(i * 100 / candidates.len()).unwrap_or(100)),
            );
            if self.test_lock(strategy, cancel)? {
                return Ok(Some(code));
            }
        }
        Ok(None)
    }

    /// Write a code with the loop integrator held at zero. The integrator is
    /// released even if the code write fails.
    fn apply_code(&mut self, code: u16, strategy: LockDetectionStrategy) -> Result<()> {
        self.hw.write_bool(Register::PllNullLoopIntegrator, true)?;
        let written = self.hw.write_code(Register::YtoCoarseTune, code);
        if written.is_ok() {
            self.code = code;
            settle(self.config.lock.settle_ms(strategy));
        }
        let released = self
            .hw
            .write_bool(Register::PllNullLoopIntegrator, false)
            .and_then(|()| self.hw.write_bool(Register::PllClearUnlockLatch, true));
        written?;
        released
    }

    /// Move the code with the loop closed.
    fn step_to(&mut self, code: u16, settle_ms: u64) -> Result<()> {
        self.hw.write_code(Register::YtoCoarseTune, code)?;
        self.code = code;
        settle(settle_ms);
        Ok(())
    }

    /// A monitor readback that fails while testing a code means no sample
    /// there, so the code counts as unlocked.
    fn unavailable(&self, what: &str, e: &Error) {
        warn!(band = %self.config.band, code = self.code, "{what} unavailable: {e}");
    }

    fn voltage_check(&mut self) -> Result<bool> {
        match PllReadings::read(&mut self.hw) {
            Ok(readings) => self.readings = readings,
            Err(e) => {
                self.unavailable("PLL monitor", &e);
                return Ok(false);
            }
        }
        let lock = &self.config.lock;
        Ok(self
            .readings
            .flags(lock.lock_threshold, lock.min_ref_power, lock.min_if_power)
            .healthy())
    }

    fn test_lock(&mut self, strategy: LockDetectionStrategy, cancel: &dyn Cancel) -> Result<bool> {
        match strategy {
            LockDetectionStrategy::VoltageThreshold => self.voltage_check(),
            LockDetectionStrategy::DoubleSampleVoltage => {
                if !self.voltage_check()? {
                    return Ok(false);
                }
                settle(self.config.lock.double_sample_delay_ms);
                self.voltage_check()
            }
            LockDetectionStrategy::CorrectionVoltageVariance => self.variance_check(cancel),
        }
    }

    fn read_cv(&mut self) -> Result<f32> {
        let cv = self.hw.read_float(Register::PllCorrectionVoltage)?;
        self.readings.correction_voltage = cv;
        Ok(cv)
    }

    fn sample_cv(&mut self) -> Option<f32> {
        match self.read_cv() {
            Ok(cv) => Some(cv),
            Err(e) => {
                self.unavailable("correction voltage", &e);
                None
            }
        }
    }

    fn variance_check(&mut self, cancel: &dyn Cancel) -> Result<bool> {
        let c = self.code;
        if c.saturating_add(3) > self.window.1 {
            debug!(code = c, "variance test would leave the search window");
            return Ok(false);
        }
        let outcome = self.variance_samples(c, cancel);
        let restored = if self.code != c {
            self.step_to(c, self.config.lock.settle_ms_variance)
        } else {
            Ok(())
        };
        let locked = outcome?;
        restored?;
        Ok(locked)
    }

    fn variance_samples(&mut self, c: u16, cancel: &dyn Cancel) -> Result<bool> {
        let settle_ms = self.config.lock.settle_ms_variance;
        let Some(cv0) = self.sample_cv() else { return Ok(false) };
        self.step_to(c + 2, settle_ms)?;
        let Some(cv2) = self.sample_cv() else { return Ok(false) };
        self.step_to(c + 3, settle_ms)?;
        let Some(cv3) = self.sample_cv() else { return Ok(false) };
        if !(cv0 > cv2 && cv2 > cv3) {
            debug!(code = c, cv0, cv2, cv3, "correction voltage not tracking the code");
            return Ok(false);
        }

        self.step_to(c, settle_ms)?;
        self.stats.reset();
        for _ in 0..self.config.lock.variance_samples {
            if cancel.cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(cv) = self.sample_cv() else { return Ok(false) };
            self.stats.record(cv);
        }
        let spread = self.stats.spread().unwrap_or(f32::INFINITY);
        debug!(code = c, spread, "correction voltage spread");
        Ok(spread < self.config.lock.variance_threshold)
    }

    /// Trim the correction voltage toward `target_voltage`, one code at a
    /// time, with the loop closed.
    pub fn adjust_pll(&mut self, target_voltage: f32) -> Result<u16> {
        self.adjust_pll_cancellable(target_voltage, &Never)
    }

    pub fn adjust_pll_cancellable(&mut self, target_voltage: f32, cancel: &dyn Cancel) -> Result<u16> {
        let band = self.config.band;
        let result = self.adjust(target_voltage, cancel);
        match &result {
            Ok(code) => {
                self.sink
                    .emit_event(Event::new(EventCode::PllAdjusted, band).param(i32::from(*code)).progress(100));
                self.sink.emit_status_message(
                    true,
                    &format!(
                        "band {band}: PLL adjusted to code {code}, CV {:.2} V",
                        self.readings.correction_voltage
                    ),
                );
            }
            Err(e) if e.is_cancelled() => {
                self.sink
                    .emit_status_message(true, &format!("band {band}: PLL adjust cancelled at code {}", self.code));
            }
            Err(Error::LockLost) => {
                self.state = LockState::Unlocked;
                self.locked_with = None;
                self.sink
                    .emit_status_message(false, &format!("band {band}: lost lock adjusting PLL at code {}", self.code));
            }
            Err(e) => {
                self.sink.emit_status_message(
                    false,
                    &format!(
                        "band {band}: PLL adjust failed: {e} (code {}, CV {:.2} V, target {target_voltage} V)",
                        self.code, self.readings.correction_voltage
                    ),
                );
            }
        }
        result
    }

    fn adjust(&mut self, target: f32, cancel: &dyn Cancel) -> Result<u16> {
        if !target.is_finite() {
            return Err(Error::InvalidParameter("PLL adjust target must be finite"));
        }
        let lock = self.config.lock;
        self.stats.reset();
        self.code = self.hw.read_code(Register::YtoCoarseTune)?;
        let start = i32::from(self.code);
        self.hw.write_bool(Register::PllClearUnlockLatch, true)?;

        for iteration in 0..lock.adjust_max_iterations {
            if cancel.cancelled() {
                return Err(Error::Cancelled);
            }
            let cv = self.read_cv()?;
            self.stats.record(cv);
            if self.hw.read_bool(Register::PllUnlockDetectLatch)? {
                return Err(Error::LockLost);
            }
            let error = cv - target;
            debug!(iteration, code = self.code, cv, error, "adjust");
            if error.abs() <= lock.adjust_window {
                return self.confirm_adjusted(cancel);
            }

            // Correction voltage falls as the code rises
            let next = i32::from(self.code) + if error > 0.0 { 1 } else { -1 };
            if (next - start).unsigned_abs() > u32::from(lock.max_displacement) {
                warn!(code = self.code, cv, "PLL adjust hit its displacement limit");
                return Err(Error::NotConverged);
            }
            let next = u16::try_from(next)
                .ok()
                .filter(|c| *c <= MAX_CODE)
                .ok_or(Error::CodeOutOfRange(next))?;
            self.step_to(next, lock.adjust_settle_ms)?;
        }
        Err(Error::IterationLimit(lock.adjust_max_iterations))
    }

    fn confirm_adjusted(&mut self, cancel: &dyn Cancel) -> Result<u16> {
        let strategy = self.locked_with.unwrap_or(self.strategy);
        if !self.test_lock(strategy, cancel)? {
            return Err(Error::LockLost);
        }
        self.hw.write_bool(Register::PllClearUnlockLatch, true)?;
        self.readings.unlock_detected = false;
        self.locked_with = Some(strategy);
        self.state = LockState::Locked(strategy);
        Ok(self.code)
    }

    /// Lock state for display, from cached values only.
    pub fn monitor_lock_for_display(&self) -> bool {
        let lock = &self.config.lock;
        match self.locked_with {
            None => false,
            Some(LockDetectionStrategy::CorrectionVoltageVariance) => {
                !self.readings.unlock_detected
                    && self.stats.spread().map_or(false, |s| s < lock.variance_threshold)
            }
            Some(_) => {
                let flags = self
                    .readings
                    .flags(lock.lock_threshold, lock.min_ref_power, lock.min_if_power);
                flags.healthy() && !self.readings.unlock_detected
            }
        }
    }

    /// Read fresh monitor values into the cache.
    pub fn refresh_monitor(&mut self) -> Result<&PllReadings> {
        self.readings = PllReadings::read(&mut self.hw)?;
        if self.locked_with == Some(LockDetectionStrategy::CorrectionVoltageVariance) {
            self.stats.record(self.readings.correction_voltage);
        }
        Ok(&self.readings)
    }

    /// Tune to an LO frequency and search the band's default window.
    pub fn lock_lo(&mut self, lo_ghz: f64) -> Result<u16> {
        self.lock_lo_cancellable(lo_ghz, &Never)
    }

    pub fn lock_lo_cancellable(&mut self, lo_ghz: f64, cancel: &dyn Cancel) -> Result<u16> {
        let coarse = match self.map.code_for_lo(&self.config.lo_chain, lo_ghz) {
            Ok(code) => code,
            Err(e) => {
                self.sink.emit_status_message(
                    false,
                    &format!("band {}: LO {lo_ghz} GHz: {e}", self.config.band),
                );
                return Err(e);
            }
        };
        self.hw
            .write_bool(Register::PllSidebandLockBelow, self.config.lo_chain.lock_below_ref)?;
        let lock = self.config.lock;
        self.search_for_lock_cancellable(coarse, lock.window_steps, lock.step_size, cancel)
    }
}

/// Coarse code first, then alternating either side of it, clipped to the
/// window.
fn candidates(coarse: u16, step: u16, (lo, hi): (u16, u16)) -> Vec<u16> {
    let (coarse, step) = (i32::from(coarse), i32::from(step));
    let reach = (i32::from(hi) - coarse).max(coarse - i32::from(lo)) / step;
    std::iter::once(coarse)
        .chain((1..=reach).flat_map(|k| [coarse + k * step, coarse - k * step]))
        .filter(|c| (i32::from(lo)..=i32::from(hi)).contains(c))
        .filter_map(|c| u16::try_from(c).ok())
        .collect()
}

/// Runs one lock search on a worker thread.
pub struct LockSearchProcedure<H> {
    pub controller: PllLockController<H>,
    pub coarse_code: u16,
    pub window_steps: u16,
    pub step_size: u16,
    pub result: Option<Result<u16>>,
}

impl<H: Hardware + 'static> Procedure for LockSearchProcedure<H> {
    fn action(&mut self, ctx: &TaskContext) {
        let result =
            self.controller
                .search_for_lock_cancellable(self.coarse_code, self.window_steps, self.step_size, ctx);
        finish_with(ctx, &mut self.result, result);
    }
}

/// Runs one correction voltage trim on a worker thread.
pub struct PllAdjustProcedure<H> {
    pub controller: PllLockController<H>,
    pub target_voltage: f32,
    pub result: Option<Result<u16>>,
}

impl<H: Hardware + 'static> Procedure for PllAdjustProcedure<H> {
    fn action(&mut self, ctx: &TaskContext) {
        let result = self.controller.adjust_pll_cancellable(self.target_voltage, ctx);
        finish_with(ctx, &mut self.result, result);
    }
}

#[cfg(test)]
use crate::{
    config::band,
    events::{ChannelSink, Notification, NullSink},
    sim::{PllModel, SimulatedFrontEnd, Write},
    Band,
};

#[cfg(test)]
fn controller(pll: PllModel, config: BandConfig) -> PllLockController<SimulatedFrontEnd> {
    PllLockController::new(SimulatedFrontEnd::new(pll), config.without_delays(), Arc::new(NullSink)).unwrap()
}

#[cfg(test)]
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn search_stays_in_window(
        coarse in 0..=MAX_CODE,
        window in 0u16..120,
        step in 1u16..8,
        center in 0..=MAX_CODE,
        broken: bool,
    ) {
        let pll = PllModel { lock_center: center, lock_detect_broken: broken, ..PllModel::default() };
        let mut c = controller(pll, band::BAND7);
        let _ = c.search_for_lock(coarse, window, step);
        let lo = coarse.saturating_sub(window);
        let hi = coarse.saturating_add(window).min(MAX_CODE);
        for code in c.hw().code_writes() {
            assert!((lo..=hi).contains(&code), "{code} outside {lo}..={hi}");
        }
    }

    #[test]
    fn stats_spread(samples in proptest::collection::vec(-10.0f32..10.0, 1..20)) {
        let mut stats = CorrectionVoltageStatistics::default();
        for &s in &samples {
            stats.record(s);
        }
        let max = samples.iter().cloned().fold(f32::MIN, f32::max);
        let min = samples.iter().cloned().fold(f32::MAX, f32::min);
        assert_eq!(Some(max - min), stats.spread());
        assert_eq!(samples.len() as u32, stats.count());
    }
}

#[test]
fn candidate_order() {
    assert_eq!(vec![10, 12, 8, 14, 6], candidates(10, 2, (6, 14)));
    assert_eq!(vec![1, 2, 0, 3, 4], candidates(1, 1, (0, 4)));
    assert_eq!(vec![MAX_CODE, MAX_CODE - 3], candidates(MAX_CODE, 3, (MAX_CODE - 4, MAX_CODE)));
}

#[test]
fn finds_lock_by_voltage() {
    let mut c = controller(PllModel::default(), band::BAND6);
    let code = c.search_for_lock(2030, 50, 1).unwrap();
    // First code inside the 2042..=2054 capture range, walking outward
    assert_eq!(2042, code);
    assert_eq!(LockState::Locked(LockDetectionStrategy::VoltageThreshold), c.state());
    assert!(c.monitor_lock_for_display());
    assert!(!c.hw_mut().read_bool(Register::PllUnlockDetectLatch).unwrap());
}

#[test]
fn code_sequence_nulls_integrator() {
    let mut c = controller(PllModel::default(), band::BAND6);
    c.search_for_lock(2048, 0, 1).unwrap();
    assert_eq!(
        &[
            Write::Bool(Register::PllNullLoopIntegrator, true),
            Write::Code(Register::YtoCoarseTune, 2048),
            Write::Bool(Register::PllNullLoopIntegrator, false),
            Write::Bool(Register::PllClearUnlockLatch, true),
        ],
        &c.hw().writes()[..4]
    );
}

#[test]
fn falls_back_to_variance() {
    let pll = PllModel {
        lock_detect_broken: true,
        ..PllModel::default()
    };
    let mut c = controller(pll, band::BAND6);
    let code = c.search_for_lock(2030, 50, 1).unwrap();
    assert_eq!(2042, code);
    assert_eq!(2042, c.hw().yto_code());
    assert_eq!(LockDetectionStrategy::CorrectionVoltageVariance, c.strategy());
    assert!(c.monitor_lock_for_display());
}

#[test]
fn no_fallback_on_low_bands() {
    let pll = PllModel {
        lock_detect_broken: true,
        ..PllModel::default()
    };
    let mut c = controller(pll, band::BAND3);
    assert!(matches!(c.search_for_lock(2030, 50, 1), Err(Error::NoLock { band: Band(3) })));
    assert_eq!(LockState::Failed, c.state());
    assert!(!c.monitor_lock_for_display());
}

#[test]
fn double_sample_band() {
    let mut c = controller(PllModel::default(), band::BAND4);
    assert_eq!(2054, c.search_for_lock(2060, 20, 1).unwrap());
    assert_eq!(LockState::Locked(LockDetectionStrategy::DoubleSampleVoltage), c.state());
}

#[test]
fn missing_reference_power() {
    let pll = PllModel {
        ref_total_power: -0.1,
        ..PllModel::default()
    };
    let mut c = controller(pll, band::BAND3);
    // Every code in this window is inside the capture range
    assert!(c.search_for_lock(2048, 4, 1).is_err());
    assert!(c.readings().lock_detect_voltage > 3.0);
}

#[test]
fn adjust_walks_cv_to_target() {
    let mut c = controller(PllModel::default(), band::BAND6);
    c.search_for_lock(2030, 50, 1).unwrap();
    // 0.4 V per code above 2048
    let code = c.adjust_pll(0.0).unwrap();
    assert_eq!(2047, code);
    assert!(c.readings().correction_voltage.abs() <= 0.5);
    assert!(c.monitor_lock_for_display());
}

#[test]
fn adjust_displacement_limit() {
    let mut c = controller(
        PllModel {
            capture_range: 40,
            volts_per_code: 0.05,
            ..PllModel::default()
        },
        band::BAND6,
    );
    c.search_for_lock(2010, 50, 1).unwrap();
    // 38 codes away, limit is 20
    assert!(matches!(c.adjust_pll(0.0), Err(Error::NotConverged)));
}

#[test]
fn adjust_reports_lost_lock() {
    let (sink, rx) = ChannelSink::new();
    let mut c = PllLockController::new(
        SimulatedFrontEnd::default(),
        band::BAND6.without_delays(),
        Arc::new(sink),
    )
    .unwrap();
    c.search_for_lock(2030, 50, 1).unwrap();
    // Walking down past the capture range
    assert!(matches!(c.adjust_pll(6.0), Err(Error::LockLost)));
    assert_eq!(LockState::Unlocked, c.state());
    let last = rx.try_iter().last().unwrap();
    assert!(matches!(last, Notification::Status { success: false, .. }));
}

#[test]
fn lock_lo_band6() {
    let mut c = controller(PllModel::default(), band::BAND6);
    let map = *c.map();
    let chain = c.config().lo_chain;
    // LO whose YTO code lands near the simulated lock center
    let lo = map.frequency_from_code(2040).unwrap() * f64::from(chain.multiplier());
    let code = c.lock_lo(lo).unwrap();
    assert!(code.abs_diff(2048) <= 6);
    assert!(c.lock_lo(100.0).is_err());
}

#[test]
fn monitor_uses_cache() {
    let mut c = controller(PllModel::default(), band::BAND6);
    c.search_for_lock(2048, 0, 1).unwrap();
    c.hw_mut().write_code(Register::YtoCoarseTune, 100).unwrap();
    assert!(c.monitor_lock_for_display());
    c.refresh_monitor().unwrap();
    assert!(!c.monitor_lock_for_display());
}

#[test]
fn failed_code_write_releases_integrator() {
    let mut c = controller(PllModel::default(), band::BAND6);
    c.hw_mut().inject_fault(Register::YtoCoarseTune);
    assert!(matches!(c.search_for_lock(2048, 10, 1), Err(Error::Hardware(_))));
    assert_eq!(LockState::Failed, c.state());
    assert!(!c.hw_mut().read_bool(Register::PllNullLoopIntegrator).unwrap());
    assert!(!c.hw_mut().read_bool(Register::PllUnlockDetectLatch).unwrap());
    assert_eq!(None, c.hw().code_writes().next());
    assert_eq!(
        &[
            Write::Bool(Register::PllNullLoopIntegrator, true),
            Write::Bool(Register::PllNullLoopIntegrator, false),
            Write::Bool(Register::PllClearUnlockLatch, true),
        ],
        c.hw().writes()
    );
}

#[test]
fn readback_fault_skips_code() {
    let mut c = controller(PllModel::default(), band::BAND3);
    c.hw_mut().inject_fault(Register::PllIfTotalPower);
    // Every code in the window is tried, none can be confirmed
    assert!(matches!(c.search_for_lock(2048, 2, 1), Err(Error::NoLock { band: Band(3) })));
    assert_eq!(vec![2048, 2049, 2047, 2050, 2046], c.hw().code_writes().collect::<Vec<_>>());

    c.hw_mut().clear_faults();
    c.hw_mut().clear_writes();
    assert_eq!(2048, c.search_for_lock(2048, 2, 1).unwrap());
    assert_eq!(vec![2048], c.hw().code_writes().collect::<Vec<_>>());
}

#[test]
fn variance_readback_fault_is_not_lock() {
    let pll = PllModel {
        lock_detect_broken: true,
        ..PllModel::default()
    };
    let mut c = controller(pll, band::BAND6);
    c.hw_mut().inject_fault(Register::PllCorrectionVoltage);
    assert!(matches!(c.search_for_lock(2048, 3, 1), Err(Error::NoLock { .. })));
    assert!(!c.hw_mut().read_bool(Register::PllNullLoopIntegrator).unwrap());
}

#[test]
fn rejects_bad_search() {
    let mut c = controller(PllModel::default(), band::BAND6);
    assert!(matches!(c.search_for_lock(4096, 10, 1), Err(Error::CodeOutOfRange(4096))));
    assert!(matches!(c.search_for_lock(100, 10, 0), Err(Error::InvalidParameter(_))));
    assert!(c.hw().writes().is_empty());
}
