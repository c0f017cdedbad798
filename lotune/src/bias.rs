//! Drives a PA drain voltage until the SIS mixer current reaches a target.
//!
//! Three stages: a slope estimate around the start voltage, coarse steps of
//! a quarter of the predicted correction until the current error changes
//! sign, then 10 mV steps back across the target and a final 5 mV nudge.
//! This assumes the current is monotonic in the drain voltage near the
//! start point. It is not a global search.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
#[cfg(test)] use proptest::prelude::*;

use crate::{
    events::{Event, EventCode, EventSink},
    settle,
    worker::{finish_with, Procedure, TaskContext},
    Band, Cancel, Error, Hardware, Never, Polarization, Register, Result,
};

/// PA drain voltage output range.
pub const DRAIN_MIN_V: f32 = 0.0;
pub const DRAIN_MAX_V: f32 = 2.5;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasServoParams {
    /// Half width of the slope estimate, V.
    pub slope_delta_v: f32,
    /// Largest coarse step, V.
    pub max_step_v: f32,
    pub coarse_iterations: u32,
    pub fine_step_v: f32,
    pub fine_iterations: u32,
    pub very_fine_step_v: f32,
    pub settle_ms: u64,
    /// Readbacks averaged per measurement.
    pub average_count: u32,
}

impl Default for BiasServoParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BiasServoParams {
    pub const DEFAULT: Self = Self {
        slope_delta_v: 0.1,
        max_step_v: 0.1,
        coarse_iterations: 40,
        fine_step_v: 0.01,
        fine_iterations: 20,
        very_fine_step_v: 0.005,
        settle_ms: 10,
        average_count: 3,
    };

    pub fn validate(&self) -> Result<()> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !(positive(self.slope_delta_v)
            && positive(self.max_step_v)
            && positive(self.fine_step_v)
            && positive(self.very_fine_step_v))
        {
            return Err(Error::InvalidParameter("bias servo steps must be positive"));
        }
        if self.average_count == 0 {
            return Err(Error::InvalidParameter("bias servo must average at least one readback"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiasAdjustment {
    /// Drain voltage left on the hardware.
    pub voltage: f32,
    /// False if the search clamped or never crossed the target.
    pub found_min: bool,
}

pub struct BiasCurrentServo<H> {
    hw: H,
    band: Band,
    params: BiasServoParams,
    sink: Arc<dyn EventSink>,
}

fn millivolts(v: f32) -> i32 {
    (v * 1000.0).round() as i32
}

fn in_range(v: f32) -> bool {
    (DRAIN_MIN_V..=DRAIN_MAX_V).contains(&v)
}

impl<H: Hardware> BiasCurrentServo<H> {
    pub fn new(hw: H, band: Band, params: BiasServoParams, sink: Arc<dyn EventSink>) -> Self {
        Self {
            hw,
            band,
            params,
            sink,
        }
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

    pub fn adjust(
        &mut self,
        pol: Polarization,
        start_voltage: f32,
        target_current: f32,
        verbose: bool,
    ) -> Result<BiasAdjustment> {
        self.adjust_cancellable(pol, start_voltage, target_current, verbose, &Never)
    }

    pub fn adjust_cancellable(
        &mut self,
        pol: Polarization,
        start_voltage: f32,
        target_current: f32,
        verbose: bool,
        cancel: &dyn Cancel,
    ) -> Result<BiasAdjustment> {
        self.sink.emit_event(
            Event::new(EventCode::BiasAdjustStarted, self.band)
                .pol(pol)
                .param(millivolts(start_voltage))
                .message(format!("target {target_current} uA")),
        );
        let result = self.run(pol, start_voltage, target_current, verbose, cancel);
        match &result {
            Ok(adj) => {
                self.sink.emit_event(
                    Event::new(EventCode::BiasAdjusted, self.band)
                        .pol(pol)
                        .param(millivolts(adj.voltage))
                        .progress(100),
                );
                let text = format!(
                    "band {} {pol}: drain {:.3} V for {target_current} uA{}",
                    self.band,
                    adj.voltage,
                    if adj.found_min { "" } else { ", target not bracketed" }
                );
                self.sink.emit_status_message(adj.found_min, &text);
            }
            Err(e) if e.is_cancelled() => {
                self.sink
                    .emit_status_message(true, &format!("band {} {pol}: bias adjust cancelled", self.band));
            }
            Err(e) => {
                self.sink
                    .emit_status_message(false, &format!("band {} {pol}: bias adjust failed: {e}", self.band));
            }
        }
        result
    }

    fn run(
        &mut self,
        pol: Polarization,
        start: f32,
        target: f32,
        verbose: bool,
        cancel: &dyn Cancel,
    ) -> Result<BiasAdjustment> {
        self.params.validate()?;
        if !start.is_finite() || !target.is_finite() {
            return Err(Error::InvalidParameter("bias start voltage and target must be finite"));
        }
        let p = self.params;

        // Slope
        let (lo, hi) = (start - p.slope_delta_v, start + p.slope_delta_v);
        if !in_range(lo) || !in_range(hi) {
            let v = start.clamp(DRAIN_MIN_V, DRAIN_MAX_V);
            warn!(%pol, start, "slope estimate needs clamping");
            return self.give_up(pol, v);
        }
        let i_lo = self.measure(pol, lo, cancel)?;
        let i_hi = self.measure(pol, hi, cancel)?;
        let slope = (i_hi - i_lo) / (hi - lo);
        let mut v = start;
        let mut err = target - self.measure(pol, v, cancel)?;
        debug!(%pol, slope, err, "slope estimate");
        if err == 0.0 {
            return Ok(BiasAdjustment { voltage: v, found_min: true });
        }
        if slope == 0.0 || !slope.is_finite() {
            warn!(%pol, slope, "no usable slope");
            return Ok(BiasAdjustment { voltage: v, found_min: false });
        }

        // Coarse
        let step = (err / slope / 4.0).clamp(-p.max_step_v, p.max_step_v);
        let mut prev = (v, err);
        let mut crossed = false;
        for _ in 0..p.coarse_iterations {
            let next = v + step;
            if !in_range(next) {
                return self.give_up(pol, next.clamp(DRAIN_MIN_V, DRAIN_MAX_V));
            }
            prev = (v, err);
            v = next;
            err = target - self.measure(pol, v, cancel)?;
            self.progress(verbose, pol, v, 25);
            if err == 0.0 {
                return Ok(BiasAdjustment { voltage: v, found_min: true });
            }
            if err.signum() != prev.1.signum() {
                crossed = true;
                break;
            }
        }
        if !crossed {
            warn!(%pol, v, err, "coarse search never crossed the target");
            return Ok(BiasAdjustment { voltage: v, found_min: false });
        }
        debug!(%pol, v, err, "coarse done");

        // Fine, back across the target
        let fine = (err * slope).signum() * p.fine_step_v;
        crossed = false;
        for _ in 0..p.fine_iterations {
            let next = v + fine;
            if !in_range(next) {
                return self.give_up(pol, next.clamp(DRAIN_MIN_V, DRAIN_MAX_V));
            }
            prev = (v, err);
            v = next;
            err = target - self.measure(pol, v, cancel)?;
            self.progress(verbose, pol, v, 60);
            if err == 0.0 {
                return Ok(BiasAdjustment { voltage: v, found_min: true });
            }
            if err.signum() != prev.1.signum() {
                crossed = true;
                break;
            }
        }
        if !crossed {
            warn!(%pol, v, err, "fine search never crossed the target");
            return Ok(BiasAdjustment { voltage: v, found_min: false });
        }
        if prev.1.abs() < err.abs() {
            (v, err) = prev;
            self.write(pol, v)?;
        }
        debug!(%pol, v, err, "fine done");

        // Very fine, kept only if it helps
        let next = v + (err * slope).signum() * p.very_fine_step_v;
        if in_range(next) {
            let next_err = target - self.measure(pol, next, cancel)?;
            self.progress(verbose, pol, next, 90);
            if next_err.abs() < err.abs() {
                v = next;
                err = next_err;
            } else {
                self.write(pol, v)?;
            }
        }
        info!(%pol, v, err, "bias adjusted");
        Ok(BiasAdjustment { voltage: v, found_min: true })
    }

    fn give_up(&mut self, pol: Polarization, v: f32) -> Result<BiasAdjustment> {
        self.write(pol, v)?;
        Ok(BiasAdjustment { voltage: v, found_min: false })
    }

    fn progress(&self, verbose: bool, pol: Polarization, v: f32, progress: u8) {
        if verbose {
            self.sink.emit_event(
                Event::new(EventCode::BiasAdjustProgress, self.band)
                    .pol(pol)
                    .param(millivolts(v))
                    .progress(progress),
            );
        }
    }

    fn write(&mut self, pol: Polarization, v: f32) -> Result<()> {
        self.hw.write_float(Register::pa_drain_voltage(pol), v)
    }

    /// Set the drain voltage and return the averaged mixer current.
    fn measure(&mut self, pol: Polarization, v: f32, cancel: &dyn Cancel) -> Result<f32> {
        if cancel.cancelled() {
            return Err(Error::Cancelled);
        }
        self.write(pol, v)?;
        settle(self.params.settle_ms);
        let reg = Register::sis_current(pol, 1);
        let mut sum = 0.0;
        for _ in 0..self.params.average_count {
            sum += self.hw.read_float(reg)?;
        }
        Ok(sum / self.params.average_count as f32)
    }
}

/// Runs one bias adjustment on a worker thread.
pub struct BiasServoProcedure<H> {
    pub servo: BiasCurrentServo<H>,
    pub pol: Polarization,
    pub start_voltage: f32,
    pub target_current: f32,
    pub verbose: bool,
    pub result: Option<Result<BiasAdjustment>>,
}

impl<H: Hardware + 'static> Procedure for BiasServoProcedure<H> {
    fn action(&mut self, ctx: &TaskContext) {
        let result = self.servo.adjust_cancellable(
            self.pol,
            self.start_voltage,
            self.target_current,
            self.verbose,
            ctx,
        );
        // Not bracketing the target counts as a failed run
        let found = matches!(result, Ok(BiasAdjustment { found_min: true, .. }));
        finish_with(ctx, &mut self.result, result);
        if !found {
            ctx.set_finished(false);
        }
    }
}

#[cfg(test)]
use crate::{events::NullSink, sim::SimulatedFrontEnd};

#[cfg(test)]
fn servo() -> BiasCurrentServo<SimulatedFrontEnd> {
    let params = BiasServoParams {
        settle_ms: 0,
        ..BiasServoParams::DEFAULT
    };
    BiasCurrentServo::new(SimulatedFrontEnd::default(), Band(6), params, Arc::new(NullSink))
}

#[cfg(test)]
proptest! {
    #[test]
    fn voltage_stays_in_range(pol: Polarization, start in 0.0f32..2.5, target in -10.0f32..80.0) {
        let mut s = servo();
        let adj = s.adjust(pol, start, target, false).unwrap();
        assert!(in_range(adj.voltage));
        assert_eq!(adj.voltage, s.hw().drain_voltage(pol));
    }

    #[test]
    fn clamped_slope_estimate(start in prop_oneof![0.0f32..0.09, 2.41f32..2.5], target in 0.0f32..50.0) {
        let mut s = servo();
        let adj = s.adjust(Polarization::Pol0, start, target, false).unwrap();
        assert!(!adj.found_min);
        assert_eq!(start, adj.voltage);
    }
}

#[test]
fn converges_on_linear_mixer() {
    let mut s = servo();
    let adj = s.adjust(Polarization::Pol1, 1.0, 30.0, true).unwrap();
    assert!(adj.found_min);
    // 20 uA/V, so 1.5 V
    assert!((adj.voltage - 1.5).abs() <= 0.0051, "{adj:?}");
    assert_eq!(0.0, s.hw().drain_voltage(Polarization::Pol0));
}

#[test]
fn converges_downward() {
    let mut s = servo();
    let adj = s.adjust(Polarization::Pol0, 2.0, 11.0, false).unwrap();
    assert!(adj.found_min);
    assert!((adj.voltage - 0.55).abs() <= 0.0051, "{adj:?}");
}

#[test]
fn unreachable_target_clamps() {
    let mut s = servo();
    let adj = s.adjust(Polarization::Pol0, 1.0, 70.0, false).unwrap();
    assert!(!adj.found_min);
    assert_eq!(DRAIN_MAX_V, adj.voltage);
}

#[test]
fn flat_mixer_gives_up() {
    let mut s = servo();
    s.hw_mut().bias[0].ua_per_volt = 0.0;
    let adj = s.adjust(Polarization::Pol0, 1.0, 10.0, false).unwrap();
    assert!(!adj.found_min);
    assert_eq!(1.0, adj.voltage);
}

#[test]
fn readback_fault_propagates() {
    let mut s = servo();
    s.hw_mut().inject_fault(Register::SisPol0Sb1Current);
    assert!(matches!(s.adjust(Polarization::Pol0, 1.0, 10.0, false), Err(Error::Hardware(_))));
}
