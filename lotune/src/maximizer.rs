//! Bounded single variable hill climbing.
//!
//! The search holds a window of three samples one step apart, ordered in the
//! current search direction, and moves it one step at a time toward higher
//! dependent values. The step size never changes, so the result is only as
//! fine as the step.
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    events::{Event, EventCode, EventSink},
    settle,
    worker::{finish_with, Procedure, TaskContext},
    Band, Cancel, Error, Hardware, Polarization, Register, Result,
};

/// A dependent value readback, which may need several polls to arrive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reading {
    Ready(f32),
    Pending,
}

/// The thing being maximized.
///
/// Reading the dependent value is two phase: `request_dependent_value` starts
/// a measurement and may already return it; otherwise `get_dependent_value`
/// is polled until it is ready.
pub trait MaximizerTarget {
    fn set_control_value(&mut self, value: f32) -> Result<()>;
    fn request_dependent_value(&mut self) -> Result<Reading>;
    fn get_dependent_value(&mut self) -> Result<Reading>;
}

impl<T: MaximizerTarget + ?Sized> MaximizerTarget for &mut T {
    fn set_control_value(&mut self, value: f32) -> Result<()> {
        (**self).set_control_value(value)
    }
    fn request_dependent_value(&mut self) -> Result<Reading> {
        (**self).request_dependent_value()
    }
    fn get_dependent_value(&mut self) -> Result<Reading> {
        (**self).get_dependent_value()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaximizeParams {
    pub start: f32,
    pub step: f32,
    pub min: f32,
    pub max: f32,
    pub direction_up: bool,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for MaximizeParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl MaximizeParams {
    /// Drain voltage sweep over the PA output range.
    pub const DEFAULT: Self = Self {
        start: 0.0,
        step: 0.01,
        min: 0.0,
        max: 2.5,
        direction_up: true,
        max_iterations: 200,
        timeout_ms: 1000,
        poll_interval_ms: 10,
    };

    pub fn validate(&self) -> Result<()> {
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(Error::InvalidParameter("maximizer step must be positive"));
        }
        if !(self.min <= self.max) {
            return Err(Error::InvalidParameter("maximizer bounds must satisfy min <= max"));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter("maximizer needs at least one iteration"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchSample {
    pub control: f32,
    pub dependent: f32,
}

/// Aborts a running [`HillClimbSearch::maximize`] from another thread.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cancel for StopHandle {
    fn cancelled(&self) -> bool {
        self.requested()
    }
}

#[derive(Default)]
pub struct HillClimbSearch {
    stop: StopHandle,
    stopped: bool,
    last_control: Option<f32>,
    samples: VecDeque<SearchSample>,
    sink: Option<(Band, Arc<dyn EventSink>)>,
}

const SAMPLE_HISTORY: usize = 4;

impl HillClimbSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A search that reports its progress and outcome for `band`.
    pub fn with_sink(band: Band, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink: Some((band, sink)),
            ..Self::default()
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop_maximizer(&self) {
        self.stop.stop();
    }

    /// True if the last search ended because it was stopped.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Last control value written to the target, whatever the outcome.
    pub fn last_control(&self) -> Option<f32> {
        self.last_control
    }

    /// Most recent samples, oldest first.
    pub fn samples(&self) -> &VecDeque<SearchSample> {
        &self.samples
    }

    /// Find the control value giving the highest dependent value. On success
    /// the target is left at the returned control value.
    pub fn maximize<T: MaximizerTarget + ?Sized>(
        &mut self,
        target: &mut T,
        params: &MaximizeParams,
        cancel: &dyn Cancel,
    ) -> Result<f32> {
        params.validate()?;
        self.stop.clear();
        self.stopped = false;
        self.last_control = None;
        self.samples.clear();

        let result = self.climb(target, params, cancel);
        match &result {
            Ok(v) => info!("maximum at {v}"),
            Err(e) if e.is_cancelled() => {
                self.stopped = true;
                info!("maximizer stopped at {:?}", self.last_control);
            }
            Err(e) => debug!("maximizer failed: {e}"),
        }
        if let Some((band, sink)) = &self.sink {
            match &result {
                Ok(v) => sink.emit_status_message(true, &format!("band {band}: maximum at {v:.3}")),
                Err(e) if e.is_cancelled() => sink.emit_status_message(
                    true,
                    &format!("band {band}: maximizer stopped at {:?}", self.last_control),
                ),
                Err(e) => sink.emit_status_message(
                    false,
                    &format!(
                        "band {band}: maximizer failed: {e} (start {}, step {}, last {:?})",
                        params.start, params.step, self.last_control
                    ),
                ),
            }
        }
        result
    }

    fn report_progress(&self, iteration: u32, params: &MaximizeParams, control: f32) {
        if let Some((band, sink)) = &self.sink {
            let percent = u64::from(iteration) * 100 / u64::from(params.max_iterations);
            sink.emit_event(
                Event::new(EventCode::MaximizerProgress, *band)
                    .param(i32::try_from(iteration).unwrap_or(i32::MAX))
                    .progress(u8::try_from(percent).unwrap_or(100))
                    .message(format!("{control:.3}")),
            );
        }
    }

    fn climb<T: MaximizerTarget + ?Sized>(
        &mut self,
        target: &mut T,
        params: &MaximizeParams,
        cancel: &dyn Cancel,
    ) -> Result<f32> {
        let step = params.step;
        let mut dir: f32 = if params.direction_up { 1.0 } else { -1.0 };

        let (mut a1, mut a2, mut a3) = (params.start, params.start + dir * step, params.start + 2.0 * dir * step);
        let mut p1 = self.sample(target, a1, params, cancel)?;
        let mut p2 = self.sample(target, a2, params, cancel)?;
        let mut p3 = self.sample(target, a3, params, cancel)?;

        for iteration in 0..params.max_iterations {
            debug!(iteration, a1, a2, a3, p1, p2, p3, dir, "window");
            self.report_progress(iteration, params, a2);
            if p1 == p2 && p2 == p3 {
                return Err(Error::FlatResponse);
            }

            if p3 >= p2 {
                // Still climbing
                (a1, p1) = (a2, p2);
                (a2, p2) = (a3, p3);
                a3 = a2 + dir * step;
                p3 = self.sample(target, a3, params, cancel)?;
            } else if p2 < p1 {
                // Falling, turn around with the better sample leading
                dir = -dir;
                let (old_a1, old_p1) = (a1, p1);
                (a1, p1) = (a2, p2);
                (a2, p2) = (old_a1, old_p1);
                a3 = old_a1 + dir * step;
                p3 = self.sample(target, a3, params, cancel)?;
            } else {
                // Peak candidate at a2, check one step past a1
                let a4 = a1 - dir * step;
                let p4 = self.sample(target, a4, params, cancel)?;
                if p4 < p1 {
                    // Falls away on both sides of a2
                    target.set_control_value(a2)?;
                    self.last_control = Some(a2);
                    return Ok(a2);
                }
                // a1 is a dip and the response rises again past it
                dir = -dir;
                let (old_a1, old_p1) = (a1, p1);
                (a1, p1) = (a2, p2);
                (a2, p2) = (old_a1, old_p1);
                (a3, p3) = (a4, p4);
            }
        }
        Err(Error::IterationLimit(params.max_iterations))
    }

    fn check_cancel(&self, cancel: &dyn Cancel) -> Result<()> {
        if self.stop.requested() || cancel.cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn sample<T: MaximizerTarget + ?Sized>(
        &mut self,
        target: &mut T,
        control: f32,
        params: &MaximizeParams,
        cancel: &dyn Cancel,
    ) -> Result<f32> {
        self.check_cancel(cancel)?;
        if !(params.min..=params.max).contains(&control) {
            return Err(Error::OutOfRange {
                value: control,
                min: params.min,
                max: params.max,
            });
        }
        target.set_control_value(control)?;
        self.last_control = Some(control);

        let begin = Instant::now();
        let timeout = Duration::from_millis(params.timeout_ms);
        let mut reading = target.request_dependent_value()?;
        let dependent = loop {
            if let Reading::Ready(v) = reading {
                break v;
            }
            self.check_cancel(cancel)?;
            if begin.elapsed() >= timeout {
                return Err(Error::Timeout {
                    waited_ms: begin.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(Duration::from_millis(params.poll_interval_ms));
            reading = target.get_dependent_value()?;
        };

        if self.samples.len() == SAMPLE_HISTORY {
            self.samples.pop_front();
        }
        self.samples.push_back(SearchSample { control, dependent });
        Ok(dependent)
    }
}

/// Runs one maximization on a worker thread.
pub struct MaximizerProcedure<T> {
    pub target: T,
    pub params: MaximizeParams,
    pub search: HillClimbSearch,
    pub result: Option<Result<f32>>,
}

impl<T: MaximizerTarget + Send + 'static> MaximizerProcedure<T> {
    pub fn new(target: T, params: MaximizeParams, band: Band, sink: Arc<dyn EventSink>) -> Self {
        Self {
            target,
            params,
            search: HillClimbSearch::with_sink(band, sink),
            result: None,
        }
    }
}

impl<T: MaximizerTarget + Send + 'static> Procedure for MaximizerProcedure<T> {
    fn action(&mut self, ctx: &TaskContext) {
        let result = self.search.maximize(&mut self.target, &self.params, ctx);
        finish_with(ctx, &mut self.result, result);
    }
}

/// IF output power as a function of one polarization's PA drain voltage.
pub struct IfPowerTarget<H> {
    pub hw: H,
    pub pol: Polarization,
    pub settle_ms: u64,
}

impl<H: Hardware> MaximizerTarget for IfPowerTarget<H> {
    fn set_control_value(&mut self, value: f32) -> Result<()> {
        self.hw.write_float(Register::pa_drain_voltage(self.pol), value)
    }

    fn request_dependent_value(&mut self) -> Result<Reading> {
        settle(self.settle_ms);
        self.get_dependent_value()
    }

    fn get_dependent_value(&mut self) -> Result<Reading> {
        Ok(Reading::Ready(self.hw.read_float(Register::if_power(self.pol))?))
    }
}

/// Evaluates a closure, optionally making the reader poll a few times.
#[cfg(test)]
struct FnTarget<F> {
    f: F,
    control: f32,
    polls_needed: u32,
    polls: u32,
    writes: Vec<f32>,
}

#[cfg(test)]
impl<F: FnMut(f32) -> f32> FnTarget<F> {
    fn new(f: F) -> Self {
        Self {
            f,
            control: f32::NAN,
            polls_needed: 0,
            polls: 0,
            writes: vec![],
        }
    }
}

#[cfg(test)]
impl<F: FnMut(f32) -> f32> MaximizerTarget for FnTarget<F> {
    fn set_control_value(&mut self, value: f32) -> Result<()> {
        self.control = value;
        self.writes.push(value);
        Ok(())
    }

    fn request_dependent_value(&mut self) -> Result<Reading> {
        self.polls = 0;
        self.get_dependent_value()
    }

    fn get_dependent_value(&mut self) -> Result<Reading> {
        if self.polls < self.polls_needed {
            self.polls += 1;
            return Ok(Reading::Pending);
        }
        Ok(Reading::Ready((self.f)(self.control)))
    }
}

#[cfg(test)]
fn params(start: f32, min: f32, max: f32) -> MaximizeParams {
    MaximizeParams {
        start,
        step: 1.0,
        min,
        max,
        direction_up: true,
        max_iterations: 100,
        timeout_ms: 200,
        poll_interval_ms: 1,
    }
}

#[cfg(test)]
use crate::Never;

#[test]
fn asymmetric_peak() {
    // Slow rise, steep fall
    let mut target = FnTarget::new(|x| if x <= 5.0 { x } else { 5.0 - 4.0 * (x - 5.0) });
    let mut search = HillClimbSearch::new();
    let v = search.maximize(&mut target, &params(0.0, -50.0, 50.0), &Never).unwrap();
    assert_eq!(5.0, v);
    assert_eq!(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 3.0, 5.0], target.writes);
}

#[test]
fn climbs_past_local_dip() {
    // Small bump at 1, the real peak is at -2
    let mut target = FnTarget::new(|x| match x as i32 {
        2 => 2.0,
        1 => 3.0,
        0 => 1.0,
        -1 => 5.0,
        -2 => 7.0,
        -3 => 6.0,
        _ => -100.0,
    });
    let mut search = HillClimbSearch::new();
    let v = search.maximize(&mut target, &params(0.0, -50.0, 50.0), &Never).unwrap();
    assert_eq!(-2.0, v);
    assert_eq!(vec![0.0, 1.0, 2.0, -1.0, -2.0, -3.0, 0.0, -2.0], target.writes);
}

#[test]
fn reports_progress_and_outcome() {
    use crate::events::{ChannelSink, Notification};
    let (sink, rx) = ChannelSink::new();
    let mut search = HillClimbSearch::with_sink(Band(7), Arc::new(sink));
    let mut target = FnTarget::new(|x| -(x - 5.0) * (x - 5.0));
    search.maximize(&mut target, &params(0.0, -50.0, 50.0), &Never).unwrap();
    let got: Vec<_> = rx.try_iter().collect();
    let (status, events): (Vec<_>, Vec<_>) = got.into_iter().partition(|n| matches!(n, Notification::Status { .. }));
    assert!(events
        .iter()
        .all(|n| matches!(n, Notification::Event(e) if e.code == EventCode::MaximizerProgress && e.band == Band(7))));
    assert!(!events.is_empty());
    assert_eq!(1, status.len());
    assert!(matches!(&status[0], Notification::Status { success: true, text } if text.contains("maximum at 5.000")));

    // Failure and stop are told apart
    let mut flat = FnTarget::new(|_| 0.0);
    assert!(search.maximize(&mut flat, &params(0.0, -50.0, 50.0), &Never).is_err());
    let mut pending = FnTarget::new(|x| x);
    pending.polls_needed = u32::MAX;
    let stop = std::sync::atomic::AtomicBool::new(true);
    assert!(matches!(search.maximize(&mut pending, &params(0.0, -50.0, 50.0), &stop), Err(Error::Cancelled)));
    let status: Vec<_> = rx
        .try_iter()
        .filter_map(|n| match n {
            Notification::Status { success, text } => Some((success, text)),
            _ => None,
        })
        .collect();
    assert_eq!(2, status.len());
    assert!(!status[0].0 && status[0].1.contains("identical"));
    assert!(status[1].0 && status[1].1.contains("stopped"));
}

#[test]
fn parabola_from_below() {
    let mut target = FnTarget::new(|x| -(x - 5.0) * (x - 5.0));
    let mut search = HillClimbSearch::new();
    let v = search.maximize(&mut target, &params(0.0, -50.0, 50.0), &Never).unwrap();
    assert!((v - 5.0).abs() <= 1.0);
    assert_eq!(Some(&v), target.writes.last());
    assert_eq!(Some(v), search.last_control());
}

#[test]
fn parabola_from_above_reverses() {
    let mut target = FnTarget::new(|x| -(x - 5.0) * (x - 5.0));
    target.polls_needed = 2;
    let mut search = HillClimbSearch::new();
    let v = search.maximize(&mut target, &params(12.0, -50.0, 50.0), &Never).unwrap();
    assert!((v - 5.0).abs() <= 1.0);
    assert!(search.samples().len() <= 4);
}

#[test]
fn flat_response_fails() {
    let mut target = FnTarget::new(|_| 1.5);
    let mut search = HillClimbSearch::new();
    let r = search.maximize(&mut target, &params(0.0, -50.0, 50.0), &Never);
    assert!(matches!(r, Err(Error::FlatResponse)));
}

#[test]
fn out_of_bounds_point_never_written() {
    // Keeps rising past the upper bound
    let mut target = FnTarget::new(|x| x);
    let mut search = HillClimbSearch::new();
    let r = search.maximize(&mut target, &params(0.0, -10.0, 10.0), &Never);
    assert!(matches!(r, Err(Error::OutOfRange { .. })));
    assert!(target.writes.iter().all(|w| (-10.0..=10.0).contains(w)));
    assert_eq!(Some(10.0), search.last_control());
}

#[test]
fn pending_reading_times_out() {
    let mut target = FnTarget::new(|x| x);
    target.polls_needed = u32::MAX;
    let mut search = HillClimbSearch::new();
    let r = search.maximize(&mut target, &params(0.0, -10.0, 10.0), &Never);
    assert!(matches!(r, Err(Error::Timeout { .. })));
}

#[test]
fn stop_handle_cancels() {
    let mut target = FnTarget::new(|x| -(x - 5.0) * (x - 5.0));
    target.polls_needed = u32::MAX;
    let mut p = params(0.0, -50.0, 50.0);
    p.timeout_ms = 10_000;
    let mut search = HillClimbSearch::new();
    let handle = search.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.stop();
    });
    let r = search.maximize(&mut target, &p, &Never);
    stopper.join().unwrap();
    assert!(matches!(r, Err(Error::Cancelled)));
    assert!(search.stopped());
    assert_eq!(Some(0.0), search.last_control());
}

#[test]
fn iteration_limit() {
    let mut target = FnTarget::new(|x| x);
    let mut p = params(0.0, -1000.0, 1000.0);
    p.max_iterations = 5;
    let mut search = HillClimbSearch::new();
    let r = search.maximize(&mut target, &p, &Never);
    assert!(matches!(r, Err(Error::IterationLimit(5))));
}

#[test]
fn rejects_bad_params() {
    let mut target = FnTarget::new(|x| x);
    let mut p = params(0.0, 10.0, -10.0);
    let mut search = HillClimbSearch::new();
    assert!(matches!(search.maximize(&mut target, &p, &Never), Err(Error::InvalidParameter(_))));
    p = params(0.0, -10.0, 10.0);
    p.step = 0.0;
    assert!(matches!(search.maximize(&mut target, &p, &Never), Err(Error::InvalidParameter(_))));
    assert!(target.writes.is_empty());
}

#[test]
fn if_power_peak_on_simulator() {
    let mut target = IfPowerTarget {
        hw: crate::sim::SimulatedFrontEnd::default(),
        pol: Polarization::Pol1,
        settle_ms: 0,
    };
    let p = MaximizeParams {
        start: 0.5,
        step: 0.1,
        ..MaximizeParams::DEFAULT
    };
    let v = HillClimbSearch::new().maximize(&mut target, &p, &Never).unwrap();
    assert!((v - 1.2).abs() <= 0.1 + 1e-4);
    assert_eq!(v, target.hw.drain_voltage(Polarization::Pol1));
}
