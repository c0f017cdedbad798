use lotune::{
    bias::{BiasCurrentServo, BiasServoProcedure},
    config::band,
    events::{ChannelSink, EventCode, Notification, NullSink},
    maximizer::{IfPowerTarget, MaximizeParams, MaximizerProcedure},
    pll::{LockSearchProcedure, LockState, PllAdjustProcedure, PllLockController},
    sim::{PllModel, SharedHardware, SimulatedFrontEnd},
    worker::{TaskOutcome, WorkerTask},
    Band, Error, Hardware, Polarization, Register,
};
use std::{sync::Arc, thread, time::Duration};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn lock_then_adjust() {
    let (sink, rx) = ChannelSink::new();
    let sink = Arc::new(sink);
    let controller =
        PllLockController::new(SimulatedFrontEnd::default(), band::BAND7.without_delays(), sink.clone()).unwrap();
    let mut lock = WorkerTask::new(
        "lock",
        LockSearchProcedure {
            controller,
            coarse_code: 2030,
            window_steps: 50,
            step_size: 1,
            result: None,
        },
    );
    lock.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, lock.wait(WAIT).unwrap());
    let p = lock.take_procedure().unwrap();
    assert_eq!(Some(2042), p.result.and_then(|r| r.ok()));

    let mut adjust = WorkerTask::new(
        "adjust",
        PllAdjustProcedure {
            controller: p.controller,
            target_voltage: 0.0,
            result: None,
        },
    );
    adjust.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, adjust.wait(WAIT).unwrap());
    let p = adjust.take_procedure().unwrap();
    assert_eq!(LockState::Locked(p.controller.strategy()), p.controller.state());
    assert_eq!(2047, p.controller.hw().yto_code());

    let codes: Vec<_> = rx
        .try_iter()
        .filter_map(|n| match n {
            Notification::Event(e) => Some(e.code),
            _ => None,
        })
        .filter(|c| *c != EventCode::LockSearchProgress)
        .collect();
    assert_eq!(vec![EventCode::LockSearchStarted, EventCode::LockFound, EventCode::PllAdjusted], codes);
}

#[test]
fn cancelled_lock_search() {
    // Nothing to find, and slow enough to still be running when stopped
    let pll = PllModel {
        lock_center: 100,
        ..PllModel::default()
    };
    let mut config = band::BAND3.without_delays();
    config.lock.settle_ms_threshold = 5;
    let (sink, rx) = ChannelSink::new();
    let controller = PllLockController::new(SimulatedFrontEnd::new(pll), config, Arc::new(sink)).unwrap();
    let mut task = WorkerTask::new(
        "lock",
        LockSearchProcedure {
            controller,
            coarse_code: 3000,
            window_steps: 1000,
            step_size: 1,
            result: None,
        },
    );
    task.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(task.busy());
    task.request_stop();
    assert_eq!(TaskOutcome::Cancelled, task.wait(WAIT).unwrap());
    assert!(task.finished() && !task.success());

    let p = task.take_procedure().unwrap();
    assert!(matches!(p.result, Some(Err(Error::Cancelled))));
    assert_eq!(LockState::Unlocked, p.controller.state());
    let status: Vec<_> = rx
        .try_iter()
        .filter_map(|n| match n {
            Notification::Status { success, text } => Some((success, text)),
            _ => None,
        })
        .collect();
    assert_eq!(1, status.len());
    assert!(status[0].0 && status[0].1.contains("cancelled"));
}

#[test]
fn bias_servo_on_shared_hardware() {
    let hw = SharedHardware::new(SimulatedFrontEnd::default());
    let servo = BiasCurrentServo::new(hw.clone(), Band(6), band::BAND6.without_delays().bias, Arc::new(NullSink));
    let mut task = WorkerTask::new(
        "bias",
        BiasServoProcedure {
            servo,
            pol: Polarization::Pol0,
            start_voltage: 1.0,
            target_current: 24.0,
            verbose: true,
            result: None,
        },
    );
    task.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, task.wait(WAIT).unwrap());

    let adj = task.take_procedure().unwrap().result.unwrap().unwrap();
    assert!(adj.found_min);
    let sim = hw.lock().unwrap();
    assert_eq!(adj.voltage, sim.drain_voltage(Polarization::Pol0));
    assert!((sim.sis_current(Polarization::Pol0) - 24.0).abs() <= 0.11);
}

#[test]
fn bias_servo_unbracketed_fails_task() {
    let servo = BiasCurrentServo::new(
        SimulatedFrontEnd::default(),
        Band(6),
        band::BAND6.without_delays().bias,
        Arc::new(NullSink),
    );
    let mut task = WorkerTask::new(
        "bias",
        BiasServoProcedure {
            servo,
            pol: Polarization::Pol1,
            start_voltage: 1.0,
            target_current: 500.0,
            verbose: false,
            result: None,
        },
    );
    task.start().unwrap();
    assert_eq!(TaskOutcome::Failed, task.wait(WAIT).unwrap());
    let p = task.take_procedure().unwrap();
    assert!(!p.result.unwrap().unwrap().found_min);
}

#[test]
fn maximizer_procedure_and_restart() {
    let target = IfPowerTarget {
        hw: SimulatedFrontEnd::default(),
        pol: Polarization::Pol0,
        settle_ms: 0,
    };
    let params = MaximizeParams {
        start: 0.4,
        step: 0.05,
        ..MaximizeParams::DEFAULT
    };
    let (sink, rx) = ChannelSink::new();
    let mut task = WorkerTask::new("maximize", MaximizerProcedure::new(target, params, Band(6), Arc::new(sink)));
    task.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, task.wait(WAIT).unwrap());
    let first = task.procedure().unwrap().result.take().unwrap().unwrap();
    assert!((first - 1.2).abs() <= 0.051);
    let got: Vec<_> = rx.try_iter().collect();
    assert!(got
        .iter()
        .any(|n| matches!(n, Notification::Event(e) if e.code == EventCode::MaximizerProgress)));
    assert!(matches!(got.last(), Some(Notification::Status { success: true, .. })));

    // Second run from the far side of the peak
    task.procedure().unwrap().params.start = 2.2;
    task.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, task.wait(WAIT).unwrap());
    let second = task.procedure().unwrap().result.take().unwrap().unwrap();
    assert!((second - 1.2).abs() <= 0.051);
}

#[test]
fn hardware_fault_fails_lock_task() {
    let mut sim = SimulatedFrontEnd::default();
    sim.inject_fault(Register::YtoCoarseTune);
    let controller = PllLockController::new(sim, band::BAND6.without_delays(), Arc::new(NullSink)).unwrap();
    let mut task = WorkerTask::new(
        "lock",
        LockSearchProcedure {
            controller,
            coarse_code: 2048,
            window_steps: 10,
            step_size: 1,
            result: None,
        },
    );
    task.start().unwrap();
    assert_eq!(TaskOutcome::Failed, task.wait(WAIT).unwrap());
    let p = task.take_procedure().unwrap();
    assert!(matches!(p.result, Some(Err(Error::Hardware(_)))));
    assert_eq!(LockState::Failed, p.controller.state());
    // Loop closed again after the failed write
    let mut controller = p.controller;
    assert!(!controller.hw_mut().read_bool(Register::PllNullLoopIntegrator).unwrap());
}
