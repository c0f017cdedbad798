//! Background execution of long running procedures.
//!
//! A [`WorkerTask`] owns one OS thread at a time. The thread calls
//! [`Procedure::action`] repeatedly until the procedure reports itself
//! finished through its [`TaskContext`] or a stop is requested, then calls
//! [`Procedure::exit_action`] exactly once. The task can be started again
//! once the thread has stopped.
//!
//! The state mutex is only held to copy or flip flags, never across an
//! action, a hardware access or a sleep.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{Cancel, Error, Result};

const STOP_POLLS: u32 = 250;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct TaskState {
    started: bool,
    stop_requested: bool,
    stopped: bool,
    finished: bool,
    success: bool,
}

fn lock(state: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
    // Plain flags, still meaningful after a panic elsewhere
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work run on a [`WorkerTask`] thread.
pub trait Procedure: Send + 'static {
    /// One unit of work. Called in a loop until the procedure calls
    /// [`TaskContext::set_finished`] or a stop is requested, so a single
    /// call should not run unbounded.
    fn action(&mut self, ctx: &TaskContext);

    /// Called once after the loop ends, including after a forced stop.
    fn exit_action(&mut self, _success: bool) {}
}

/// The procedure's view of its task.
#[derive(Clone)]
pub struct TaskContext {
    state: Arc<Mutex<TaskState>>,
}

impl TaskContext {
    pub fn set_finished(&self, success: bool) {
        let mut s = lock(&self.state);
        s.finished = true;
        s.success = success;
    }

    pub fn stop_requested(&self) -> bool {
        lock(&self.state).stop_requested
    }

    pub fn finished(&self) -> bool {
        lock(&self.state).finished
    }

    pub fn success(&self) -> bool {
        lock(&self.state).success
    }
}

impl Cancel for TaskContext {
    fn cancelled(&self) -> bool {
        self.stop_requested()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Never started.
    Idle,
    Running,
    Succeeded,
    Failed,
    /// Stopped by request before the procedure finished on its own.
    Cancelled,
}

pub struct WorkerTask<P: Procedure> {
    name: String,
    state: Arc<Mutex<TaskState>>,
    procedure: Option<P>,
    handle: Option<JoinHandle<P>>,
}

impl<P: Procedure> WorkerTask<P> {
    pub fn new(name: impl Into<String>, procedure: P) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(TaskState::default())),
            procedure: Some(procedure),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the worker thread. Fails with [`Error::AlreadyRunning`] while a
    /// previous run has not stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.busy() {
            return Err(Error::AlreadyRunning);
        }
        self.reclaim();
        let procedure = self
            .procedure
            .take()
            .ok_or(Error::InvalidParameter("procedure was lost to a panic or taken"))?;

        *lock(&self.state) = TaskState {
            started: true,
            ..TaskState::default()
        };
        let ctx = TaskContext {
            state: Arc::clone(&self.state),
        };
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(procedure, ctx));
        match spawned {
            Ok(handle) => {
                debug!(task = %self.name, "started");
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut s = lock(&self.state);
                s.stopped = true;
                s.finished = true;
                Err(e.into())
            }
        }
    }

    /// Ask the procedure to stop at its next polling point. Never blocks.
    pub fn request_stop(&self) {
        lock(&self.state).stop_requested = true;
    }

    pub fn busy(&self) -> bool {
        let s = lock(&self.state);
        s.started && !s.stopped
    }

    pub fn finished(&self) -> bool {
        lock(&self.state).finished
    }

    pub fn success(&self) -> bool {
        lock(&self.state).success
    }

    pub fn outcome(&self) -> TaskOutcome {
        let s = *lock(&self.state);
        if !s.started {
            TaskOutcome::Idle
        } else if !s.stopped {
            TaskOutcome::Running
        } else if s.success {
            TaskOutcome::Succeeded
        } else if s.stop_requested {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Failed
        }
    }

    /// Poll until the thread has stopped, then reclaim the procedure.
    pub fn wait(&mut self, timeout: Duration) -> Result<TaskOutcome> {
        let begin = Instant::now();
        while self.busy() {
            if begin.elapsed() >= timeout {
                return Err(Error::Timeout {
                    waited_ms: begin.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        self.reclaim();
        Ok(self.outcome())
    }

    /// Request a stop and wait for it with bounded retries.
    pub fn stop(&mut self) -> Result<TaskOutcome> {
        self.request_stop();
        for _ in 0..STOP_POLLS {
            if !self.busy() {
                self.reclaim();
                return Ok(self.outcome());
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        Err(Error::StopTimeout)
    }

    /// The procedure, if no thread is currently running it.
    pub fn procedure(&mut self) -> Option<&mut P> {
        if self.busy() {
            return None;
        }
        self.reclaim();
        self.procedure.as_mut()
    }

    pub fn take_procedure(&mut self) -> Option<P> {
        if self.busy() {
            return None;
        }
        self.reclaim();
        self.procedure.take()
    }

    fn reclaim(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(p) => self.procedure = Some(p),
                Err(_) => error!(task = %self.name, "procedure panicked"),
            }
        }
    }
}

impl<P: Procedure> Drop for WorkerTask<P> {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if let Err(e) = self.stop() {
            // Dropping the handle detaches the thread
            error!(
                task = %self.name,
                "{e} after {} s, detaching worker thread",
                (STOP_POLL_INTERVAL * STOP_POLLS).as_secs()
            );
        }
    }
}

fn run<P: Procedure>(mut procedure: P, ctx: TaskContext) -> P {
    while !ctx.stop_requested() {
        procedure.action(&ctx);
        if ctx.finished() {
            break;
        }
    }
    let success = {
        let mut s = lock(&ctx.state);
        if !s.finished {
            s.finished = true;
            s.success = false;
        }
        s.success
    };
    if !success {
        warn!("procedure ended without success");
    }
    procedure.exit_action(success);
    lock(&ctx.state).stopped = true;
    procedure
}

/// Stores the outcome of a single shot procedure and reports it to the task.
pub(crate) fn finish_with<T>(ctx: &TaskContext, slot: &mut Option<Result<T>>, result: Result<T>) {
    ctx.set_finished(result.is_ok());
    *slot = Some(result);
}

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Never finishes on its own.
#[cfg(test)]
struct Spin {
    exits: Arc<AtomicUsize>,
}

#[cfg(test)]
impl Procedure for Spin {
    fn action(&mut self, _ctx: &TaskContext) {
        thread::sleep(Duration::from_millis(2));
    }

    fn exit_action(&mut self, _success: bool) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records what it sees on its first action, then succeeds.
#[cfg(test)]
struct Snapshot {
    seen: Vec<(bool, bool)>,
}

#[cfg(test)]
impl Procedure for Snapshot {
    fn action(&mut self, ctx: &TaskContext) {
        self.seen.push((ctx.finished(), ctx.success()));
        ctx.set_finished(true);
    }
}

#[test]
fn stop_right_after_start() {
    let exits = Arc::new(AtomicUsize::new(0));
    let mut task = WorkerTask::new("spin", Spin { exits: Arc::clone(&exits) });
    task.start().unwrap();
    task.request_stop();
    assert_eq!(TaskOutcome::Cancelled, task.wait(Duration::from_secs(5)).unwrap());
    assert!(task.finished());
    assert!(!task.success());
    assert!(!task.busy());
    assert_eq!(1, exits.load(Ordering::SeqCst));
}

#[test]
fn start_while_busy_fails() {
    let exits = Arc::new(AtomicUsize::new(0));
    let mut task = WorkerTask::new("spin", Spin { exits: Arc::clone(&exits) });
    task.start().unwrap();
    assert!(matches!(task.start(), Err(Error::AlreadyRunning)));
    task.stop().unwrap();
    assert_eq!(1, exits.load(Ordering::SeqCst));
}

#[test]
fn restart_resets_result() {
    let mut task = WorkerTask::new("snapshot", Snapshot { seen: vec![] });
    task.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, task.wait(Duration::from_secs(5)).unwrap());
    assert!(task.finished() && task.success());

    task.start().unwrap();
    assert_eq!(TaskOutcome::Succeeded, task.wait(Duration::from_secs(5)).unwrap());
    let p = task.take_procedure().unwrap();
    assert_eq!(vec![(false, false), (false, false)], p.seen);
}

#[test]
fn drop_stops_thread() {
    let exits = Arc::new(AtomicUsize::new(0));
    {
        let mut task = WorkerTask::new("spin", Spin { exits: Arc::clone(&exits) });
        task.start().unwrap();
    }
    assert_eq!(1, exits.load(Ordering::SeqCst));
}

#[test]
fn idle_before_start() {
    let task = WorkerTask::new("snapshot", Snapshot { seen: vec![] });
    assert_eq!(TaskOutcome::Idle, task.outcome());
    assert!(!task.busy() && !task.finished());
}
