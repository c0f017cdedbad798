//! Notifications sent from the control loops to whoever is watching.
//!
//! The sink is handed to each controller as an `Arc<dyn EventSink>`. Both
//! methods are fire and forget: a sink must never block the control thread,
//! and a sink with nobody listening silently drops what it is given.
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Band, Polarization};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[rustfmt::skip]
pub enum EventCode {
    LockSearchStarted,  // param: coarse code
    LockSearchProgress, // param: code under test
    LockFound,          // param: locked code
    LockFailed,         // param: coarse code
    PllAdjusted,        // param: final code
    BiasAdjustStarted,  // param: start voltage in mV
    BiasAdjustProgress, // param: voltage in mV
    BiasAdjusted,       // param: final voltage in mV
    MaximizerProgress,  // param: iteration
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub code: EventCode,
    pub band: Band,
    pub pol: Option<Polarization>,
    pub param: i32,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    pub message: String,
}

impl Event {
    pub fn new(code: EventCode, band: Band) -> Self {
        Self {
            code,
            band,
            pol: None,
            param: 0,
            progress: 0,
            message: String::new(),
        }
    }

    pub fn pol(mut self, pol: Polarization) -> Self {
        self.pol = Some(pol);
        self
    }

    pub fn param(mut self, param: i32) -> Self {
        self.param = param;
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Event(Event),
    Status { success: bool, text: String },
}

pub trait EventSink: Send + Sync {
    fn emit_event(&self, event: Event);
    fn emit_status_message(&self, success: bool, text: &str);
}

/// Forwards notifications over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit_event(&self, event: Event) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(Notification::Event(event));
    }

    fn emit_status_message(&self, success: bool, text: &str) {
        let _ = self.tx.send(Notification::Status {
            success,
            text: text.to_owned(),
        });
    }
}

/// Writes notifications to the `tracing` log.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit_event(&self, event: Event) {
        info!(
            band = %event.band,
            pol = ?event.pol,
            param = event.param,
            progress = event.progress,
            "{:?} {}",
            event.code,
            event.message
        );
    }

    fn emit_status_message(&self, success: bool, text: &str) {
        if success {
            info!("{text}");
        } else {
            warn!("{text}");
        }
    }
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit_event(&self, _event: Event) {}
    fn emit_status_message(&self, _success: bool, _text: &str) {}
}

#[test]
fn channel_sink_forwards_in_order() {
    let (sink, rx) = ChannelSink::new();
    sink.emit_event(Event::new(EventCode::LockFound, Band(6)).param(1234).progress(150));
    sink.emit_status_message(false, "band 6: no lock");

    match rx.try_recv().unwrap() {
        Notification::Event(e) => {
            assert_eq!(e.code, EventCode::LockFound);
            assert_eq!(e.param, 1234);
            assert_eq!(e.progress, 100);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        rx.try_recv().unwrap(),
        Notification::Status {
            success: false,
            text: "band 6: no lock".into()
        }
    );
}

#[test]
fn channel_sink_survives_dropped_receiver() {
    let (sink, rx) = ChannelSink::new();
    drop(rx);
    sink.emit_status_message(true, "ignored");
}
