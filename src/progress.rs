//! Progress reporting, and running a processing job off the caller's thread.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{ProcessError, ProcessResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Indeterminate,
    /// Percentage complete, never decreasing within one run.
    Value(f64),
    Description(String),
    Error {
        message: String,
        suggestion: Option<String>,
    },
    Complete {
        success: bool,
    },
}

impl ProgressEvent {
    pub fn from_error(err: &ProcessError) -> Self {
        ProgressEvent::Error {
            message: err.to_string(),
            suggestion: err.suggestion().map(str::to_string),
        }
    }
}

pub trait ProgressReporter {
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

impl ProgressReporter for Sender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) {
        // the receiver going away only means nobody is watching
        let _ = self.send(event);
    }
}

/// Runs `job` on its own thread. Events arrive on the returned receiver,
/// ending with `Complete` once the job returns.
pub fn spawn_processing<T, F>(job: F) -> (JoinHandle<ProcessResult<T>>, Receiver<ProgressEvent>)
where
    T: Send + 'static,
    F: FnOnce(&dyn ProgressReporter) -> ProcessResult<T> + Send + 'static,
{
    let (tx, rx) = channel::<ProgressEvent>();

    let handle = thread::spawn(move || {
        let result = job(&tx);
        if let Err(err) = &result {
            tx.report(ProgressEvent::from_error(err));
        }
        tx.report(ProgressEvent::Complete {
            success: result.is_ok(),
        });
        result
    });

    (handle, rx)
}
