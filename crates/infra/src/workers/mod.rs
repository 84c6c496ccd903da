//! Background threads: projection consumers and the expiry reaper share the
//! same handle type.

mod projection_worker;

use std::sync::mpsc;
use std::thread;

pub use projection_worker::ProjectionWorker;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: impl Into<String>, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A batch already in flight runs to completion first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
