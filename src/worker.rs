//! Background continuous reads.
//!
//! A [`ReadWorker`] owns a thread dedicated to transport I/O. Each cycle performs
//! one blocking read and hands the result through a single-slot channel; the
//! foreground may poll or block on it. Cancellation is cooperative and checked
//! at the top of every cycle and while waiting out the read period.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::reading::Reading;
use crate::sensor::SensorKind;
use crate::session::{Session, SessionError};
use crate::transport::{Transport, TransportError};

/// Shared stop request, cheap to clone into a worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, waking early on cancellation; returns whether cancelled
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

pub type ReadResult = Result<Reading, SessionError>;

/// Thread running continuous single reads on a shared session
pub struct ReadWorker {
    results: Receiver<ReadResult>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ReadWorker {
    /// Put `session` in continuous mode and start reading `kind` every `period`.
    ///
    /// Returns once the worker thread is running.
    pub fn spawn<T>(
        session: Arc<Session<T>>,
        kind: SensorKind,
        period: Duration,
        cancel: CancelToken,
    ) -> Result<Self, SessionError>
    where
        T: Transport + 'static,
    {
        session.start_continuous(period)?;

        let (result_tx, results) = mpsc::sync_channel(1);
        let (ready_tx, ready_rx) = mpsc::channel();
        let token = cancel.clone();

        let worker_session = Arc::clone(&session);
        let spawned = thread::Builder::new()
            .name(format!("{}-reader", kind.object_name()))
            .spawn(move || {
                let _ = ready_tx.send(());
                run(&worker_session, kind, &token, &result_tx);
                worker_session.stop_continuous();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                session.stop_continuous();
                return Err(TransportError::from(e).into());
            }
        };

        // Blocks until the thread is alive; a send error means it already exited
        let _ = ready_rx.recv();
        log::debug!("{} reader started, period {:?}", kind, period);

        Ok(Self {
            results,
            cancel,
            handle: Some(handle),
        })
    }

    /// Next result if one is waiting
    pub fn try_recv(&self) -> Option<ReadResult> {
        match self.results.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block up to `timeout` for the next result
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ReadResult> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Whether the worker thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cancel and wait for the in-flight read to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        // Free the slot so a blocked handoff can complete
        while self.results.try_recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Reader thread panicked");
            }
        }
    }
}

impl Drop for ReadWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: Transport>(
    session: &Session<T>,
    kind: SensorKind,
    cancel: &CancelToken,
    results: &SyncSender<ReadResult>,
) {
    loop {
        if cancel.is_cancelled() {
            log::debug!("{} reader cancelled", kind);
            return;
        }

        let started = Instant::now();
        let result = match session.continuous_cycle(kind) {
            Ok(Some(reading)) => Ok(reading),
            Ok(None) => {
                log::debug!("Continuous mode stopped, {} reader exiting", kind);
                return;
            }
            Err(e) => Err(e),
        };

        let fatal = result.as_ref().is_err_and(|e| !e.is_retryable());
        if let Err(e) = &result {
            log::warn!("{} read failed: {}", kind, e);
        }
        if results.send(result).is_err() {
            return;
        }
        if fatal {
            return;
        }

        let period = session.read_period();
        if cancel.wait(period.saturating_sub(started.elapsed())) {
            log::debug!("{} reader cancelled", kind);
            return;
        }
    }
}
