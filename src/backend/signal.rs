//! Completion signalling between a backend and the scheduling loop.
//!
//! The channel has a single slot. A backend calls [`WorkNotifier::notify`]
//! after it has queued a completed batch; if a token is already waiting the
//! new one coalesces into it. The scheduler waits on [`WorkSignal`], either
//! directly or inside a `crossbeam::channel::select!` next to its other event
//! sources, then calls `do_work`.
//!
//! Every `WorkSignal` keeps a sender alive, so the channel never reports
//! disconnection. A signal whose backend has gone away simply never becomes
//! ready again.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

/// Producer half, owned by the backend.
#[derive(Debug, Clone)]
pub struct WorkNotifier {
    tx: Sender<()>,
}

impl WorkNotifier {
    /// Raise the signal. Returns false when a token was already pending.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            // unreachable while any WorkSignal exists, and harmless otherwise
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

/// Consumer half, handed to the scheduler by `work_available`.
#[derive(Debug, Clone)]
pub struct WorkSignal {
    rx: Receiver<()>,
    _keepalive: Sender<()>,
}

/// Create a connected notifier/signal pair.
pub fn work_channel() -> (WorkNotifier, WorkSignal) {
    let (tx, rx) = channel::bounded(1);
    (
        WorkNotifier { tx: tx.clone() },
        WorkSignal { rx, _keepalive: tx },
    )
}

impl WorkSignal {
    /// Receiver to put into a `select!`. A received `()` means "call do_work".
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// A token is waiting
    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Consume a waiting token without blocking.
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Block up to `timeout` for a token.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Drop any waiting token. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Receiver for an optional signal: a missing signal never fires.
    ///
    /// ```ignore
    /// let work = WorkSignal::or_never(meta.work_available().as_ref());
    /// crossbeam::channel::select! {
    ///     recv(work) -> _ => meta.do_work()?,
    ///     recv(ticks) -> _ => dispatch_next(),
    /// }
    /// ```
    pub fn or_never(signal: Option<&WorkSignal>) -> Receiver<()> {
        signal
            .map(|s| s.rx.clone())
            .unwrap_or_else(channel::never)
    }
}
