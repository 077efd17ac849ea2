//! Cooperative cancellation for the charm worker.
//!
//! The supervising lifecycle owns one [`CancelHandle`] per worker. Firing it
//! raises a level signal that stays raised for the rest of the worker's life;
//! every suspension point inside staging, deploying and downloading observes
//! the same [`CancelSignal`].

use std::fmt;
use std::io::{self, Read};

use tokio::sync::watch;

/// Owner side of the cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a handle together with its first signal.
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    /// Raise the signal. Firing more than once is a no-op.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Subscribe another observer.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side of the cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Wrap an existing shutdown channel (`true` means cancelled).
    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal is raised.
    ///
    /// If the owner goes away without firing, this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Error payload used when a [`CancelReader`] refuses to read further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Blocking reader that checks the cancellation signal before every read.
///
/// Used for work that runs on the blocking pool (archive extraction), where
/// dropping a future cannot interrupt the operation.
pub struct CancelReader<R> {
    inner: R,
    signal: CancelSignal,
}

impl<R> CancelReader<R> {
    pub fn new(inner: R, signal: CancelSignal) -> Self {
        Self { inner, signal }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.signal.is_cancelled() {
            return Err(io::Error::other(Cancelled));
        }
        self.inner.read(buf)
    }
}
