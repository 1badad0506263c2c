//! Named frame channels
//!
//! Each channel is a bounded ring: when it is full, publishing a new frame
//! drops the oldest one. Consumers only ever care about the most recent
//! frame, so [`Subscriber::recv_latest`] waits for one frame and then drains
//! whatever else is queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::error::{RegResult, RegistrationError};

/// Frames kept per channel before the oldest is overwritten
pub const DEFAULT_CAPACITY: usize = 8;

pub struct Publisher<T> {
    name: Arc<str>,
    tx: Sender<T>,
    // Second handle on the ring, used only to evict the oldest frame
    evict: Receiver<T>,
}

pub struct Subscriber<T> {
    name: Arc<str>,
    rx: Receiver<T>,
}

/// Create a named channel holding at most `capacity` frames (at least one).
pub fn channel<T>(name: &str, capacity: usize) -> (Publisher<T>, Subscriber<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let name: Arc<str> = Arc::from(name);
    (
        Publisher { name: name.clone(), tx, evict: rx.clone() },
        Subscriber { name, rx },
    )
}

impl<T> Publisher<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a frame, overwriting the oldest one if the ring is full.
    pub fn put(&self, frame: T) -> RegResult<()> {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    let _ = self.evict.try_recv();
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(RegistrationError::ChannelClosed(self.name.to_string()))
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl<T> Subscriber<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for a frame, then return the newest one queued.
    ///
    /// `Ok(None)` on timeout. `Err(ChannelClosed)` once the publisher is gone
    /// and nothing is left to read.
    pub fn recv_latest(&self, timeout: Duration) -> RegResult<Option<T>> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(RegistrationError::ChannelClosed(self.name.to_string()))
            }
        };
        Ok(Some(self.rx.try_iter().fold(first, |_, newer| newer)))
    }

    /// Non-blocking variant of [`recv_latest`](Self::recv_latest).
    pub fn try_latest(&self) -> RegResult<Option<T>> {
        let first = match self.rx.try_recv() {
            Ok(frame) => frame,
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => {
                return Err(RegistrationError::ChannelClosed(self.name.to_string()))
            }
        };
        Ok(Some(self.rx.try_iter().fold(first, |_, newer| newer)))
    }
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

/// Cooperative stop signal shared between the signal handler and the loop.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
