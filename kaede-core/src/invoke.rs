//! Marshaling host work onto the emulation thread.
//!
//! Exactly one host thread owns all kernel state. Background activity
//! (async I/O completions, timers firing off-thread) hands the emulation
//! thread a closure through a bounded channel and blocks until it has run
//! — a call-and-wait rendezvous that preserves the single-writer invariant
//! without depending on any UI event loop.

use std::sync::mpsc::{self, Receiver, SyncSender};

use thiserror::Error;

use crate::system::System;

/// How many calls may sit in the queue before senders block.
const CALL_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("the emulation thread is gone")]
    Disconnected,
}

pub(crate) struct HostCall {
    pub(crate) run: Box<dyn FnOnce(&mut System) + Send>,
}

/// Cloneable sender half handed to background host threads.
#[derive(Clone)]
pub struct HostInvoker {
    tx: SyncSender<HostCall>,
}

impl HostInvoker {
    /// Run `f` on the emulation thread and block until it has executed,
    /// returning its result.
    ///
    /// The call is processed at the top of the next `run_loop` step, so
    /// the wait lasts until the emulation thread next steps. Never call
    /// this from the emulation thread itself — the rendezvous would wait
    /// on the very thread it blocks.
    pub fn invoke<R, F>(&self, f: F) -> Result<R, InvokeError>
    where
        F: FnOnce(&mut System) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::sync_channel(0);
        self.tx
            .send(HostCall {
                run: Box::new(move |system| {
                    let _ = done_tx.send(f(system));
                }),
            })
            .map_err(|_| InvokeError::Disconnected)?;
        done_rx.recv().map_err(|_| InvokeError::Disconnected)
    }
}

pub(crate) fn host_call_channel() -> (HostInvoker, Receiver<HostCall>) {
    let (tx, rx) = mpsc::sync_channel(CALL_QUEUE_DEPTH);
    (HostInvoker { tx }, rx)
}
