//! Background queue workers.
//!
//! A worker blocks on its queue until the guest publishes a chain, passes
//! the head to a handler, puts the chain on the used ring and interrupts the
//! guest, then goes back to waiting. It runs until the handler asks it to
//! stop, the handler fails, or its [`PollHandle`] cancels it.

use super::VirtioError;
use super::pci::InterruptLine;
use super::queue::VirtioQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Whether the worker keeps going after the current chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Stop,
}

/// What a poll handler did with one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Bytes written into the chain's device-writable buffers.
    pub used: u32,
    pub control: PollControl,
}

impl Completion {
    pub fn done(used: u32) -> Self {
        Self {
            used,
            control: PollControl::Continue,
        }
    }

    /// Return the chain and end the worker.
    pub fn stop(used: u32) -> Self {
        Self {
            used,
            control: PollControl::Stop,
        }
    }
}

/// Handle to a running queue worker.
///
/// Dropping the handle detaches the worker, which then runs until its
/// handler stops it.
pub struct PollHandle {
    queue: Arc<VirtioQueue>,
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), VirtioError>>,
}

impl PollHandle {
    pub fn queue_id(&self) -> u16 {
        self.queue.id()
    }

    /// Ask the worker to exit. A worker blocked on an empty ring wakes up
    /// immediately; one inside its handler exits after returning that chain.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.queue.wake_all();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker to exit and return how it ended.
    pub fn join(self) -> Result<(), VirtioError> {
        self.thread.join().map_err(|_| VirtioError::WorkerPanicked)?
    }

    /// Cancel and join.
    pub fn shutdown(self) -> Result<(), VirtioError> {
        self.cancel();
        self.join()
    }
}

/// Spawn a worker servicing `queue`.
pub fn spawn<F>(
    queue: Arc<VirtioQueue>,
    interrupt: Arc<dyn InterruptLine>,
    handler: F,
) -> Result<PollHandle, VirtioError>
where
    F: FnMut(&VirtioQueue, u16) -> Result<Completion, VirtioError> + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let thread = {
        let queue = queue.clone();
        let cancel = cancel.clone();
        thread::Builder::new()
            .name(format!("virtio-queue-{}", queue.id()))
            .spawn(move || run(&queue, interrupt.as_ref(), &cancel, handler))
            .map_err(|e| {
                log::error!("[QueuePoll] Failed to create queue thread: {}", e);
                VirtioError::Worker(e)
            })?
    };
    log::debug!("[QueuePoll] Worker started for queue {}", queue.id());

    Ok(PollHandle {
        queue,
        cancel,
        thread,
    })
}

fn run<F>(
    queue: &VirtioQueue,
    interrupt: &dyn InterruptLine,
    cancel: &AtomicBool,
    mut handler: F,
) -> Result<(), VirtioError>
where
    F: FnMut(&VirtioQueue, u16) -> Result<Completion, VirtioError>,
{
    loop {
        let Some(head) = queue.wait_next_available_or_cancel(cancel)? else {
            log::debug!("[QueuePoll] Worker for queue {} cancelled", queue.id());
            return Ok(());
        };

        // The chain goes back to the guest even if the handler failed.
        let result = handler(queue, head);
        let used = result.as_ref().map_or(0, |c| c.used);
        queue.return_buffer(head, used)?;

        match result {
            Ok(Completion {
                control: PollControl::Stop,
                ..
            }) => {
                log::debug!("[QueuePoll] Worker for queue {} stopped by handler", queue.id());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                log::error!(
                    "[QueuePoll] Error while handling buffer {} on queue {}: {}",
                    head,
                    queue.id(),
                    e
                );
                return Err(e);
            }
        }

        interrupt.raise_interrupt()?;
    }
}
