//! Double-buffered command queue between the control and render threads.
//!
//! The control thread appends closures to a *write* batch. Once per control
//! tick, [`CommandSender::update`] hands that batch to the render thread, but
//! only after the render thread has signalled that it finished draining the
//! previous one. The render thread runs [`CommandReceiver::drain`] once per
//! block, executing every closure in FIFO order.
//!
//! Batches travel through a capacity-one `rtrb` ring, and emptied batch
//! vectors travel back through a second ring so the render thread never frees
//! them.
//!
//! ```
//! use mischpult::command::command_queue;
//!
//! let (mut tx, mut rx) = command_queue::<Vec<u32>>(16);
//! tx.enqueue(|state| state.push(1));
//! tx.enqueue(|state| state.push(2));
//! assert!(tx.update());
//!
//! let mut state = Vec::new();
//! assert_eq!(rx.drain(&mut state), 2);
//! assert_eq!(state, [1, 2]);
//! ```

use std::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::time::Instant;

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::error::{MixerError, MixerResult};

/// A deferred operation executed on the render thread
pub type Command<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

type Batch<C> = Vec<Command<C>>;

/// Manual-reset signal shared by both ends
struct DrainSignal {
    /// Set by the render thread after draining, reset by the control thread on submit
    drained: AtomicBool,
    /// Number of batches fully executed so far
    batches_drained: AtomicU64,
}

/// Create a connected sender/receiver pair.
///
/// `capacity` is the initial capacity of each batch; batches grow on the
/// control thread if more commands are queued in one tick.
pub fn command_queue<C: 'static>(capacity: usize) -> (CommandSender<C>, CommandReceiver<C>) {
    let (batch_tx, batch_rx) = RingBuffer::new(1);
    let (recycle_tx, recycle_rx) = RingBuffer::new(2);

    let signal = Arc::new(DrainSignal {
        drained: AtomicBool::new(true),
        batches_drained: AtomicU64::new(0),
    });

    let sender = CommandSender {
        write: Vec::with_capacity(capacity),
        capacity,
        in_flight: batch_tx,
        recycled: recycle_rx,
        signal: signal.clone(),
        batches_submitted: 0,
    };

    let receiver = CommandReceiver {
        in_flight: batch_rx,
        recycle: recycle_tx,
        signal,
    };

    (sender, receiver)
}

/// Control-thread end of a command queue
pub struct CommandSender<C: 'static> {
    write: Batch<C>,
    capacity: usize,
    in_flight: Producer<Batch<C>>,
    recycled: Consumer<Batch<C>>,
    signal: Arc<DrainSignal>,
    batches_submitted: u64,
}

impl<C: 'static> CommandSender<C> {
    /// Append an operation to the write batch. Never blocks.
    pub fn enqueue<F>(&mut self, command: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.write.push(Box::new(command));
    }

    /// Number of commands waiting in the write batch
    #[inline]
    pub fn pending(&self) -> usize {
        self.write.len()
    }

    /// Whether the render thread has finished the last submitted batch
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.signal.drained.load(Ordering::Acquire)
    }

    /// Hand the write batch to the render thread.
    ///
    /// Returns `true` if a batch was submitted. Returns `false` when there is
    /// nothing to send, or when the render thread is still busy with the
    /// previous batch (the commands stay queued for the next tick).
    pub fn update(&mut self) -> bool {
        if self.write.is_empty() || !self.is_drained() {
            return false;
        }

        let next = self
            .recycled
            .pop()
            .unwrap_or_else(|_| Vec::with_capacity(self.capacity));
        let batch = core::mem::replace(&mut self.write, next);

        self.signal.drained.store(false, Ordering::Release);
        match self.in_flight.push(batch) {
            Ok(()) => {
                self.batches_submitted += 1;
                true
            }
            Err(PushError::Full(batch)) => {
                // The drained flag guarantees the slot is free; restore and retry next tick.
                debug_assert!(false, "command batch slot occupied while flagged drained");
                let mut batch = batch;
                batch.append(&mut self.write);
                self.write = batch;
                self.signal.drained.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Submit everything queued and wait until the render thread executed it.
    ///
    /// Waits at most `timeout`. On timeout a warning is logged and
    /// [`MixerError::FlushTimeout`] returned; commands that were not yet
    /// submitted stay queued.
    pub fn flush(&mut self, timeout: Duration) -> MixerResult<()> {
        let deadline = Instant::now() + timeout;

        loop {
            self.update();

            let all_submitted = self.write.is_empty();
            let all_drained = self.signal.batches_drained.load(Ordering::Acquire) >= self.batches_submitted;
            if all_submitted && all_drained {
                return Ok(());
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    pending = self.write.len(),
                    submitted = self.batches_submitted,
                    "command queue flush timed out"
                );
                return Err(MixerError::FlushTimeout { millis: timeout.as_millis() });
            }

            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

/// Render-thread end of a command queue
pub struct CommandReceiver<C: 'static> {
    in_flight: Consumer<Batch<C>>,
    recycle: Producer<Batch<C>>,
    signal: Arc<DrainSignal>,
}

impl<C: 'static> CommandReceiver<C> {
    /// Execute the submitted batch, if any, in FIFO order.
    ///
    /// Returns the number of commands executed.
    pub fn drain(&mut self, context: &mut C) -> usize {
        let mut batch = match self.in_flight.pop() {
            Ok(batch) => batch,
            Err(_) => return 0,
        };

        let count = batch.len();
        for command in batch.drain(..) {
            command(context);
        }

        if self.recycle.push(batch).is_err() {
            tracing::trace!("command batch recycle ring full, dropping batch on render thread");
        }

        self.signal.batches_drained.fetch_add(1, Ordering::Release);
        self.signal.drained.store(true, Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_run_in_fifo_order_once() {
        let (mut tx, mut rx) = command_queue::<Vec<u32>>(4);
        for i in 0..10 {
            tx.enqueue(move |v| v.push(i));
        }
        assert!(tx.update());

        let mut state = Vec::new();
        assert_eq!(rx.drain(&mut state), 10);
        assert_eq!(rx.drain(&mut state), 0);
        assert_eq!(state, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn write_buffer_is_held_until_render_drains() {
        let (mut tx, mut rx) = command_queue::<Vec<u32>>(4);
        tx.enqueue(|v| v.push(1));
        assert!(tx.update());

        // Render thread has not drained yet: the second command must stay queued.
        tx.enqueue(|v| v.push(2));
        assert!(!tx.update());
        assert_eq!(tx.pending(), 1);

        let mut state = Vec::new();
        rx.drain(&mut state);
        assert_eq!(state, [1]);

        assert!(tx.update());
        rx.drain(&mut state);
        assert_eq!(state, [1, 2]);
    }

    #[test]
    fn flush_times_out_without_a_render_thread() {
        let (mut tx, _rx) = command_queue::<()>(4);
        tx.enqueue(|_| {});
        let result = tx.flush(Duration::from_millis(5));
        assert_eq!(result, Err(MixerError::FlushTimeout { millis: 5 }));
    }

    #[test]
    fn flush_completes_with_a_render_thread() {
        let (mut tx, mut rx) = command_queue::<u32>(4);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_render = stop.clone();

        let render = std::thread::spawn(move || {
            let mut total = 0u32;
            while !stop_render.load(Ordering::Acquire) {
                rx.drain(&mut total);
                std::thread::sleep(Duration::from_micros(50));
            }
            rx.drain(&mut total);
            total
        });

        for _ in 0..5 {
            tx.enqueue(|t| *t += 1);
        }
        tx.flush(Duration::from_secs(5)).unwrap();
        tx.enqueue(|t| *t += 10);
        tx.flush(Duration::from_secs(5)).unwrap();

        stop.store(true, Ordering::Release);
        assert_eq!(render.join().unwrap(), 15);
    }
}
