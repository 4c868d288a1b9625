/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The FIFO of queued work items and its wakeup machinery.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::work::{WorkFlags, WorkItem};

/// A FIFO of work items shared between enqueuers and the worker thread.
///
/// The lock is held only for queue mutations, never across a decode step, so
/// enqueuers are never blocked behind the engine. The condition variable is
/// the worker's sole suspension point.
#[derive(Debug, Default)]
pub struct WorkQueue {
    fifo: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
}

impl WorkQueue {
    /// Appends items in order and wakes the worker.
    pub fn append(&self, items: Vec<WorkItem>) {
        let mut fifo = self.fifo.lock().unwrap();
        fifo.extend(items);
        self.available.notify_all();
    }

    /// Marks the last currently queued item as end-of-stream, establishing
    /// the boundary of the current stream segment. Items enqueued afterwards
    /// belong to a new segment.
    pub fn mark_drain(&self) {
        let mut fifo = self.fifo.lock().unwrap();
        if let Some(last) = fifo.back_mut() {
            last.flags.insert(WorkFlags::END_OF_STREAM);
            self.available.notify_all();
        }
    }

    /// Removes and returns everything currently queued.
    pub fn drain_all(&self) -> Vec<WorkItem> {
        let mut fifo = self.fifo.lock().unwrap();
        let drained = fifo.drain(..).collect();
        self.available.notify_all();
        drained
    }

    /// Dequeues one item, waiting on the condition variable once if the
    /// queue is empty. Returns `None` on a wakeup with nothing queued so the
    /// caller can re-check its exit flag and re-invoke.
    pub fn wait_pop(&self) -> Option<WorkItem> {
        let mut fifo = self.fifo.lock().unwrap();
        if fifo.is_empty() {
            fifo = self.available.wait(fifo).unwrap();
        }
        fifo.pop_front()
    }

    /// Wakes the worker without touching the queue. Used by `stop()` so the
    /// worker is never left waiting past the shutdown deadline.
    pub fn notify_all(&self) {
        let _fifo = self.fifo.lock().unwrap();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.fifo.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.lock().unwrap().is_empty()
    }
}
