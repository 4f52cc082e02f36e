//! Fixed-capacity FIFO with cancellable blocking `add`/`take`.
//!
//! Used to cap the response history kept per job so a slow consumer cannot
//! grow memory without bound.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::cancel::{Sink, Token, WaitError, deadline_after};

/// An `add` that did not complete. The item is handed back untouched.
#[derive(Debug)]
pub struct AddError<T> {
    pub item: T,
    pub reason: WaitError,
}

impl<T> fmt::Display for AddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            WaitError::Cancelled => write!(f, "queue add cancelled"),
            WaitError::TimedOut(d) => write!(f, "queue add timed out after {d:?}"),
        }
    }
}

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue needs a non-zero capacity");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Non-blocking enqueue. Returns the item when the queue is full.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.not_empty.notify_waiters();
        Ok(())
    }

    pub fn try_take(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_waiters();
        }
        item
    }

    /// Enqueue, waiting while the queue is full. `timeout_ms == 0` waits
    /// without a deadline.
    pub async fn add(&self, item: T, token: &Token, timeout_ms: u64) -> Result<(), AddError<T>> {
        let deadline = deadline_after(timeout_ms);
        let mut slot = Some(item);
        let res = Sink::new(token)
            .wait_until(&self.not_full, deadline, || {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    items.extend(slot.take());
                    Some(())
                } else {
                    None
                }
            })
            .await;
        match res {
            Ok(()) => {
                self.not_empty.notify_waiters();
                Ok(())
            }
            Err(reason) => Err(AddError {
                item: slot.take().expect("item consumed without success"),
                reason,
            }),
        }
    }

    /// Dequeue, waiting while the queue is empty. `timeout_ms == 0` waits
    /// without a deadline.
    pub async fn take(&self, token: &Token, timeout_ms: u64) -> Result<T, WaitError> {
        let deadline = deadline_after(timeout_ms);
        let item = Sink::new(token)
            .wait_until(&self.not_empty, deadline, || self.lock().pop_front())
            .await?;
        self.not_full.notify_waiters();
        Ok(item)
    }

    /// Remove everything, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().expect("queue lock poisoned")
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
