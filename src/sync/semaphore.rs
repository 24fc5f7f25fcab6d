use std::{
    collections::VecDeque,
    future::Future,
    num::NonZero,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use log::warn;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use super::completed;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("Unlock called while no slot is held")]
    NotLocked,
}

/// Counting gate bounding how many units of work run at once.
///
/// Waiters are served in FIFO order. A freed slot is handed to the oldest waiter
/// as part of `unlock`, so a later `lock` can never overtake it.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<Mutex<SemaphoreInner>>,
}

#[derive(Debug)]
struct SemaphoreInner {
    capacity: usize,
    in_flight: usize,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    counter: u64,
}

impl SemaphoreInner {
    fn next_id(&mut self) -> u64 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    fn release(&mut self) -> Result<(), SemaphoreError> {
        if self.in_flight == 0 {
            return Err(SemaphoreError::NotLocked);
        }

        self.in_flight -= 1;

        while let Some((_, waiter)) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                self.in_flight += 1;
                break;
            }
        }

        Ok(())
    }
}

impl Semaphore {
    pub fn new(capacity: NonZero<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SemaphoreInner {
                capacity: capacity.get(),
                in_flight: 0,
                waiters: VecDeque::new(),
                counter: 0,
            })),
        }
    }

    /// Takes a slot, waiting in line if all of them are in use.
    pub fn lock(&self) -> Lock {
        let mut inner = self.inner.lock();
        let id = inner.next_id();

        let granted = if inner.in_flight < inner.capacity {
            inner.in_flight += 1;
            completed(())
        } else {
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back((id, tx));
            rx
        };

        Lock {
            granted,
            waiter: Some((id, self.inner.clone())),
        }
    }

    /// Frees a slot, handing it straight to the oldest waiter if there is one.
    pub fn unlock(&self) -> Result<(), SemaphoreError> {
        self.inner.lock().release()
    }

    /// Takes a slot and returns a guard that frees it when dropped.
    pub async fn acquire(&self) -> Permit {
        self.lock().await;

        Permit {
            semaphore: self.clone(),
        }
    }

    /// Runs `work` while holding a slot. The slot is freed on every exit path,
    /// including a panic in `work` or the returned future being dropped.
    pub async fn run<F, Fut>(&self, work: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _permit = self.acquire().await;
        work().await
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner.capacity - inner.in_flight
    }

    #[cfg(test)]
    fn num_waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

/// Pending [`Semaphore::lock`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Lock {
    granted: oneshot::Receiver<()>,
    waiter: Option<(u64, Arc<Mutex<SemaphoreInner>>)>,
}

impl Future for Lock {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        // A waiter's sender is only dropped unsent once its receiver is gone.
        let _ = ready!(Pin::new(&mut this.granted).poll(cx));
        this.waiter = None;

        Poll::Ready(())
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let Some((id, semaphore)) = self.waiter.take() else {
            return;
        };

        let mut inner = semaphore.lock();

        match inner.waiters.iter().position(|(w, _)| *w == id) {
            Some(pos) => {
                inner.waiters.remove(pos);
            }
            // The slot was handed over but never observed: pass it on.
            None => {
                if let Err(e) = inner.release() {
                    warn!("Dropped lock could not release its slot: {e}");
                }
            }
        }
    }
}

/// Held slot of a [`Semaphore`], freed on drop.
#[derive(Debug)]
pub struct Permit {
    semaphore: Semaphore,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.unlock() {
            warn!("Permit released with no slot held: {e}");
        }
    }
}
