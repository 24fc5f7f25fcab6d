use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use futures::Stream;
use log::trace;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use super::{
    completed,
    select::{SelectGroup, SelectToken, Selectable},
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Cannot put to a closed channel")]
    Closed,

    #[error("The channel was already closed")]
    AlreadyClosed,
}

/// Unbuffered rendezvous channel.
///
/// A value changes hands only when a `put` meets a `pop`; whichever side arrives
/// first is queued until the other shows up. Both queues are served in FIFO order,
/// so the Nth `put` pairs with the Nth `pop`.
///
/// `Channel` is a handle: clones share the same queues.
#[derive(Debug)]
pub struct Channel<T> {
    inner: Arc<Mutex<ChannelInner<T>>>,
}

#[derive(Debug)]
struct ChannelInner<T> {
    closed: bool,
    pending_puts: VecDeque<PendingPut<T>>,
    pending_pops: VecDeque<PendingPop<T>>,
    ready_waiters: Vec<(SelectToken, SelectGroup)>,
    counter: u64,
}

#[derive(Debug)]
struct PendingPut<T> {
    id: u64,
    value: T,
    done: oneshot::Sender<()>,
}

#[derive(Debug)]
struct PendingPop<T> {
    id: u64,
    slot: oneshot::Sender<T>,
}

impl<T> ChannelInner<T> {
    fn next_id(&mut self) -> u64 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    fn is_ready(&self) -> bool {
        self.closed || !self.pending_puts.is_empty()
    }

    fn notify_ready(&mut self) {
        for (token, group) in self.ready_waiters.drain(..) {
            group.notify(token);
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChannelInner {
                closed: false,
                pending_puts: VecDeque::new(),
                pending_pops: VecDeque::new(),
                ready_waiters: vec![],
                counter: 0,
            })),
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Channel::default()
    }

    /// Offers `value` to the oldest waiting consumer, or queues it until one arrives.
    ///
    /// The returned future completes once the value has been claimed. Dropping it
    /// before then takes the value back out of the channel.
    pub fn put(&self, mut value: T) -> Result<Put<T>, ChannelError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(ChannelError::Closed);
        }

        // Data is now available: wake selects before pairing.
        inner.notify_ready();

        while let Some(pop) = inner.pending_pops.pop_front() {
            match pop.slot.send(value) {
                Ok(()) => {
                    return Ok(Put {
                        done: completed(()),
                        waiter: None,
                    });
                }
                Err(returned) => value = returned,
            }
        }

        let id = inner.next_id();
        let (tx, done) = oneshot::channel();

        inner.pending_puts.push_back(PendingPut {
            id,
            value,
            done: tx,
        });

        Ok(Put {
            done,
            waiter: Some((id, self.inner.clone())),
        })
    }

    /// Takes the value of the oldest waiting producer, or waits for one.
    ///
    /// Resolves to `None` once the channel is closed. A value handed to a `Pop`
    /// that is dropped before being polled is dropped with it.
    pub fn pop(&self) -> Pop<T> {
        let mut inner = self.inner.lock();

        if inner.closed {
            // No sender: the receiver resolves to `None`.
            let (_, slot) = oneshot::channel();

            return Pop { slot, waiter: None };
        }

        if let Some(put) = inner.pending_puts.pop_front() {
            // Its receiver lives until the put is retracted, which dequeues it first.
            let _ = put.done.send(());

            return Pop {
                slot: completed(put.value),
                waiter: None,
            };
        }

        let id = inner.next_id();
        let (tx, slot) = oneshot::channel();

        inner.pending_pops.push_back(PendingPop { id, slot: tx });

        Pop {
            slot,
            waiter: Some((id, self.inner.clone())),
        }
    }

    /// Resolves to `index` once a value is available or the channel is closed,
    /// without consuming anything.
    pub fn ready(&self, index: usize) -> Ready<T> {
        let token = SelectToken::new(index);
        let group = SelectGroup::default();

        let channel = if self.register(token, &group) {
            None
        } else {
            Some(self.clone())
        };

        Ready {
            token,
            group,
            channel,
        }
    }

    /// Closes the channel, resolving every waiting consumer with `None`.
    ///
    /// # Panics
    ///
    /// If a producer is still waiting for its value to be claimed.
    pub fn close(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(ChannelError::AlreadyClosed);
        }

        assert!(
            inner.pending_puts.is_empty(),
            "channel closed with {} unclaimed put(s)",
            inner.pending_puts.len()
        );

        trace!(
            "Closing channel, releasing {} pending pop(s) and {} ready waiter(s)",
            inner.pending_pops.len(),
            inner.ready_waiters.len()
        );

        // Dropping the senders resolves every pending pop to `None`.
        inner.pending_pops.clear();

        inner.notify_ready();
        inner.closed = true;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stream of the channel's values, ending when the channel is closed.
    ///
    /// Draining is shared: two iterators over the same channel race for values.
    pub fn iter(&self) -> Iter<T> {
        Iter {
            channel: self.clone(),
            pending: None,
            done: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn num_ready_waiters(&self) -> usize {
        self.inner.lock().ready_waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn num_pending_pops(&self) -> usize {
        self.inner.lock().pending_pops.len()
    }
}

impl<T> Selectable for Channel<T> {
    fn is_ready(&self) -> bool {
        self.inner.lock().is_ready()
    }

    fn register(&self, token: SelectToken, group: &SelectGroup) -> bool {
        let mut inner = self.inner.lock();

        if inner.is_ready() {
            return true;
        }

        inner.ready_waiters.push((token, group.clone()));
        false
    }

    fn unregister(&self, token: SelectToken, group: &SelectGroup) {
        let mut inner = self.inner.lock();
        inner
            .ready_waiters
            .retain(|(t, g)| !(*t == token && g.ptr_eq(group)));
    }
}

/// Completion of a [`Channel::put`].
#[derive(Debug)]
#[must_use = "dropping a pending put takes its value back out of the channel"]
pub struct Put<T> {
    done: oneshot::Receiver<()>,
    waiter: Option<(u64, Arc<Mutex<ChannelInner<T>>>)>,
}

impl<T> Future for Put<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        // The sender is only dropped unsent when this put is retracted.
        let _ = ready!(Pin::new(&mut this.done).poll(cx));
        this.waiter = None;

        Poll::Ready(())
    }
}

impl<T> Drop for Put<T> {
    fn drop(&mut self) {
        if let Some((id, channel)) = self.waiter.take() {
            channel.lock().pending_puts.retain(|p| p.id != id);
        }
    }
}

/// Result of a [`Channel::pop`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Pop<T> {
    slot: oneshot::Receiver<T>,
    waiter: Option<(u64, Arc<Mutex<ChannelInner<T>>>)>,
}

impl<T> Future for Pop<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        let value = ready!(Pin::new(&mut this.slot).poll(cx)).ok();
        this.waiter = None;

        Poll::Ready(value)
    }
}

impl<T> Drop for Pop<T> {
    fn drop(&mut self) {
        if let Some((id, channel)) = self.waiter.take() {
            channel.lock().pending_pops.retain(|p| p.id != id);
        }
    }
}

/// Result of a [`Channel::ready`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Ready<T> {
    token: SelectToken,
    group: SelectGroup,
    channel: Option<Channel<T>>,
}

impl<T> Future for Ready<T> {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<usize> {
        let this = self.get_mut();

        if this.channel.is_some() {
            ready!(this.group.poll_fired(cx));
            this.channel = None;
        }

        Poll::Ready(this.token.index())
    }
}

impl<T> Drop for Ready<T> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.unregister(self.token, &self.group);
        }
    }
}

/// See [`Channel::iter`].
#[derive(Debug)]
pub struct Iter<T> {
    channel: Channel<T>,
    pending: Option<Pop<T>>,
    done: bool,
}

impl<T> Stream for Iter<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        let pop = this.pending.get_or_insert_with(|| this.channel.pop());
        let value = ready!(Pin::new(pop).poll(cx));

        this.pending = None;
        this.done = value.is_none();

        Poll::Ready(value)
    }
}

/// Creates a new unbuffered channel.
pub fn chan<T>() -> Channel<T> {
    Channel::new()
}
