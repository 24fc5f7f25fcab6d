use std::{
    future::{poll_fn, Future},
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::{future::LocalBoxFuture, FutureExt};
use log::trace;
use parking_lot::Mutex;

use super::Channel;

/// Identifies one branch of a select. The index is the branch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectToken {
    index: usize,
}

impl SelectToken {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Collects readiness notifications for a set of registered sources.
///
/// Only the first notification is kept: later ones are ignored, so the winner is
/// whichever source became ready first in scheduling time.
#[derive(Debug, Clone, Default)]
pub struct SelectGroup {
    inner: Arc<Mutex<SelectGroupInner>>,
}

#[derive(Debug, Default)]
struct SelectGroupInner {
    fired: Option<usize>,
    waker: Option<Waker>,
}

impl SelectGroup {
    pub fn notify(&self, token: SelectToken) {
        let mut inner = self.inner.lock();

        if inner.fired.is_some() {
            return;
        }

        inner.fired = Some(token.index);
        let waker = inner.waker.take();
        drop(inner);

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn ptr_eq(&self, other: &SelectGroup) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn poll_fired(&self, cx: &mut Context<'_>) -> Poll<usize> {
        let mut inner = self.inner.lock();

        match inner.fired {
            Some(index) => Poll::Ready(index),
            None => {
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// A source that can report readiness without consuming anything.
pub trait Selectable {
    /// Synchronous readiness probe.
    fn is_ready(&self) -> bool;

    /// Registers `group` to be notified with `token` once the source becomes ready.
    ///
    /// Returns `true` if the source is already ready, in which case nothing is
    /// registered.
    fn register(&self, token: SelectToken, group: &SelectGroup) -> bool;

    /// Removes a registration made by [`Selectable::register`]. A no-op if the
    /// registration has already fired.
    fn unregister(&self, token: SelectToken, group: &SelectGroup);
}

pub type Handler<'a, T, R> = Box<dyn FnOnce(Option<T>) -> LocalBoxFuture<'a, R> + 'a>;
pub type DefaultHandler<'a, R> = Box<dyn FnOnce() -> LocalBoxFuture<'a, R> + 'a>;

struct Branch<'a, R> {
    source: &'a dyn Selectable,
    fire: Box<dyn FnOnce() -> LocalBoxFuture<'a, R> + 'a>,
}

/// Waits on several channels at once and runs the handler of the first one
/// that becomes ready.
///
/// ```ignore
/// let mut select = Select::new();
/// select.add(&numbers, |n| async move { n.map(|n| n.to_string()) });
/// select.add(&names, |name| async move { name });
/// select.set_default(|| async { None });
///
/// let out = select.run().await;
/// ```
pub struct Select<'a, R> {
    branches: Vec<Branch<'a, R>>,
    default: Option<DefaultHandler<'a, R>>,
}

impl<'a, R: 'a> Default for Select<'a, R> {
    fn default() -> Self {
        Self {
            branches: vec![],
            default: None,
        }
    }
}

impl<'a, R: 'a> Select<'a, R> {
    pub fn new() -> Self {
        Select::default()
    }

    /// Adds a branch and returns its index. The handler receives the popped value,
    /// or `None` if the channel was closed, and its future is the select's result.
    pub fn add<T, F, Fut>(&mut self, channel: &'a Channel<T>, handler: F) -> usize
    where
        T: 'a,
        F: FnOnce(Option<T>) -> Fut + 'a,
        Fut: Future<Output = R> + 'a,
    {
        let index = self.branches.len();

        self.branches.push(Branch {
            source: channel,
            fire: Box::new(move || async move { handler(channel.pop().await).await }.boxed_local()),
        });

        index
    }

    /// Handler run, without waiting on any branch, when none is ready.
    pub fn set_default<F, Fut>(&mut self, handler: F)
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = R> + 'a,
    {
        self.default = Some(Box::new(move || handler().boxed_local()));
    }

    pub async fn run(self) -> R {
        let Select {
            mut branches,
            default,
        } = self;

        let index = match default {
            Some(default) => match branches.iter().position(|b| b.source.is_ready()) {
                Some(index) => index,
                None => {
                    trace!("select: no branch ready, running default");
                    return default().await;
                }
            },
            None => Self::wait_ready(&branches).await,
        };

        trace!("select: branch {index} won");

        let branch = branches.swap_remove(index);
        (branch.fire)().await
    }

    async fn wait_ready(branches: &[Branch<'a, R>]) -> usize {
        let mut registration = Registration {
            group: SelectGroup::default(),
            sources: Vec::with_capacity(branches.len()),
        };

        for (index, branch) in branches.iter().enumerate() {
            let token = SelectToken::new(index);

            if branch.source.register(token, &registration.group) {
                return index;
            }

            registration.sources.push((branch.source, token));
        }

        let group = registration.group.clone();
        poll_fn(|cx| group.poll_fired(cx)).await
    }
}

/// Registrations of an in-progress select, removed from every source on drop.
struct Registration<'a> {
    group: SelectGroup,
    sources: Vec<(&'a dyn Selectable, SelectToken)>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for (source, token) in self.sources.iter() {
            source.unregister(*token, &self.group);
        }
    }
}

/// Selects over a homogeneous list of `(channel, handler)` branches.
pub async fn select<'a, T, R>(
    branches: Vec<(&'a Channel<T>, Handler<'a, T, R>)>,
    default: Option<DefaultHandler<'a, R>>,
) -> R
where
    T: 'a,
    R: 'a,
{
    let mut select = Select::new();

    for (channel, handler) in branches {
        select.add(channel, handler);
    }

    if let Some(default) = default {
        select.set_default(default);
    }

    select.run().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{select, DefaultHandler, Handler, Select};
    use crate::sync::{chan, Channel};
    use anyhow::Result;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use tokio::time::{sleep, timeout, Instant};

    #[tokio::test]
    async fn test_select_queued_value() -> Result<()> {
        let c = chan::<&str>();
        let put = c.put("put before select")?;

        let mut select = Select::new();
        select.add(&c, |v| async move { v });

        assert_eq!(select.run().await, Some("put before select"));
        put.await;

        Ok(())
    }

    #[tokio::test]
    async fn test_select_value_beats_closed_in_list_order() -> Result<()> {
        let a = chan::<&str>();
        let b = chan::<&str>();

        let put = a.put("a")?;
        b.close()?;

        let mut select = Select::new();
        select.add(&a, |_| async { "value" });
        select.add(&b, |_| async { "closed" });

        assert_eq!(select.run().await, "value");
        put.await;

        Ok(())
    }

    #[tokio::test]
    async fn test_select_closed_branch() -> Result<()> {
        let unblock = chan::<()>();
        let sec1 = chan::<String>();
        unblock.close()?;

        let mut select = Select::new();
        select.add(&sec1, |v| async move { v });
        select.add(&unblock, |_| async { None });

        assert_eq!(select.run().await, None);
        assert_eq!(sec1.num_ready_waiters(), 0);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_put_later() -> Result<()> {
        let c = chan::<String>();

        let producer = {
            let c = c.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                c.put("put 1 sec later".to_string())?.await;
                anyhow::Ok(())
            })
        };

        let mut select = Select::new();
        select.add(&c, |v| async move { v });

        assert_eq!(select.run().await, Some("put 1 sec later".to_string()));
        producer.await??;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_closed_later() -> Result<()> {
        let c = chan::<()>();

        let closer = {
            let c = c.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                c.close()
            })
        };

        let mut select = Select::new();
        select.add(&c, |v| async move { v.is_none() });

        assert!(select.run().await);
        closer.await??;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_from_unselected_channel() -> Result<()> {
        let unblock = chan::<()>();
        let sec1 = chan::<&'static str>();
        unblock.close()?;

        let producer = {
            let sec1 = sec1.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                sec1.put("sec1")?.await;
                anyhow::Ok(())
            })
        };

        let mut select = Select::new();
        select.add(&unblock, |_| async { "unblock" });
        select.add(&sec1, |_| async { "sec1 branch" });

        assert_eq!(select.run().await, "unblock");
        assert_eq!(sec1.pop().await, Some("sec1"));
        producer.await??;

        Ok(())
    }

    #[tokio::test]
    async fn test_first_notification_wins() -> Result<()> {
        let a = chan::<i32>();
        let b = chan::<i32>();

        let mut select = Select::new();
        select.add(&a, |v| async move { v });
        select.add(&b, |v| async move { v });

        let (winner, put_result) = futures::join!(select.run(), async {
            let put_b = b.put(2)?;
            let put_a = a.put(1)?;
            drop(put_a);
            put_b.await;
            anyhow::Ok(())
        });

        put_result?;
        assert_eq!(winner, Some(2));
        assert_eq!(a.num_ready_waiters(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_default_case() -> Result<()> {
        let unblock = chan::<()>();

        let mut select = Select::new();
        select.add(&unblock, |_| async { "unblock" });
        select.set_default(|| async { "default" });

        assert_eq!(select.run().await, "default");
        assert_eq!(unblock.num_ready_waiters(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_default_not_triggered_when_closed() -> Result<()> {
        let unblock = chan::<()>();
        unblock.close()?;

        let mut select = Select::new();
        select.add(&unblock, |_| async { "unblock" });
        select.set_default(|| async { "default" });

        assert_eq!(select.run().await, "unblock");

        Ok(())
    }

    #[tokio::test]
    async fn test_default_not_triggered_when_value_ready() -> Result<()> {
        let unblock = chan::<String>();
        let put = unblock.put("something".to_string())?;

        let mut select = Select::new();
        select.add(&unblock, |v| async move { v });
        select.set_default(|| async { Some("default".to_string()) });

        assert_eq!(select.run().await, Some("something".to_string()));
        put.await;

        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_channel_types() -> Result<()> {
        let numbers = chan::<i32>();
        let names = chan::<String>();

        let put = names.put("bob".to_string())?;

        let mut select = Select::new();
        select.add(&numbers, |n| async move { n.map(|n| n.to_string()) });
        select.add(&names, |name| async move { name });

        assert_eq!(select.run().await, Some("bob".to_string()));
        put.await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_handler() -> Result<()> {
        let jobs = chan::<u64>();
        let put = jobs.put(3)?;

        let mut select = Select::new();
        select.add(&jobs, |job| async move {
            let Some(job) = job else {
                return None;
            };

            sleep(Duration::from_millis(job * 10)).await;
            Some(job * 2)
        });

        let start = Instant::now();
        assert_eq!(select.run().await, Some(6));
        assert!(start.elapsed() >= Duration::from_millis(30));
        put.await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_select_unregisters() -> Result<()> {
        let a = chan::<i32>();
        let b = chan::<i32>();

        let mut select = Select::new();
        select.add(&a, |v| async move { v });
        select.add(&b, |v| async move { v });

        assert!(timeout(Duration::from_millis(10), select.run())
            .await
            .is_err());

        assert_eq!(a.num_ready_waiters(), 0);
        assert_eq!(b.num_ready_waiters(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_select_fn() -> Result<()> {
        let a: Channel<i32> = chan();
        let b: Channel<i32> = chan();
        b.close()?;

        let on_a: Handler<'_, i32, &str> = Box::new(|_| async { "a" }.boxed_local());
        let on_b: Handler<'_, i32, &str> = Box::new(|_| async { "b" }.boxed_local());

        assert_eq!(select(vec![(&a, on_a), (&b, on_b)], None).await, "b");

        let on_a: Handler<'_, i32, &str> = Box::new(|_| async { "a" }.boxed_local());
        let on_default: DefaultHandler<'_, &str> = Box::new(|| async { "default" }.boxed_local());
        assert_eq!(select(vec![(&a, on_a)], Some(on_default)).await, "default");

        Ok(())
    }
}
