//! Rendezvous channels, select and a counting semaphore for cooperative tasks.
//!
//! Every primitive is a plain [`std::future::Future`]: they run on any executor,
//! and all queue mutations happen under the instance's own lock.

mod channel;
mod select;
mod semaphore;

pub use channel::*;

pub use select::select;
pub use select::DefaultHandler;
pub use select::Handler;
pub use select::Select;
pub use select::SelectGroup;
pub use select::SelectToken;
pub use select::Selectable;

pub use semaphore::Lock;
pub use semaphore::Permit;
pub use semaphore::Semaphore;
pub use semaphore::SemaphoreError;

use tokio::sync::oneshot;

/// Receiver that completes immediately with `value`.
pub(crate) fn completed<T>(value: T) -> oneshot::Receiver<T> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(value);
    rx
}
