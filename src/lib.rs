pub mod config;
pub mod runner;
pub mod sync;

pub use sync::{
    chan, select, Channel, ChannelError, Select, Selectable, Semaphore, SemaphoreError,
};
