use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub use anyhow::Result;
use log::{debug, info, warn};
use tokio::{
    runtime,
    task::JoinHandle,
    time::{sleep, Instant},
};

use crate::{
    config::FanInConfig,
    sync::{chan, Select, Semaphore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub producer: usize,
    pub seq: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub processed: usize,
    pub max_in_flight: usize,
    pub elapsed: Duration,
}

enum Event {
    Item(Item),
    Quit,
}

/// Producers put items on a shared rendezvous channel; a dispatcher selects
/// between that channel and a quit channel, and resolves every item under a
/// semaphore.
pub struct FanInRunner {
    config: FanInConfig,
}

impl FanInRunner {
    pub fn new(config: FanInConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self { config })
    }

    /// Runs the workload on a current-thread runtime.
    pub fn run_blocking(self) -> Result<Report> {
        let rt = runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        rt.block_on(self.run())
    }

    pub async fn run(self) -> Result<Report> {
        let config = self.config;

        let data = chan::<Item>();
        let quit = chan::<()>();
        let semaphore = Semaphore::new(config.concurrency()?);
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let delay = Duration::from_millis(config.resolve_delay_ms);
        let total = config.total_items()?;

        info!(
            "Running {total} item(s) from {} producer(s), {} concurrent resolver(s)",
            config.producers,
            semaphore.capacity()
        );

        let start = Instant::now();

        let producers: Vec<JoinHandle<Result<()>>> = (0..config.producers)
            .map(|producer| {
                let data = data.clone();
                let items = config.items_per_producer;

                tokio::spawn(async move {
                    for seq in 0..items {
                        data.put(Item { producer, seq })?.await;
                    }

                    debug!("Producer {producer} done");
                    anyhow::Ok(())
                })
            })
            .collect();

        let coordinator = {
            let quit = quit.clone();

            tokio::spawn(async move {
                for p in producers {
                    p.await??;
                }

                quit.close()?;
                anyhow::Ok(())
            })
        };

        let mut resolvers = vec![];

        loop {
            let mut select = Select::new();
            select.add(&data, |item| async move { item.map_or(Event::Quit, Event::Item) });
            select.add(&quit, |_| async { Event::Quit });

            match select.run().await {
                Event::Item(item) => {
                    let semaphore = semaphore.clone();
                    let max_in_flight = max_in_flight.clone();

                    resolvers.push(tokio::spawn(async move {
                        semaphore
                            .run(|| async {
                                max_in_flight.fetch_max(semaphore.in_flight(), Ordering::SeqCst);
                                resolve(item, delay).await
                            })
                            .await
                    }));
                }
                Event::Quit => break,
            }
        }

        coordinator.await??;
        data.close()?;

        let mut processed = 0;
        for r in resolvers {
            r.await?;
            processed += 1;
        }

        if processed != total {
            warn!("Resolved {processed} item(s), expected {total}");
        }

        let report = Report {
            processed,
            max_in_flight: max_in_flight.load(Ordering::SeqCst),
            elapsed: start.elapsed(),
        };

        info!(
            "Resolved {} item(s) in {:.3} s, at most {} at once",
            report.processed,
            report.elapsed.as_secs_f64(),
            report.max_in_flight
        );

        Ok(report)
    }
}

async fn resolve(item: Item, delay: Duration) -> Item {
    sleep(delay).await;
    debug!("Resolved item {} of producer {}", item.seq, item.producer);

    item
}
