use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::cache::{CacheStore, SourceId};
use crate::sources::TicketSource;

/// A pending refresh request. `force = false` means "respect the TTL and
/// keep the persisted data if it is still fresh".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshTask {
    pub source: SourceId,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted { position: usize },
    AlreadyPending,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub size: usize,
    pub items: Vec<RefreshTask>,
    pub jira_queued: bool,
    pub freshservice_queued: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Idle polling interval of the queue drain loop.
    pub drain_poll: Duration,
    /// Polling interval of the periodic trigger loop; coarser than the drain.
    pub trigger_poll: Duration,
    pub jira_interval: Duration,
    pub freshservice_interval: Duration,
    /// Seed one non-forced task per source at construction so data begins
    /// loading without blocking process startup.
    pub seed_initial_load: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drain_poll: Duration::from_secs(1),
            trigger_poll: Duration::from_secs(60),
            jira_interval: Duration::from_secs(3600),
            freshservice_interval: Duration::from_secs(3600),
            seed_initial_load: true,
        }
    }
}

/// Background refresh machinery: a de-duplicated FIFO task queue drained by
/// one worker, plus an independent periodic trigger per source. Task
/// failures are logged and dropped; neither loop ever dies from one.
pub struct RefreshScheduler {
    queue: Mutex<VecDeque<RefreshTask>>,
    cache: Arc<CacheStore>,
    sources: HashMap<SourceId, Arc<dyn TicketSource>>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        jira: Arc<dyn TicketSource>,
        freshservice: Arc<dyn TicketSource>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let mut queue = VecDeque::new();
        if config.seed_initial_load {
            info!("Queuing initial data loads");
            for source in SourceId::ALL {
                queue.push_back(RefreshTask {
                    source,
                    force: false,
                });
            }
        }
        let mut sources: HashMap<SourceId, Arc<dyn TicketSource>> = HashMap::new();
        sources.insert(SourceId::Jira, jira);
        sources.insert(SourceId::Freshservice, freshservice);
        Arc::new(Self {
            queue: Mutex::new(queue),
            cache,
            sources,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the queue drain loop and the periodic trigger loop. Both run
    /// for the process lifetime unless `shutdown` is called.
    pub fn start(self: &Arc<Self>) {
        let drain = self.clone();
        tokio::spawn(async move {
            info!("Refresh queue processor started");
            let mut tick = tokio::time::interval(drain.config.drain_poll);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = drain.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        while drain.drain_once().await {}
                    }
                }
            }
            info!("Refresh queue processor stopped");
        });

        let trigger = self.clone();
        tokio::spawn(async move {
            let mut last: HashMap<SourceId, Instant> = SourceId::ALL
                .iter()
                .map(|s| (*s, Instant::now()))
                .collect();
            let mut tick = tokio::time::interval(trigger.config.trigger_poll);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so intervals are
            // measured from scheduler start.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = trigger.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        for source in SourceId::ALL {
                            let interval = trigger.interval_for(source);
                            let due = last
                                .get(&source)
                                .map(|t| t.elapsed() >= interval)
                                .unwrap_or(true);
                            if due {
                                trigger.enqueue(source, false);
                                last.insert(source, Instant::now());
                            }
                        }
                    }
                }
            }
            info!("Periodic refresh trigger stopped");
        });
        info!(
            "Background refresh started (jira every {:?}, freshservice every {:?})",
            self.config.jira_interval, self.config.freshservice_interval
        );
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn interval_for(&self, source: SourceId) -> Duration {
        match source {
            SourceId::Jira => self.config.jira_interval,
            SourceId::Freshservice => self.config.freshservice_interval,
        }
    }

    /// Add a refresh task. At most one forced task per source may be pending
    /// at a time; a duplicate forced request is reported, not queued.
    pub fn enqueue(&self, source: SourceId, force: bool) -> EnqueueResult {
        let mut queue = self.queue.lock().expect("refresh queue poisoned");
        if force && queue.iter().any(|t| t.source == source && t.force) {
            return EnqueueResult::AlreadyPending;
        }
        queue.push_back(RefreshTask { source, force });
        if force {
            info!("Force refresh queued for {} data", source);
        }
        EnqueueResult::Accepted {
            position: queue.len(),
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        let queue = self.queue.lock().expect("refresh queue poisoned");
        QueueStatus {
            size: queue.len(),
            items: queue.iter().copied().collect(),
            jira_queued: queue.iter().any(|t| t.source == SourceId::Jira),
            freshservice_queued: queue.iter().any(|t| t.source == SourceId::Freshservice),
        }
    }

    /// Pop and execute the oldest task. Returns false when the queue is
    /// empty. Exposed so tests can drive the drain without the worker loop.
    pub async fn drain_once(&self) -> bool {
        let (task, remaining) = {
            let mut queue = self.queue.lock().expect("refresh queue poisoned");
            match queue.pop_front() {
                Some(task) => (task, queue.len()),
                None => return false,
            }
        };
        info!(
            "Processing {} refresh (force={}, {} remaining in queue)",
            task.source, task.force, remaining
        );
        if let Err(e) = self.run_task(task).await {
            error!("Error processing refresh for {}: {:#}", task.source, e);
        }
        true
    }

    /// Execute one refresh. A non-forced task skips the live fetch while the
    /// persisted snapshot is still fresh. A fetch failure leaves the current
    /// in-memory snapshot untouched.
    async fn run_task(&self, task: RefreshTask) -> Result<()> {
        let cache = self.cache.source(task.source);
        if !task.force && cache.is_persisted_fresh() {
            info!("{} cache still fresh, skipping live fetch", task.source);
            return Ok(());
        }
        let source = self
            .sources
            .get(&task.source)
            .ok_or_else(|| anyhow!("no client registered for {}", task.source))?;
        info!("Refreshing {} data from upstream", task.source);
        let rows = source.fetch_table().await?;
        cache.replace(rows).await
    }
}
