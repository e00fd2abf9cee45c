use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Credentials;
use crate::feed::{latest_metrics, NormalizedSample};
use crate::gateway::{Banner, Gateway, ReadingsOutcome};
use crate::transport::FeedTransport;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    Idle,
    Polling,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollQuality {
    pub polls_ok: u64,
    pub polls_err: u64,
    pub stale_dropped: u64,
    pub interval_ms: u128,
}

/// The published state: the current upstream window plus the banner for the last applied tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub ts: DateTime<Utc>,
    pub tick: u64,
    pub phase: PollerPhase,
    pub status: Option<Banner>,
    pub series: Vec<NormalizedSample>,
    pub latest: NormalizedSample,
    pub last_ok_ts: Option<DateTime<Utc>>,
    pub quality: PollQuality,
}

impl PollSnapshot {
    fn idle() -> Self {
        Self {
            ts: Utc::now(),
            tick: 0,
            phase: PollerPhase::Idle,
            status: None,
            series: Vec::new(),
            latest: NormalizedSample::default(),
            last_ok_ts: None,
            quality: PollQuality::default(),
        }
    }
}

struct Shared {
    generation: u64,
    issued_tick: u64,
    applied_tick: u64,
    snapshot: PollSnapshot,
}

struct Inner<T: FeedTransport> {
    gateway: Gateway<T>,
    shared: Mutex<Shared>,
    publisher: watch::Sender<PollSnapshot>,
}

impl<T: FeedTransport> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn issue_tick(&self, generation: u64) -> Option<u64> {
        let mut shared = self.lock();
        if shared.generation != generation {
            return None;
        }
        shared.issued_tick += 1;
        Some(shared.issued_tick)
    }

    fn publish(&self, shared: &Shared) {
        self.publisher.send_replace(shared.snapshot.clone());
    }

    fn apply(&self, generation: u64, tick: u64, outcome: ReadingsOutcome) {
        let mut shared = self.lock();

        if shared.generation != generation {
            debug!(tick, "discarding result that arrived after stop");
            return;
        }

        if tick <= shared.applied_tick {
            shared.snapshot.quality.stale_dropped += 1;
            debug!(tick, applied = shared.applied_tick, "dropping stale result");
            self.publish(&shared);
            return;
        }

        let now = Utc::now();
        shared.applied_tick = tick;
        let snapshot = &mut shared.snapshot;
        snapshot.ts = now;
        snapshot.tick = tick;
        snapshot.status = Some(outcome.banner());

        match outcome {
            ReadingsOutcome::Ok(series) => {
                snapshot.latest = latest_metrics(&series);
                snapshot.series = series;
                snapshot.last_ok_ts = Some(now);
                snapshot.quality.polls_ok += 1;
            }
            ReadingsOutcome::Empty => {
                snapshot.series.clear();
                snapshot.latest = NormalizedSample::default();
                snapshot.last_ok_ts = Some(now);
                snapshot.quality.polls_ok += 1;
            }
            _ => {
                snapshot.quality.polls_err += 1;
            }
        }

        self.publish(&shared);
    }
}

/// Keeps the most recent upstream window fresh on a fixed schedule.
///
/// Every tick fetches independently: a slow response never delays the timer, and
/// results are applied in tick order, so a late answer from an older tick is dropped
/// instead of overwriting a newer window. After `stop` nothing further is fetched or applied.
pub struct Poller<T: FeedTransport + 'static> {
    inner: Arc<Inner<T>>,
    timer: Option<JoinHandle<()>>,
}

impl<T: FeedTransport + 'static> Poller<T> {
    pub fn new(gateway: Gateway<T>) -> Self {
        let (publisher, _) = watch::channel(PollSnapshot::idle());
        Self {
            inner: Arc::new(Inner {
                gateway,
                shared: Mutex::new(Shared {
                    generation: 0,
                    issued_tick: 0,
                    applied_tick: 0,
                    snapshot: PollSnapshot::idle(),
                }),
                publisher,
            }),
            timer: None,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.timer.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.inner.publisher.subscribe()
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.inner.publisher.borrow().clone()
    }

    /// One gated request, returned to the caller without touching the published state.
    pub async fn fetch_once(&self, credentials: &Credentials) -> ReadingsOutcome {
        self.inner.gateway.request_readings(credentials).await
    }

    /// Fetches now and then every `every`, reading `config` afresh on each tick.
    pub fn start(&mut self, config: watch::Receiver<Credentials>, every: Duration) {
        if self.timer.is_some() {
            warn!("poller already running, ignoring start");
            return;
        }

        let every = every.max(MIN_INTERVAL);
        let generation = {
            let mut shared = self.inner.lock();
            shared.generation += 1;
            shared.snapshot.phase = PollerPhase::Polling;
            shared.snapshot.quality.interval_ms = every.as_millis();
            self.inner.publish(&shared);
            shared.generation
        };
        info!(interval_ms = %every.as_millis(), "poller started");

        let inner = Arc::clone(&self.inner);
        self.timer = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(tick) = inner.issue_tick(generation) else {
                    break;
                };
                let credentials = config.borrow().clone();
                debug!(tick, "poll tick");

                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if !inner.is_current(generation) {
                        return;
                    }
                    let outcome = inner.gateway.request_readings(&credentials).await;
                    inner.apply(generation, tick, outcome);
                });
            }
        }));
    }

    pub fn stop(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };

        {
            let mut shared = self.inner.lock();
            shared.generation += 1;
            shared.snapshot.phase = PollerPhase::Idle;
            self.inner.publish(&shared);
        }
        timer.abort();
        info!("poller stopped");
    }
}

impl<T: FeedTransport + 'static> Drop for Poller<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
