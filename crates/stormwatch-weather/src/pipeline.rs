//! Forecast pipeline: cache decision, fetch, signal derivation and
//! write-through, published as snapshots on a watch channel.
//!
//! # State machine
//! `Idle -> Loading -> Ready | Failed`. A forced refetch (retry or the
//! hourly refresh) moves `Ready` or `Failed` back to `Loading`. A failed
//! fetch keeps the previously shown forecast and signals.
//!
//! # Superseded fetches
//! Every activation bumps a generation counter. A fetch result is applied
//! only if its generation is still current and the coordinates still match
//! the active request; anything else is dropped without touching the cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::error::FetchError;
use crate::freshness::{check_freshness, CacheDecision, HourlyAligner};
use crate::provider::ForecastSource;
use crate::signals::derive_hazard_signals;
use crate::types::{CacheEntry, ForecastPoint, HazardSignals, LocationRequest};

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Wall-clock time used for hourly alignment.
    fn local_now(&self) -> NaiveDateTime {
        self.now().with_timezone(&Local).naive_local()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Its local time is UTC.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn local_now(&self) -> NaiveDateTime {
        self.now().naive_utc()
    }
}

impl<C: Clock> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn local_now(&self) -> NaiveDateTime {
        (**self).local_now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Ready,
    Failed,
}

/// What the presentation layer sees.
#[derive(Debug, Clone, Default)]
pub struct PipelineSnapshot {
    pub phase: Phase,
    pub request: Option<LocationRequest>,
    pub forecast: Option<Vec<ForecastPoint>>,
    pub signals: Option<HazardSignals>,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_loading: bool,
    pub error: Option<Arc<FetchError>>,
}

impl PipelineSnapshot {
    pub fn error_message(&self) -> Option<&'static str> {
        self.error.as_deref().map(FetchError::user_message)
    }

    fn show(&mut self, entry: CacheEntry) {
        self.phase = Phase::Ready;
        self.is_loading = false;
        self.error = None;
        self.forecast = Some(entry.forecast);
        self.signals = Some(entry.signals);
        self.last_updated = Some(entry.last_updated);
    }
}

struct State {
    request: Option<LocationRequest>,
    generation: u64,
}

struct Inner<S, C> {
    source: S,
    clock: C,
    store: CacheStore,
    state: Mutex<State>,
    snapshots: watch::Sender<PipelineSnapshot>,
}

/// Orchestrates one forecast point. Cheap to clone; clones share state.
pub struct ForecastPipeline<S, C = SystemClock> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for ForecastPipeline<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ForecastSource> ForecastPipeline<S, SystemClock> {
    pub fn new(source: S, store: CacheStore) -> Self {
        Self::with_clock(source, store, SystemClock)
    }
}

impl<S: ForecastSource, C: Clock> ForecastPipeline<S, C> {
    pub fn with_clock(source: S, store: CacheStore, clock: C) -> Self {
        let (snapshots, _) = watch::channel(PipelineSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                source,
                clock,
                store,
                state: Mutex::new(State {
                    request: None,
                    generation: 0,
                }),
                snapshots,
            }),
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Show the forecast for `request`, from cache when fresh, otherwise
    /// from the network.
    pub async fn activate(&self, request: LocationRequest) -> PipelineSnapshot {
        let generation = self.begin(&request);
        let now = self.inner.clock.now();

        match check_freshness(&self.inner.store, &request, now) {
            CacheDecision::Hit(entry) => {
                tracing::debug!("Serving cached forecast for {}, {}", request.lat, request.lon);
                self.apply(&request, generation, |snap| snap.show(entry));
                self.snapshot()
            }
            CacheDecision::Miss(reason) => {
                tracing::debug!(
                    "Cache miss for {}, {} ({:?})",
                    request.lat,
                    request.lon,
                    reason
                );
                self.fetch(request, generation).await
            }
        }
    }

    /// Refetch the active request regardless of cache state. Does nothing
    /// before the first activation.
    pub async fn retry(&self) -> PipelineSnapshot {
        let active = self.inner.state.lock().request.clone();
        let Some(request) = active else {
            tracing::debug!("Retry requested before any activation");
            return self.snapshot();
        };
        let request = request.with_location_changed(false);
        let generation = self.begin(&request);
        self.fetch(request, generation).await
    }

    fn begin(&self, request: &LocationRequest) -> u64 {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.request = Some(request.clone());
        state.generation
    }

    /// Run `update` on the published snapshot if the fetch for `request`
    /// at `generation` has not been superseded. Returns whether it applied.
    fn apply(
        &self,
        request: &LocationRequest,
        generation: u64,
        update: impl FnOnce(&mut PipelineSnapshot),
    ) -> bool {
        let state = self.inner.state.lock();
        let current = state.generation == generation
            && state
                .request
                .as_ref()
                .is_some_and(|active| active.same_point(request));
        if current {
            self.inner.snapshots.send_modify(|snap| {
                snap.request = Some(request.clone());
                update(snap);
            });
        }
        current
    }

    async fn fetch(&self, request: LocationRequest, generation: u64) -> PipelineSnapshot {
        self.apply(&request, generation, |snap| {
            snap.phase = Phase::Loading;
            snap.is_loading = true;
        });

        let result = self.inner.source.fetch(&request.lat, &request.lon).await;
        let now = self.inner.clock.now();

        let applied = match result {
            Ok(response) => {
                let hourly = response.hourly_from(now);
                let entry = CacheEntry {
                    lat: request.lat.clone(),
                    lon: request.lon.clone(),
                    last_updated: now,
                    forecast: response.forecast_list(),
                    signals: derive_hazard_signals(&hourly),
                };
                let store = &self.inner.store;
                self.apply(&request, generation, |snap| {
                    if let Err(e) = store.write_entry(&entry) {
                        tracing::warn!("Failed to persist forecast: {}", e);
                    }
                    tracing::info!(
                        "Forecast updated for {}, {}: {} days, hazards {:?}",
                        request.lat,
                        request.lon,
                        entry.forecast.len(),
                        entry.signals.active_hazards()
                    );
                    snap.show(entry);
                })
            }
            Err(e) => {
                tracing::error!("Forecast fetch failed: {}", e);
                self.apply(&request, generation, |snap| {
                    snap.phase = Phase::Failed;
                    snap.is_loading = false;
                    snap.error = Some(Arc::new(e));
                })
            }
        };

        if !applied {
            tracing::debug!(
                "Discarding superseded forecast for {}, {}",
                request.lat,
                request.lon
            );
        }
        self.snapshot()
    }

    /// Refetch once per wall-clock hour, shortly after the hour turns.
    /// The task stops when the returned handle is shut down or dropped.
    pub fn spawn_hourly_refresh(&self, poll: Duration) -> RefreshHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let pipeline = self.clone();

        let task = tokio::spawn(async move {
            let mut aligner = HourlyAligner::new(pipeline.inner.clock.local_now());
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !aligner.poll(pipeline.inner.clock.local_now()) {
                    continue;
                }

                tracing::info!("Hourly forecast refresh");
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = pipeline.retry() => {}
                }
            }
            tracing::debug!("Hourly refresh stopped");
        });

        RefreshHandle {
            token,
            task: Some(task),
        }
    }
}

/// Owner of the hourly refresh task. Dropping it cancels the task.
pub struct RefreshHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Hourly refresh task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
