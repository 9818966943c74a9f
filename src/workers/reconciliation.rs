//! Reconciliation Scheduler
//!
//! Catches notifications that never arrived. A run goes
//! IDLE -> ELECTING -> SWEEPING -> IDLE: scheduled runs first check that this
//! instance is the earliest-started live instance, then page through PENDING
//! orders created inside the window, query each provider and push every
//! settled result through the same pipeline the webhooks use.
//!
//! The sweep holds no position of its own. Stopping between pages is safe;
//! the next run starts again from whatever is still PENDING.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::instances::{earliest_instance, InstanceRegistry};
use crate::database::{Order, OrderStore, StoreError};
use crate::error::GatewayError;
use crate::payments::{ProviderError, ProviderName, ProviderRegistry};
use crate::services::NotificationPipeline;

/// Upper bound on any sweep lookback
pub const MAX_LOOKBACK_MINUTES: i64 = 24 * 60;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub page_size: i64,
    /// Provider queries in flight per page
    pub query_concurrency: usize,
    pub max_lookback_minutes: i64,
    /// Cron expression (with seconds) for the short-window sweep
    pub minute_schedule: String,
    /// Short-window sweep covers `[now - start, now - end)` in minutes
    pub minute_window_start: i64,
    pub minute_window_end: i64,
    /// Cron expression for the full-day sweep
    pub daily_schedule: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 100,
            query_concurrency: 8,
            max_lookback_minutes: MAX_LOOKBACK_MINUTES,
            minute_schedule: "0 */10 * * * *".to_string(),
            minute_window_start: 30,
            minute_window_end: 5,
            daily_schedule: "0 30 2 * * *".to_string(),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    #[error("invalid sweep window: {0}")]
    InvalidWindow(String),

    #[error("order store error: {0}")]
    Store(#[from] StoreError),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

// ============================================================================
// Requests and windows
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowKind {
    LastDay,
    LastNMinutes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub window_kind: WindowKind,
    #[serde(default)]
    pub start_minute: Option<i64>,
    #[serde(default)]
    pub end_minute: Option<i64>,
    #[serde(default)]
    pub notify_on_completion: bool,
}

impl ReconcileRequest {
    pub fn last_day(notify_on_completion: bool) -> Self {
        Self {
            window_kind: WindowKind::LastDay,
            start_minute: None,
            end_minute: None,
            notify_on_completion,
        }
    }

    pub fn last_minutes(start_minute: i64, end_minute: i64, notify_on_completion: bool) -> Self {
        Self {
            window_kind: WindowKind::LastNMinutes,
            start_minute: Some(start_minute),
            end_minute: Some(end_minute),
            notify_on_completion,
        }
    }

    /// Folds a second request into one run: the full day covers any minute
    /// window, otherwise the newer window wins.
    fn merge(self, newer: ReconcileRequest) -> Self {
        let notify_on_completion = self.notify_on_completion || newer.notify_on_completion;
        let base = if self.window_kind == WindowKind::LastDay {
            self
        } else {
            newer
        };
        Self {
            notify_on_completion,
            ..base
        }
    }
}

/// Creation-time range `[from, to)` swept for PENDING orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SweepWindow {
    pub fn resolve(
        request: &ReconcileRequest,
        config: &ReconciliationConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, ReconciliationError> {
        let max_lookback = config.max_lookback_minutes.clamp(1, MAX_LOOKBACK_MINUTES);

        let (start, end) = match request.window_kind {
            WindowKind::LastDay => (MAX_LOOKBACK_MINUTES, 0),
            WindowKind::LastNMinutes => (
                request.start_minute.unwrap_or(config.minute_window_start),
                request.end_minute.unwrap_or(config.minute_window_end),
            ),
        };

        if end < 0 || start <= end {
            return Err(ReconciliationError::InvalidWindow(format!(
                "start minute {} must be greater than end minute {} and both non-negative",
                start, end
            )));
        }

        let start = if start > max_lookback {
            debug!(requested = start, max_lookback, "Clamping sweep lookback");
            max_lookback
        } else {
            start
        };
        if start <= end {
            return Err(ReconciliationError::InvalidWindow(format!(
                "window ends {} minutes ago, beyond the {} minute lookback",
                end, max_lookback
            )));
        }

        Ok(Self {
            from: now - ChronoDuration::minutes(start),
            to: now - ChronoDuration::minutes(end),
        })
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSweepStats {
    /// PENDING orders found in the window
    pub needed: u64,
    /// Orders the sweep actually moved out of PENDING
    pub transitioned: u64,
    pub query_failures: u64,
    pub apply_failures: u64,
}

impl ProviderSweepStats {
    fn record(&mut self, outcome: OrderOutcome) {
        self.needed += 1;
        match outcome {
            OrderOutcome::Transitioned => self.transitioned += 1,
            OrderOutcome::QueryFailed => self.query_failures += 1,
            OrderOutcome::ApplyFailed => self.apply_failures += 1,
            OrderOutcome::StillPending | OrderOutcome::SettledElsewhere => {}
        }
    }
}

/// What the sweep did with one PENDING order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderOutcome {
    StillPending,
    Transitioned,
    SettledElsewhere,
    QueryFailed,
    ApplyFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub trigger: TriggerSource,
    pub window: SweepWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u64,
    pub interrupted: bool,
    pub providers: BTreeMap<ProviderName, ProviderSweepStats>,
}

impl SweepReport {
    pub fn provider(&self, provider: ProviderName) -> ProviderSweepStats {
        self.providers.get(&provider).cloned().unwrap_or_default()
    }

    pub fn total_needed(&self) -> u64 {
        self.providers.values().map(|s| s.needed).sum()
    }

    pub fn total_transitioned(&self) -> u64 {
        self.providers.values().map(|s| s.transitioned).sum()
    }
}

/// Receives completed sweep reports when the request asked for it
#[async_trait]
pub trait SweepReporter: Send + Sync {
    async fn report(&self, report: &SweepReport);
}

pub struct TracingSweepReporter;

#[async_trait]
impl SweepReporter for TracingSweepReporter {
    async fn report(&self, report: &SweepReport) {
        for (provider, stats) in &report.providers {
            info!(
                event_type = "reconciliation_report",
                provider = %provider,
                needed = stats.needed,
                transitioned = stats.transitioned,
                query_failures = stats.query_failures,
                apply_failures = stats.apply_failures,
                "Reconciliation provider summary"
            );
        }
    }
}

// ============================================================================
// Scheduler state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Idle,
    Electing,
    Sweeping,
}

impl SchedulerState {
    fn as_u8(self) -> u8 {
        match self {
            SchedulerState::Idle => 0,
            SchedulerState::Electing => 1,
            SchedulerState::Sweeping => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SchedulerState::Electing,
            2 => SchedulerState::Sweeping,
            _ => SchedulerState::Idle,
        }
    }
}

/// Holds the run slot; returns the scheduler to IDLE however the run ends.
struct RunGuard {
    state: Arc<AtomicU8>,
}

impl RunGuard {
    fn set(&self, next: SchedulerState) {
        self.state.store(next.as_u8(), Ordering::SeqCst);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.store(SchedulerState::Idle.as_u8(), Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<SweepWindow>,
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    registry: Arc<ProviderRegistry>,
    pipeline: Arc<NotificationPipeline>,
    instances: Arc<dyn InstanceRegistry>,
    instance_id: String,
    reporter: Arc<dyn SweepReporter>,
    config: ReconciliationConfig,
    state: Arc<AtomicU8>,
    /// Scheduled request that arrived while a sweep held the slot
    pending: Mutex<Option<ReconcileRequest>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// A deferred scheduled run that has claimed the slot
struct FollowUp {
    guard: RunGuard,
    window: SweepWindow,
    notify: bool,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: Arc<ProviderRegistry>,
        pipeline: Arc<NotificationPipeline>,
        instances: Arc<dyn InstanceRegistry>,
        instance_id: impl Into<String>,
        reporter: Arc<dyn SweepReporter>,
        config: ReconciliationConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            pipeline,
            instances,
            instance_id: instance_id.into(),
            reporter,
            config,
            state: Arc::new(AtomicU8::new(SchedulerState::Idle.as_u8())),
            pending: Mutex::new(None),
            shutdown_rx,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn begin(&self) -> Option<RunGuard> {
        self.state
            .compare_exchange(
                SchedulerState::Idle.as_u8(),
                SchedulerState::Electing.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| RunGuard {
                state: self.state.clone(),
            })
    }

    /// Starts a sweep in the background and returns at once.
    ///
    /// A scheduled trigger that finds a sweep running is queued and runs
    /// right after it; queued requests coalesce into one follow-up. Manual
    /// triggers are refused instead.
    pub fn trigger(
        self: &Arc<Self>,
        request: ReconcileRequest,
        source: TriggerSource,
    ) -> Result<TriggerAck, ReconciliationError> {
        let window = SweepWindow::resolve(&request, &self.config, Utc::now())?;

        let Some(guard) = self.begin() else {
            if source == TriggerSource::Manual {
                info!(source = ?source, "Reconciliation already running, trigger skipped");
                return Ok(TriggerAck {
                    accepted: false,
                    reason: Some("reconciliation already in progress".to_string()),
                    window: None,
                });
            }

            info!(window_kind = ?request.window_kind, "Reconciliation already running, queueing follow-up");
            self.defer(request);
            // The running sweep may have drained the queue just before we filled it
            if let Some(follow_up) = self.take_follow_up() {
                self.spawn_run(follow_up.guard, follow_up.window, source, follow_up.notify);
            }
            return Ok(TriggerAck {
                accepted: true,
                reason: Some("queued behind the running sweep".to_string()),
                window: None,
            });
        };

        self.spawn_run(guard, window, source, request.notify_on_completion);
        Ok(TriggerAck {
            accepted: true,
            reason: None,
            window: Some(window),
        })
    }

    fn spawn_run(self: &Arc<Self>, guard: RunGuard, window: SweepWindow, source: TriggerSource, notify: bool) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.execute(guard, window, source, notify).await {
                error!(error = %e, "Reconciliation run failed");
            }
            this.drain_follow_ups().await;
        });
    }

    fn defer(&self, request: ReconcileRequest) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let merged = match pending.take() {
            Some(queued) => queued.merge(request),
            None => request,
        };
        *pending = Some(merged);
    }

    /// Claims the slot for the queued request, if there is one and the slot
    /// is free. Holding the queue lock across the claim keeps `defer` and
    /// the draining run from both missing it.
    fn take_follow_up(&self) -> Option<FollowUp> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.as_ref()?;
        let guard = self.begin()?;
        let request = pending.take()?;
        drop(pending);

        match SweepWindow::resolve(&request, &self.config, Utc::now()) {
            Ok(window) => Some(FollowUp {
                guard,
                window,
                notify: request.notify_on_completion,
            }),
            Err(e) => {
                warn!(error = %e, "Dropping queued reconciliation request");
                None
            }
        }
    }

    async fn drain_follow_ups(&self) {
        while let Some(follow_up) = self.take_follow_up() {
            debug!(from = %follow_up.window.from, to = %follow_up.window.to, "Running queued reconciliation");
            if let Err(e) = self
                .execute(follow_up.guard, follow_up.window, TriggerSource::Scheduled, follow_up.notify)
                .await
            {
                error!(error = %e, "Queued reconciliation run failed");
            }
        }
    }

    /// Runs a sweep to completion. `None` when another run holds the slot
    /// or this instance lost the election.
    pub async fn run(
        &self,
        request: ReconcileRequest,
        source: TriggerSource,
    ) -> Result<Option<SweepReport>, ReconciliationError> {
        let window = SweepWindow::resolve(&request, &self.config, Utc::now())?;
        let Some(guard) = self.begin() else {
            return Ok(None);
        };
        let report = self
            .execute(guard, window, source, request.notify_on_completion)
            .await;
        self.drain_follow_ups().await;
        report
    }

    async fn execute(
        &self,
        guard: RunGuard,
        window: SweepWindow,
        source: TriggerSource,
        notify: bool,
    ) -> Result<Option<SweepReport>, ReconciliationError> {
        // Operators pick the instance for manual runs
        if source == TriggerSource::Scheduled && !self.is_leader().await {
            debug!(instance_id = %self.instance_id, "Not the reconciliation leader, skipping sweep");
            return Ok(None);
        }

        guard.set(SchedulerState::Sweeping);
        let report = self.sweep(window, source).await?;

        info!(
            event_type = "reconciliation_complete",
            trigger = ?report.trigger,
            pages = report.pages,
            needed = report.total_needed(),
            transitioned = report.total_transitioned(),
            interrupted = report.interrupted,
            duration_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Reconciliation sweep finished"
        );
        if notify {
            self.reporter.report(&report).await;
        }
        Ok(Some(report))
    }

    /// Earliest-started live instance wins. Registry failures fall back to
    /// sweeping: a duplicate sweep is a no-op, a skipped one is not.
    async fn is_leader(&self) -> bool {
        match self.instances.list_instances().await {
            Ok(instances) => match earliest_instance(&instances) {
                Some(leader) => leader.instance_id == self.instance_id,
                None => true,
            },
            Err(e) => {
                warn!(error = %e, "Instance registry unavailable, sweeping without election");
                true
            }
        }
    }

    #[instrument(skip(self), fields(from = %window.from, to = %window.to))]
    async fn sweep(
        &self,
        window: SweepWindow,
        source: TriggerSource,
    ) -> Result<SweepReport, ReconciliationError> {
        let mut report = SweepReport {
            trigger: source,
            window,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            pages: 0,
            interrupted: false,
            providers: BTreeMap::new(),
        };
        let page_size = self.config.page_size.max(1);
        let concurrency = self.config.query_concurrency.max(1);
        let mut after_id = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                warn!(after_id, "Shutdown requested, stopping sweep between pages");
                report.interrupted = true;
                break;
            }

            let page = self
                .store
                .list_pending_page(window.from, window.to, after_id, page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            report.pages += 1;

            let outcomes: Vec<(ProviderName, OrderOutcome)> = stream::iter(page.iter().cloned())
                .map(|order| async move { (order.provider, self.reconcile_order(&order).await) })
                .buffer_unordered(concurrency)
                .collect()
                .await;
            for (provider, outcome) in outcomes {
                report.providers.entry(provider).or_default().record(outcome);
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    async fn reconcile_order(&self, order: &Order) -> OrderOutcome {
        let provider = match self.registry.get(order.provider, &order.app_id).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!(order_ref = %order.order_ref, error = %e, "No adapter for order, skipping");
                return OrderOutcome::QueryFailed;
            }
        };

        let status = match provider.query(&order.order_ref).await {
            Ok(status) => status,
            Err(ProviderError::NotFound(_)) => {
                debug!(order_ref = %order.order_ref, "Provider has no record yet, still pending");
                return OrderOutcome::StillPending;
            }
            Err(e) => {
                warn!(order_ref = %order.order_ref, provider = %order.provider, error = %e, "Provider query failed, retrying next sweep");
                return OrderOutcome::QueryFailed;
            }
        };

        let Some(event) = status.into_event(order.provider, &order.order_ref) else {
            return OrderOutcome::StillPending;
        };

        match self.pipeline.process(event).await {
            Ok(_) => {
                info!(order_ref = %order.order_ref, provider = %order.provider, "Reconciliation settled order");
                OrderOutcome::Transitioned
            }
            Err(GatewayError::AlreadyProcessed) | Err(GatewayError::LockContention) => {
                debug!(order_ref = %order.order_ref, "Order settled concurrently by webhook");
                OrderOutcome::SettledElsewhere
            }
            Err(e) => {
                warn!(order_ref = %order.order_ref, error = %e, "Failed to apply reconciled status");
                OrderOutcome::ApplyFailed
            }
        }
    }
}
