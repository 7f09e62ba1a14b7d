// Error Recovery Engine
// Records errors, runs strategies one at a time, retries with fixed backoff,
// escalates and watches per-component error rates

use crate::recovery::{
    default_strategies, Classify, Collaborators, ErrorKey, ErrorKind, ErrorRecord,
    ErrorStatistics, FollowUpAction, RecoveryConfig, RecoveryError, RecoveryStrategy, Severity,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyReason {
    CriticalError { id: String, kind: ErrorKind },
    ErrorRate { key: ErrorKey, count: usize },
}

/// Observable recovery activity
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    ErrorRecorded { id: String, kind: ErrorKind, severity: Severity },
    RecoveryAttempted { id: String, kind: ErrorKind, attempt: u32 },
    Recovered { id: String, kind: ErrorKind, elapsed: Duration },
    RetryScheduled { id: String, attempt: u32, delay: Duration },
    Escalated { id: String, kind: ErrorKind, severity: Severity },
    HighPriorityAlert { id: String, kind: ErrorKind, message: String },
    EmergencyModeEntered(EmergencyReason),
    EmergencyModeCleared,
    RateExceeded { key: ErrorKey, count: usize },
    FollowUpRun(FollowUpAction),
    FollowUpSuspended(FollowUpAction),
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

// ============================================================================
// ENGINE
// ============================================================================

struct EngineInner {
    config: RecoveryConfig,
    collaborators: Collaborators,
    strategies: Mutex<HashMap<ErrorKind, Arc<dyn RecoveryStrategy>>>,
    history: Mutex<Vec<ErrorRecord>>,
    counts: Mutex<HashMap<ErrorKey, u32>>,
    /// Keys with an attempt running or a retry scheduled
    in_flight: Mutex<HashSet<ErrorKey>>,
    gate: tokio::sync::Mutex<()>,
    emergency: AtomicBool,
    escalations: AtomicUsize,
    events: broadcast::Sender<RecoveryEvent>,
    retries: Mutex<Vec<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Process-wide error intake and recovery
///
/// Cheap to clone. Recovery attempts are serialised through one async gate;
/// retries are independent delayed tasks owned by the engine.
#[derive(Clone)]
pub struct ErrorRecoveryEngine {
    inner: Arc<EngineInner>,
}

impl ErrorRecoveryEngine {
    pub fn new(config: RecoveryConfig, collaborators: Collaborators) -> Result<Self, RecoveryError> {
        config.validate()?;
        let strategies = default_strategies(&collaborators, &config);
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                collaborators,
                strategies: Mutex::new(strategies),
                history: Mutex::new(Vec::new()),
                counts: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                gate: tokio::sync::Mutex::new(()),
                emergency: AtomicBool::new(false),
                escalations: AtomicUsize::new(0),
                events,
                retries: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// Replace the strategy used for `kind`
    pub fn set_strategy(&self, kind: ErrorKind, strategy: Arc<dyn RecoveryStrategy>) {
        self.lock_strategies().insert(kind, strategy);
    }

    /// Stop recovering `kind` automatically; such errors escalate directly
    pub fn remove_strategy(&self, kind: ErrorKind) {
        self.lock_strategies().remove(&kind);
    }

    pub fn strategy_for(&self, kind: ErrorKind) -> Option<Arc<dyn RecoveryStrategy>> {
        self.lock_strategies().get(&kind).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_emergency_mode(&self) -> bool {
        self.inner.emergency.load(Ordering::SeqCst)
    }

    /// How many errors have been escalated
    pub fn escalation_count(&self) -> usize {
        self.inner.escalations.load(Ordering::SeqCst)
    }

    /// Retry tasks still waiting or running
    pub fn pending_retries(&self) -> usize {
        let mut retries = self.lock_retries();
        retries.retain(|h| !h.is_finished());
        retries.len()
    }

    fn lock_strategies(&self) -> MutexGuard<'_, HashMap<ErrorKind, Arc<dyn RecoveryStrategy>>> {
        self.inner.strategies.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<ErrorRecord>> {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<ErrorKey, u32>> {
        self.inner.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_retries(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<ErrorKey>> {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RecoveryEvent) {
        let _ = self.inner.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Record an error, try to recover it, then check the error rate.
    ///
    /// Returns the record as it stands once this call's recovery attempt
    /// (if any) has finished.
    pub async fn handle_error(
        &self,
        kind: ErrorKind,
        component: &str,
        message: &str,
        severity: Severity,
    ) -> ErrorRecord {
        let record = ErrorRecord::new(kind, component, message, severity);
        let key = record.key();

        self.lock_history().push(record.clone());
        *self.lock_counts().entry(key.clone()).or_insert(0) += 1;

        match severity {
            Severity::High | Severity::Critical => {
                error!(id = %record.id, %kind, %component, %severity, %message, "error reported")
            }
            _ => warn!(id = %record.id, %kind, %component, %severity, %message, "error reported"),
        }
        self.emit(RecoveryEvent::ErrorRecorded {
            id: record.id.clone(),
            kind,
            severity,
        });

        if severity != Severity::Low {
            let claimed = self.lock_in_flight().insert(key.clone());
            if claimed {
                self.recover(record.clone()).await;
            } else {
                debug!(id = %record.id, %key, "recovery already in flight for this key");
            }
        }

        self.check_rate(&key).await;
        self.find(&record.id).unwrap_or(record)
    }

    /// Feed a typed error into the engine
    pub async fn report<E>(&self, component: &str, err: &E) -> ErrorRecord
    where
        E: Classify + Display + Sync,
    {
        let (kind, severity) = err.classify();
        self.handle_error(kind, component, &err.to_string(), severity)
            .await
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn recover(&self, record: ErrorRecord) -> BoxFuture<'_> {
        Box::pin(async move {
            let _gate = self.inner.gate.lock().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                self.release(&record);
                return;
            }

            let Some(strategy) = self.strategy_for(record.kind) else {
                info!(id = %record.id, kind = %record.kind, "no automatic recovery for this kind");
                self.escalate(&record).await;
                self.release(&record);
                return;
            };

            if !strategy.can_attempt(&record) {
                debug!(id = %record.id, attempts = record.attempts, "attempt cap reached");
                self.escalate(&record).await;
                self.release(&record);
                return;
            }

            let attempt = record.attempts + 1;
            info!(
                id = %record.id,
                kind = %record.kind,
                strategy = strategy.name(),
                priority = strategy.priority(),
                attempt,
                "attempting recovery"
            );
            self.emit(RecoveryEvent::RecoveryAttempted {
                id: record.id.clone(),
                kind: record.kind,
                attempt,
            });

            let outcome = strategy.attempt(&record).await;

            if outcome.success {
                self.update(&record.id, |r| {
                    r.recovered = true;
                    r.recovery_duration = Some(outcome.elapsed);
                });
                info!(
                    id = %record.id,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    result = %outcome.message,
                    "recovery succeeded"
                );
                self.emit(RecoveryEvent::Recovered {
                    id: record.id.clone(),
                    kind: record.kind,
                    elapsed: outcome.elapsed,
                });
                self.release(&record);
                self.run_follow_ups(&outcome.follow_ups).await;
                return;
            }

            self.update(&record.id, |r| r.attempts = attempt);
            warn!(id = %record.id, attempt, result = %outcome.message, "recovery failed");

            if attempt < strategy.max_attempts() {
                self.schedule_retry(ErrorRecord {
                    attempts: attempt,
                    ..record
                });
            } else {
                let exhausted = ErrorRecord {
                    attempts: attempt,
                    ..record
                };
                self.escalate(&exhausted).await;
                self.release(&exhausted);
            }
        })
    }

    fn release(&self, record: &ErrorRecord) {
        self.lock_in_flight().remove(&record.key());
    }

    fn schedule_retry(&self, record: ErrorRecord) {
        let delay = self.inner.config.retry_delay;
        debug!(id = %record.id, attempt = record.attempts + 1, ?delay, "retry scheduled");
        self.emit(RecoveryEvent::RetryScheduled {
            id: record.id.clone(),
            attempt: record.attempts + 1,
            delay,
        });

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            engine.recover(record).await;
        });

        let mut retries = self.lock_retries();
        retries.retain(|h| !h.is_finished());
        retries.push(handle);
    }

    async fn escalate(&self, record: &ErrorRecord) {
        let first = self
            .update(&record.id, |r| !std::mem::replace(&mut r.escalated, true))
            .unwrap_or(!record.escalated);
        if !first {
            return;
        }

        self.inner.escalations.fetch_add(1, Ordering::SeqCst);
        error!(
            id = %record.id,
            kind = %record.kind,
            severity = %record.severity,
            attempts = record.attempts,
            "error escalated"
        );
        self.emit(RecoveryEvent::Escalated {
            id: record.id.clone(),
            kind: record.kind,
            severity: record.severity,
        });

        match record.severity {
            Severity::Critical => {
                self.enter_emergency_mode(EmergencyReason::CriticalError {
                    id: record.id.clone(),
                    kind: record.kind,
                })
                .await;
            }
            Severity::High => {
                warn!(id = %record.id, kind = %record.kind, "high priority alert");
                self.emit(RecoveryEvent::HighPriorityAlert {
                    id: record.id.clone(),
                    kind: record.kind,
                    message: record.message.clone(),
                });
            }
            _ => info!(id = %record.id, "escalated error logged"),
        }
    }

    async fn run_follow_ups(&self, actions: &[FollowUpAction]) {
        let c = &self.inner.collaborators;
        let pause = self.inner.config.restart_pause;
        for action in actions {
            if self.is_emergency_mode() && !action.is_essential() {
                info!(?action, "follow-up suspended in emergency mode");
                self.emit(RecoveryEvent::FollowUpSuspended(*action));
                continue;
            }
            debug!(?action, "running follow-up");
            match action {
                FollowUpAction::RestartMessageBus => {
                    if let Err(e) = c.bus.restart(pause).await {
                        warn!(error = %e, "message bus restart failed");
                    }
                }
                FollowUpAction::RestartDiscovery => {
                    c.discovery
                        .restart_discovery(pause, self.inner.config.settle_time)
                        .await;
                }
                FollowUpAction::RestartLocation => {
                    c.location.stop_updates().await;
                    sleep(pause).await;
                    if let Err(e) = c.location.start_updates().await {
                        warn!(error = %e, "location restart failed");
                    }
                }
                FollowUpAction::VerifySubscriptions => {
                    let restored = c.bus.verify_subscriptions().await;
                    debug!(restored, "subscriptions verified");
                }
                FollowUpAction::FreeMemory => {
                    c.bus.release_buffers();
                    c.system.reclaim_memory().await;
                }
                FollowUpAction::CheckStorage => match c.incidents.incident_count().await {
                    Ok(count) => debug!(incidents = count, "storage checked"),
                    Err(e) => warn!(error = %e, "storage check failed"),
                },
                FollowUpAction::ReduceBackgroundWork => c.discovery.stop_discovery().await,
                FollowUpAction::EnablePowerSaving => c.system.enable_power_saving().await,
            }
            self.emit(RecoveryEvent::FollowUpRun(*action));
        }
    }

    // ------------------------------------------------------------------------
    // Emergency mode
    // ------------------------------------------------------------------------

    /// Enter emergency mode: discovery stops and non-essential follow-ups are
    /// suspended until `clear_emergency_mode`. Returns false if already active.
    pub async fn enter_emergency_mode(&self, reason: EmergencyReason) -> bool {
        if self.inner.emergency.swap(true, Ordering::SeqCst) {
            debug!(?reason, "already in emergency mode");
            return false;
        }
        error!(?reason, "entering emergency mode");
        self.inner.collaborators.discovery.stop_discovery().await;
        self.emit(RecoveryEvent::EmergencyModeEntered(reason));
        true
    }

    pub fn clear_emergency_mode(&self) {
        if self.inner.emergency.swap(false, Ordering::SeqCst) {
            info!("emergency mode cleared");
            self.emit(RecoveryEvent::EmergencyModeCleared);
        }
    }

    async fn check_rate(&self, key: &ErrorKey) {
        let count = self.error_rate(key.kind, &key.component);
        if count > self.inner.config.max_errors_per_window {
            warn!(%key, count, "error rate exceeded");
            self.enter_emergency_mode(EmergencyReason::ErrorRate {
                key: key.clone(),
                count,
            })
            .await;
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn update<R>(&self, id: &str, f: impl FnOnce(&mut ErrorRecord) -> R) -> Option<R> {
        self.lock_history().iter_mut().find(|r| r.id == id).map(f)
    }

    pub fn find(&self, id: &str) -> Option<ErrorRecord> {
        self.lock_history().iter().find(|r| r.id == id).cloned()
    }

    /// Errors for `(kind, component)` inside the rolling window
    pub fn error_rate(&self, kind: ErrorKind, component: &str) -> usize {
        self.error_rate_at(kind, component, Utc::now())
    }

    pub fn error_rate_at(&self, kind: ErrorKind, component: &str, now: DateTime<Utc>) -> usize {
        let since = now - span(self.inner.config.error_window);
        self.lock_history()
            .iter()
            .filter(|r| r.kind == kind && r.component == component && r.timestamp > since)
            .count()
    }

    /// Errors counted for `(kind, component)` since the last purge
    pub fn error_count(&self, kind: ErrorKind, component: &str) -> u32 {
        self.lock_counts()
            .get(&ErrorKey::new(kind, component))
            .copied()
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let since = Utc::now() - span(self.inner.config.error_window);
        let history = self.lock_history();
        let total = history.len();
        let recovered = history.iter().filter(|r| r.recovered).count();
        let recovery_rate = if total == 0 {
            0.0
        } else {
            recovered as f64 / total as f64 * 100.0
        };
        ErrorStatistics {
            total,
            recent: history.iter().filter(|r| r.timestamp > since).count(),
            recovered,
            critical: history
                .iter()
                .filter(|r| r.severity == Severity::Critical)
                .count(),
            recovery_rate,
            history: history.iter().rev().cloned().collect(),
        }
    }

    fn filtered(&self, keep: impl Fn(&ErrorRecord) -> bool) -> Vec<ErrorRecord> {
        self.lock_history()
            .iter()
            .rev()
            .filter(|r| keep(r))
            .cloned()
            .collect()
    }

    pub fn errors_by_kind(&self, kind: ErrorKind) -> Vec<ErrorRecord> {
        self.filtered(|r| r.kind == kind)
    }

    pub fn errors_by_component(&self, component: &str) -> Vec<ErrorRecord> {
        self.filtered(|r| r.component == component)
    }

    pub fn errors_by_severity(&self, severity: Severity) -> Vec<ErrorRecord> {
        self.filtered(|r| r.severity == severity)
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
        self.lock_counts().clear();
        self.lock_in_flight().clear();
        info!("error history cleared");
    }

    // ------------------------------------------------------------------------
    // Retention and monitoring
    // ------------------------------------------------------------------------

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Drop records older than the retention period and rebuild the counters
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - span(self.inner.config.retention);
        let mut history = self.lock_history();
        let before = history.len();
        history.retain(|r| r.timestamp >= cutoff);
        let removed = before - history.len();

        let mut counts = self.lock_counts();
        counts.clear();
        for record in history.iter() {
            *counts.entry(record.key()).or_insert(0) += 1;
        }

        if removed > 0 {
            debug!(removed, "expired error records purged");
        }
        removed
    }

    /// One monitor pass: warn on hot keys, then purge. Returns keys over the limit.
    pub fn monitor_pass(&self) -> Vec<ErrorKey> {
        let since = Utc::now() - span(self.inner.config.error_window);
        let mut recent: HashMap<ErrorKey, usize> = HashMap::new();
        for record in self.lock_history().iter().filter(|r| r.timestamp > since) {
            *recent.entry(record.key()).or_insert(0) += 1;
        }

        let mut hot: Vec<ErrorKey> = recent
            .into_iter()
            .filter(|(_, count)| *count > self.inner.config.max_errors_per_window)
            .map(|(key, count)| {
                warn!(%key, count, "high error rate");
                self.emit(RecoveryEvent::RateExceeded {
                    key: key.clone(),
                    count,
                });
                key
            })
            .collect();
        hot.sort();

        self.purge_expired();
        hot
    }

    /// Start the periodic monitor. Idempotent.
    pub fn start_monitor(&self) {
        let mut slot = self.inner.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let period = self.inner.config.monitor_interval;
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let engine = ErrorRecoveryEngine { inner };
                if engine.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                engine.monitor_pass();
            }
        }));
    }

    /// Stop the monitor and cancel pending retries, then wait for them
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let monitor = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let retries: Vec<JoinHandle<()>> = self.lock_retries().drain(..).collect();

        for handle in monitor.into_iter().chain(retries) {
            handle.abort();
            let _ = handle.await;
        }
        info!("recovery engine stopped");
    }
}
