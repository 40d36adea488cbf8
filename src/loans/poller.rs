use crate::error::{AppError, ErrorReport};
use crate::loans::backend::LoanBackend;
use crate::loans::types::{EmptyResultPolicy, LoanRecord, PollSnapshot, PollerConfig, PollerState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How one fetch session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Applied {
        sequence: u64,
        attempts: u32,
        records: usize,
    },
    /// A newer session resolved first; nothing was written.
    Stale { sequence: u64, attempts: u32 },
    Failed {
        sequence: u64,
        attempts: u32,
        error: ErrorReport,
    },
    /// The poller was stopped while the session was in flight.
    Discarded { sequence: u64, attempts: u32 },
}

impl FetchOutcome {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Applied { sequence, .. }
            | Self::Stale { sequence, .. }
            | Self::Failed { sequence, .. }
            | Self::Discarded { sequence, .. } => *sequence,
        }
    }
}

struct TimerHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

struct Lifecycle {
    state: PollerState,
    timer: Option<TimerHandle>,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancellation_token.cancel();
        }
    }
}

struct PollerShared {
    backend: Arc<dyn LoanBackend>,
    config: PollerConfig,
    next_sequence: AtomicU64,
    updates: watch::Sender<PollSnapshot>,
}

/// Keeps the authoritative loan list in sync with the backend: one fetch on
/// start, then one per interval tick, plus out-of-band refreshes.
///
/// Every session takes a sequence number when it starts. A resolution is only
/// written if no session with a higher number has been written already, and
/// only while the cancellation token it captured at start is still live.
#[derive(Clone)]
pub struct Poller {
    shared: Arc<PollerShared>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl Poller {
    pub fn new(backend: Arc<dyn LoanBackend>, config: PollerConfig) -> Self {
        let (updates, _) = watch::channel(PollSnapshot::idle());
        Self {
            shared: Arc::new(PollerShared {
                backend,
                config,
                next_sequence: AtomicU64::new(0),
                updates,
            }),
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: PollerState::Idle,
                timer: None,
            })),
        }
    }

    pub fn state(&self) -> PollerState {
        self.lifecycle.lock().state
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.shared.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Returns `false` when the poller was already running.
    pub fn start(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == PollerState::Running {
            return false;
        }

        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_timer(
            Arc::clone(&self.shared),
            cancellation_token.clone(),
        ));
        lifecycle.timer = Some(TimerHandle {
            cancellation_token,
            join_handle,
        });
        lifecycle.state = PollerState::Running;
        self.shared.publish_state(PollerState::Running);

        info!(
            interval_ms = self.shared.config.poll_interval.as_millis() as u64,
            "loan poller started"
        );
        true
    }

    /// Returns `false` when the poller was not running.
    pub async fn stop(&self) -> bool {
        let timer = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != PollerState::Running {
                return false;
            }
            lifecycle.state = PollerState::Stopped;
            let timer = lifecycle.timer.take();
            if let Some(timer) = &timer {
                timer.cancellation_token.cancel();
            }
            timer
        };
        self.shared.publish_state(PollerState::Stopped);

        if let Some(timer) = timer {
            let _ = timer.join_handle.await;
        }
        info!("loan poller stopped");
        true
    }

    /// Spawns a fetch session outside the timer cadence. No-op unless running.
    pub fn refresh_now(&self) -> Option<JoinHandle<FetchOutcome>> {
        let cancel_token = self.active_token()?;
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(async move {
            shared.run_session(&cancel_token).await
        }))
    }

    /// Runs a fetch session inline. No-op unless running.
    pub async fn refresh(&self) -> Option<FetchOutcome> {
        let cancel_token = self.active_token()?;
        Some(self.shared.run_session(&cancel_token).await)
    }

    fn active_token(&self) -> Option<CancellationToken> {
        let lifecycle = self.lifecycle.lock();
        match (lifecycle.state, &lifecycle.timer) {
            (PollerState::Running, Some(timer)) => Some(timer.cancellation_token.clone()),
            (state, _) => {
                debug!(state = state.as_str(), "refresh ignored, poller not running");
                None
            }
        }
    }
}

async fn run_timer(shared: Arc<PollerShared>, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let session_shared = Arc::clone(&shared);
                let session_token = cancel_token.clone();
                tokio::spawn(async move {
                    session_shared.run_session(&session_token).await;
                });
            }
        }
    }
}

impl PollerShared {
    async fn run_session(&self, cancel_token: &CancellationToken) -> FetchOutcome {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = 0_u32;
        debug!(sequence, "fetch session started");

        loop {
            if cancel_token.is_cancelled() {
                return discard(sequence, attempts);
            }

            attempts += 1;
            let result = self
                .backend
                .fetch_loans()
                .await
                .and_then(|records| self.check_empty(records));

            if cancel_token.is_cancelled() {
                return discard(sequence, attempts);
            }

            match result {
                Ok(records) => {
                    return self.apply_success(cancel_token, sequence, attempts, records)
                }
                Err(error) if error.is_transient() && attempts < max_attempts => {
                    warn!(sequence, attempt = attempts, %error, "transient fetch failure, retrying");
                    tokio::select! {
                        _ = cancel_token.cancelled() => return discard(sequence, attempts),
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(error) => {
                    return self.apply_failure(cancel_token, sequence, attempts, &error)
                }
            }
        }
    }

    fn check_empty(&self, records: Vec<LoanRecord>) -> Result<Vec<LoanRecord>, AppError> {
        if records.is_empty() && self.config.empty_result_policy == EmptyResultPolicy::Retry {
            return Err(AppError::ServiceUnavailable(
                "backend returned no loans".to_string(),
            ));
        }
        Ok(records)
    }

    /// The cancellation check runs under the snapshot's write lock, so a
    /// result can never land after `stop()` has published `Stopped`.
    fn apply_success(
        &self,
        cancel_token: &CancellationToken,
        sequence: u64,
        attempts: u32,
        records: Vec<LoanRecord>,
    ) -> FetchOutcome {
        let count = records.len();
        let records = Arc::new(records);
        let mut cancelled = false;
        let applied = self.updates.send_if_modified(|snapshot| {
            if cancel_token.is_cancelled() {
                cancelled = true;
                return false;
            }
            if is_superseded(snapshot.resolved_sequence, sequence) {
                return false;
            }
            snapshot.records = records;
            snapshot.resolved_sequence = Some(sequence);
            snapshot.error = None;
            snapshot.last_success_ms = Some(now_unix_ms());
            true
        });

        if cancelled {
            return discard(sequence, attempts);
        }
        if applied {
            info!(sequence, attempts, records = count, "loan records refreshed");
            FetchOutcome::Applied {
                sequence,
                attempts,
                records: count,
            }
        } else {
            debug!(sequence, "stale fetch result dropped");
            FetchOutcome::Stale { sequence, attempts }
        }
    }

    /// Terminal failures replace the current error but keep the last good
    /// record set on display.
    fn apply_failure(
        &self,
        cancel_token: &CancellationToken,
        sequence: u64,
        attempts: u32,
        error: &AppError,
    ) -> FetchOutcome {
        let report = error.report();
        let stored = report.clone();
        let mut cancelled = false;
        let applied = self.updates.send_if_modified(|snapshot| {
            if cancel_token.is_cancelled() {
                cancelled = true;
                return false;
            }
            if is_superseded(snapshot.resolved_sequence, sequence) {
                return false;
            }
            snapshot.resolved_sequence = Some(sequence);
            snapshot.error = Some(stored);
            true
        });

        if cancelled {
            return discard(sequence, attempts);
        }
        if applied {
            warn!(sequence, attempts, %error, "loan refresh failed");
            FetchOutcome::Failed {
                sequence,
                attempts,
                error: report,
            }
        } else {
            debug!(sequence, %error, "stale fetch failure dropped");
            FetchOutcome::Stale { sequence, attempts }
        }
    }

    fn publish_state(&self, state: PollerState) {
        self.updates.send_modify(|snapshot| snapshot.state = state);
    }
}

fn discard(sequence: u64, attempts: u32) -> FetchOutcome {
    debug!(sequence, attempts, "poller stopped, fetch result discarded");
    FetchOutcome::Discarded { sequence, attempts }
}

fn is_superseded(resolved_sequence: Option<u64>, sequence: u64) -> bool {
    resolved_sequence.is_some_and(|resolved| sequence < resolved)
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::loans::testing::{loan, ScriptedBackend, ScriptedFetch};
    use std::time::Duration;

    fn poller_with(backend: &Arc<ScriptedBackend>, config: PollerConfig) -> Poller {
        let backend: Arc<dyn LoanBackend> = backend.clone();
        Poller::new(backend, config)
    }

    #[test]
    fn newer_resolution_supersedes_older_sequence() {
        assert!(!is_superseded(None, 1));
        assert!(!is_superseded(Some(3), 3));
        assert!(!is_superseded(Some(3), 4));
        assert!(is_superseded(Some(3), 2));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_transient_failures_make_exactly_four_attempts() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        let poller = poller_with(&backend, PollerConfig::default());

        let outcome = poller
            .shared
            .run_session(&CancellationToken::new())
            .await;

        assert!(matches!(
            outcome,
            FetchOutcome::Failed { sequence: 1, attempts: 4, ref error }
                if error.kind == ErrorKind::TransientService
        ));
        assert_eq!(backend.fetch_calls(), 4);
        let snapshot = poller.snapshot();
        assert_eq!(
            snapshot.error.map(|error| error.kind),
            Some(ErrorKind::TransientService)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_between_attempts_and_recover() {
        let records = vec![loan(1, "fUSD", 0.02)];
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(records.clone())));
        backend.push(Duration::ZERO, ScriptedFetch::Unavailable);
        backend.push(Duration::ZERO, ScriptedFetch::Unavailable);
        let poller = poller_with(&backend, PollerConfig::default());

        let started = tokio::time::Instant::now();
        let outcome = poller
            .shared
            .run_session(&CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            FetchOutcome::Applied {
                sequence: 1,
                attempts: 3,
                records: 1
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(5));
        let snapshot = poller.snapshot();
        assert_eq!(*snapshot.records, records);
        assert!(snapshot.error.is_none());
        assert!(snapshot.last_success_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_is_not_retried_and_keeps_last_good_records() {
        let records = vec![loan(1, "fUSD", 0.02)];
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unauthorized));
        backend.push(Duration::ZERO, ScriptedFetch::Records(records.clone()));
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();

        poller.shared.run_session(&token).await;
        let outcome = poller.shared.run_session(&token).await;

        assert!(matches!(
            outcome,
            FetchOutcome::Failed { sequence: 2, attempts: 1, ref error }
                if error.kind == ErrorKind::Authorization
        ));
        assert_eq!(backend.fetch_calls(), 2);
        let snapshot = poller.snapshot();
        assert_eq!(*snapshot.records, records);
        assert_eq!(snapshot.resolved_sequence, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_older_session_cannot_overwrite_newer_result() {
        let older = vec![loan(1, "fUSD", 0.02)];
        let newer = vec![loan(2, "fBTC", 0.05)];
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        backend.push(Duration::from_secs(5), ScriptedFetch::Records(older));
        backend.push(Duration::from_secs(1), ScriptedFetch::Records(newer.clone()));
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();

        let (first, second) = tokio::join!(
            poller.shared.run_session(&token),
            poller.shared.run_session(&token)
        );

        assert_eq!(first, FetchOutcome::Stale { sequence: 1, attempts: 1 });
        assert_eq!(
            second,
            FetchOutcome::Applied {
                sequence: 2,
                attempts: 1,
                records: 1
            }
        );
        let snapshot = poller.snapshot();
        assert_eq!(*snapshot.records, newer);
        assert_eq!(snapshot.resolved_sequence, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_older_failure_does_not_replace_newer_success() {
        let newer = vec![loan(2, "fBTC", 0.05)];
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        backend.push(Duration::from_secs(5), ScriptedFetch::Unauthorized);
        backend.push(Duration::from_secs(1), ScriptedFetch::Records(newer));
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();

        let (first, _) = tokio::join!(
            poller.shared.run_session(&token),
            poller.shared.run_session(&token)
        );

        assert_eq!(first, FetchOutcome::Stale { sequence: 1, attempts: 1 });
        assert!(poller.snapshot().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_session_discards_late_response() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        backend.push(
            Duration::from_secs(3),
            ScriptedFetch::Records(vec![loan(1, "fUSD", 0.02)]),
        );
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();

        let session_shared = Arc::clone(&poller.shared);
        let session_token = token.clone();
        let session =
            tokio::spawn(async move { session_shared.run_session(&session_token).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let outcome = session.await.expect("session task should not panic");
        assert_eq!(outcome, FetchOutcome::Discarded { sequence: 1, attempts: 1 });
        let snapshot = poller.snapshot();
        assert!(snapshot.records.is_empty());
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.resolved_sequence, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_retry_delay_stops_the_chain() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();

        let session_shared = Arc::clone(&poller.shared);
        let session_token = token.clone();
        let session =
            tokio::spawn(async move { session_shared.run_session(&session_token).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();

        let outcome = session.await.expect("session task should not panic");
        assert_eq!(outcome, FetchOutcome::Discarded { sequence: 1, attempts: 1 });
        assert_eq!(backend.fetch_calls(), 1);
        assert!(poller.snapshot().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_result_follows_policy() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(Vec::new())));
        let retrying = poller_with(&backend, PollerConfig::default());
        let outcome = retrying
            .shared
            .run_session(&CancellationToken::new())
            .await;
        assert!(matches!(outcome, FetchOutcome::Failed { attempts: 4, .. }));

        let accepting = poller_with(
            &backend,
            PollerConfig {
                empty_result_policy: EmptyResultPolicy::Accept,
                ..PollerConfig::default()
            },
        );
        let outcome = accepting
            .shared
            .run_session(&CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            FetchOutcome::Applied {
                sequence: 1,
                attempts: 1,
                records: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_fetches_immediately_then_on_interval() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(vec![loan(
            1, "fUSD", 0.02,
        )])));
        let poller = poller_with(&backend, PollerConfig::default());

        assert!(poller.start());
        assert!(!poller.start());
        assert_eq!(poller.state(), PollerState::Running);

        let mut updates = poller.subscribe();
        updates
            .wait_for(|snapshot| snapshot.resolved_sequence == Some(1))
            .await
            .expect("poller should publish the first fetch");
        assert_eq!(backend.fetch_calls(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(backend.fetch_calls(), 2);

        assert!(poller.stop().await);
        assert!(!poller.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_now_runs_out_of_band_only_while_running() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(vec![loan(
            1, "fUSD", 0.02,
        )])));
        let poller = poller_with(&backend, PollerConfig::default());
        assert!(poller.refresh_now().is_none());

        poller.start();
        let mut updates = poller.subscribe();
        updates
            .wait_for(|snapshot| snapshot.resolved_sequence == Some(1))
            .await
            .expect("poller should publish the first fetch");

        let outcome = poller
            .refresh_now()
            .expect("running poller should accept a refresh")
            .await
            .expect("refresh task should not panic");
        assert_eq!(outcome.sequence(), 2);
        assert_eq!(backend.fetch_calls(), 2);

        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Stopped);
        assert!(poller.refresh().await.is_none());
        assert_eq!(poller.snapshot().state, PollerState::Stopped);
        assert_eq!(poller.snapshot().records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_cadence_after_failure_and_out_of_band_refresh() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(vec![loan(
            1, "fUSD", 0.02,
        )])));
        backend.push(Duration::ZERO, ScriptedFetch::Unauthorized);
        backend.push(Duration::ZERO, ScriptedFetch::Unauthorized);
        let poller = poller_with(&backend, PollerConfig::default());

        poller.start();
        let mut updates = poller.subscribe();
        updates
            .wait_for(|snapshot| snapshot.resolved_sequence == Some(1))
            .await
            .expect("poller should publish the first fetch");
        assert_eq!(
            poller.snapshot().error.map(|error| error.kind),
            Some(ErrorKind::Authorization)
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        let outcome = poller
            .refresh_now()
            .expect("running poller should accept a refresh")
            .await
            .expect("refresh task should not panic");
        assert!(matches!(outcome, FetchOutcome::Failed { sequence: 2, .. }));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.fetch_calls(), 3);
        let snapshot = poller.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.resolved_sequence, Some(3));

        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(backend.fetch_calls(), 3);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.fetch_calls(), 4);

        poller.stop().await;
    }

    #[test]
    fn cancelled_session_never_writes_its_result() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        let poller = poller_with(&backend, PollerConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let applied = poller
            .shared
            .apply_success(&token, 1, 1, vec![loan(1, "fUSD", 0.02)]);
        let failed = poller
            .shared
            .apply_failure(&token, 2, 1, &AppError::Unauthorized);

        assert_eq!(applied, FetchOutcome::Discarded { sequence: 1, attempts: 1 });
        assert_eq!(failed, FetchOutcome::Discarded { sequence: 2, attempts: 1 });
        let snapshot = poller.snapshot();
        assert!(snapshot.records.is_empty());
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.resolved_sequence, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_makes_in_flight_session_inert() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Unavailable));
        backend.push(
            Duration::from_secs(5),
            ScriptedFetch::Records(vec![loan(1, "fUSD", 0.02)]),
        );
        let poller = poller_with(&backend, PollerConfig::default());

        poller.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.fetch_calls(), 1);
        poller.stop().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = poller.snapshot();
        assert!(snapshot.records.is_empty());
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.state, PollerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_uses_fresh_token() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedFetch::Records(vec![loan(
            3, "fUSD", 0.02,
        )])));
        let poller = poller_with(&backend, PollerConfig::default());

        poller.start();
        poller.stop().await;
        assert!(poller.start());

        let outcome = poller.refresh().await.expect("restarted poller should refresh");
        assert!(matches!(outcome, FetchOutcome::Applied { .. } | FetchOutcome::Stale { .. }));
        poller.stop().await;
    }
}
