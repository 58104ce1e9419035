//! Reconnection manager (C4, §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::{CoreConfig, RetryPolicy};
use crate::events::{Event, EventBus};
use crate::model::{ConnectionDescriptor, FailureClass, ReconnectAttempt, ReconnectSession, ReconnectState};
use crate::pool::ConnectionPool;
use crate::session::{self, HostKeyVerifier};

/// Classify a raw error's code/message into the buckets §4.4 names. Matching
/// is substring-based on purpose — the underlying `ssh2`/`io` errors don't
/// carry a structured code the way POSIX errno does.
pub fn classify_failure(code: Option<&str>, message: &str) -> FailureClass {
    let haystack = format!("{} {}", code.unwrap_or(""), message).to_lowercase();

    if haystack.contains("econnrefused")
        || haystack.contains("econnreset")
        || haystack.contains("etimedout")
        || haystack.contains("epipe")
        || haystack.contains("enetunreach")
        || haystack.contains("socket")
        || haystack.contains("network")
    {
        return FailureClass::Network;
    }
    if haystack.contains("authentication") || haystack.contains("permission") || haystack.contains("password") || haystack.contains("key") {
        return FailureClass::Authentication;
    }
    if haystack.contains("timeout") {
        return FailureClass::Timeout;
    }
    if haystack.contains("too many") || haystack.contains("limit") || haystack.contains("quota") {
        return FailureClass::Resource;
    }
    FailureClass::Unknown
}

/// `AUTHENTICATION`/`RESOURCE` are non-retryable (§4.4 "Retry policy").
pub fn is_retryable(class: FailureClass) -> bool {
    !matches!(class, FailureClass::Authentication | FailureClass::Resource)
}

/// Whether this failure qualifies for the fast-path fixed-delay retry
/// (§4.4 delay computation, option 1).
fn is_fast_path_code(code: Option<&str>) -> bool {
    matches!(code, Some("ECONNRESET") | Some("EPIPE"))
}

/// Compute the delay before the next reconnect attempt (§4.4). `retry_count`
/// is 1-based (the attempt about to be made). `recent_success_rate` drives
/// the adaptive multiplier and is ignored in `FixedLegacy` mode.
pub fn compute_delay(
    policy: &RetryPolicy,
    retry_count: u32,
    failure_code: Option<&str>,
    recent_success_rate: f64,
) -> Duration {
    match policy {
        RetryPolicy::FixedLegacy { delay } => *delay,
        RetryPolicy::Exponential {
            initial,
            factor,
            max_delay,
            jitter,
            fast_reconnect_max_attempts,
            fast_reconnect_delay,
            adaptive_threshold,
            adaptive_multiplier,
        } => {
            if retry_count <= *fast_reconnect_max_attempts && is_fast_path_code(failure_code) {
                return *fast_reconnect_delay;
            }

            let base_millis = (initial.as_millis() as f64)
                * (*factor as f64).powi(retry_count.saturating_sub(1) as i32);
            let capped = base_millis.min(max_delay.as_millis() as f64);
            let jitter_millis = if jitter.as_millis() == 0 {
                0.0
            } else {
                rand::rng().random_range(0..=jitter.as_millis() as u64) as f64
            };
            let mut total = capped + jitter_millis;

            if recent_success_rate < *adaptive_threshold {
                total *= adaptive_multiplier;
            }

            Duration::from_millis(total.round() as u64)
        }
    }
}

/// Mean delay ignoring jitter, for deterministic tests and documentation —
/// mirrors §8 scenario 3 (`500, 500, 4000, 8000, 16000` ms for retries 1..5
/// under simulated `ECONNRESET`).
pub fn mean_delay_no_jitter(policy: &RetryPolicy, retry_count: u32, failure_code: Option<&str>) -> Duration {
    match policy {
        RetryPolicy::FixedLegacy { delay } => *delay,
        RetryPolicy::Exponential { initial, factor, max_delay, fast_reconnect_max_attempts, fast_reconnect_delay, .. } => {
            if retry_count <= *fast_reconnect_max_attempts && is_fast_path_code(failure_code) {
                return *fast_reconnect_delay;
            }
            let base_millis =
                (initial.as_millis() as f64) * (*factor as f64).powi(retry_count.saturating_sub(1) as i32);
            Duration::from_millis(base_millis.min(max_delay.as_millis() as f64).round() as u64)
        }
    }
}

/// `registerSession` options (§4.4).
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub auto_start: bool,
    pub initial_state: ReconnectState,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self { auto_start: true, initial_state: ReconnectState::Idle }
    }
}

struct Entry {
    state: Mutex<ReconnectSession>,
    descriptor: ConnectionDescriptor,
    /// Guards "at most one in-flight reconnection per session" (§4.4
    /// invariants).
    in_flight: AtomicBool,
    /// The single pending timer, if any — cancelled on drop by
    /// `cancel_pending_reconnect`/`pause`/`manual_reconnect`.
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Drives reconnection for every registered session: schedules delayed
/// retries, executes them against C1/C3, swaps the result into the pool,
/// and reports outcomes on the event bus (§4.4).
pub struct ReconnectManager {
    pool: Arc<ConnectionPool>,
    events: Arc<EventBus>,
    config: CoreConfig,
    verifier: Arc<dyn HostKeyVerifier>,
    entries: DashMap<String, Arc<Entry>>,
}

/// Sanitized, user-facing phrasing for an abandoned session — internal
/// exception text (e.g. "is not a function") must never reach this far
/// (§4.4 "Execute reconnect").
fn sanitize_for_display(class: FailureClass, _raw: &str) -> String {
    match class {
        FailureClass::Authentication => "authentication failed; check credentials".to_string(),
        FailureClass::Resource => "server resource limit reached".to_string(),
        FailureClass::Timeout => "connection timed out".to_string(),
        FailureClass::Network => "network connection lost".to_string(),
        FailureClass::Unknown => "reconnection failed".to_string(),
    }
}

impl ReconnectManager {
    pub fn new(pool: Arc<ConnectionPool>, events: Arc<EventBus>, config: CoreConfig, verifier: Arc<dyn HostKeyVerifier>) -> Arc<Self> {
        Arc::new(Self { pool, events, config, verifier, entries: DashMap::new() })
    }

    /// §4.4 `registerSession`.
    pub fn register_session(self: &Arc<Self>, session_key: impl Into<String>, descriptor: ConnectionDescriptor, opts: RegisterOptions) {
        let session_key = session_key.into();
        let mut reconnect_session = ReconnectSession::new(session_key.clone());
        reconnect_session.state = opts.initial_state;

        let entry = Arc::new(Entry {
            state: Mutex::new(reconnect_session),
            descriptor,
            in_flight: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        self.entries.insert(session_key.clone(), entry);
        self.events.emit(Event::SessionRegistered { session_key: session_key.clone() });

        if opts.auto_start && opts.initial_state == ReconnectState::Pending {
            self.schedule(&session_key, Some("ECONNRESET"));
        }
    }

    /// §4.4 `cancelPendingReconnect`.
    pub fn cancel_pending_reconnect(&self, session_key: &str) {
        if let Some(entry) = self.entries.get(session_key) {
            if let Some(handle) = entry.timer.lock().take() {
                handle.abort();
            }
        }
    }

    /// §4.4 `pause` — abandoned + cancel timer.
    pub fn pause(&self, session_key: &str) {
        self.cancel_pending_reconnect(session_key);
        if let Some(entry) = self.entries.get(session_key) {
            entry.state.lock().state = ReconnectState::Abandoned;
        }
    }

    /// §4.4 `resume` — back to pending + schedule.
    pub fn resume(self: &Arc<Self>, session_key: &str) {
        let should_schedule = if let Some(entry) = self.entries.get(session_key) {
            entry.state.lock().state = ReconnectState::Pending;
            true
        } else {
            false
        };
        if should_schedule {
            self.schedule(session_key, None);
        }
    }

    /// §4.4 `manualReconnect` — reset retryCount, clear intentionalClose,
    /// cancel any pending timer, execute immediately.
    pub fn manual_reconnect(self: &Arc<Self>, session_key: &str) {
        self.cancel_pending_reconnect(session_key);
        if let Some(entry) = self.entries.get(session_key) {
            let mut state = entry.state.lock();
            state.retry_count = 0;
            state.state = ReconnectState::Reconnecting;
        } else {
            return;
        }
        let this = Arc::clone(self);
        let session_key = session_key.to_string();
        tokio::spawn(async move { this.execute_reconnect(&session_key).await });
    }

    /// Same reset as `manual_reconnect`, but awaited in place instead of
    /// spawned, returning whether the session is `Connected` afterwards.
    /// Used by `core::connect` when the pool reports an existing session
    /// unhealthy (§4.2 "Failure semantics": query unhealthy → manualReconnect
    /// → on failure close and create fresh).
    pub async fn manual_reconnect_and_wait(self: &Arc<Self>, session_key: &str) -> bool {
        self.cancel_pending_reconnect(session_key);
        let registered = if let Some(entry) = self.entries.get(session_key) {
            let mut state = entry.state.lock();
            state.retry_count = 0;
            state.state = ReconnectState::Reconnecting;
            true
        } else {
            false
        };
        if !registered {
            return false;
        }

        Arc::clone(self).execute_reconnect(session_key).await;

        self.entries.get(session_key).map(|entry| entry.state.lock().state == ReconnectState::Connected).unwrap_or(false)
    }

    /// Schedule a delayed reconnect attempt, honoring the "at most one
    /// pending timer per session" invariant by replacing any existing one.
    fn schedule(self: &Arc<Self>, session_key: &str, failure_code: Option<&str>) {
        let Some(entry) = self.entries.get(session_key).map(|e| e.clone()) else { return };

        let (retry_count, success_rate) = {
            let mut state = entry.state.lock();
            state.state = ReconnectState::Pending;
            (state.retry_count + 1, state.recent_success_rate)
        };

        let delay = compute_delay(&self.config.retry_policy, retry_count, failure_code, success_rate);
        log::debug!("scheduling reconnect for {session_key} in {delay:?} (attempt {retry_count})");
        self.events.emit(Event::ReconnectScheduled {
            session_key: session_key.to_string(),
            delay,
            retry_count,
            max_retries: self.config.max_retries,
        });

        let this = Arc::clone(self);
        let key = session_key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.execute_reconnect(&key).await;
        });
        *entry.timer.lock() = Some(handle);
    }

    /// §4.4 "Execute reconnect".
    async fn execute_reconnect(self: Arc<Self>, session_key: &str) {
        let Some(entry) = self.entries.get(session_key).map(|e| e.clone()) else { return };
        if entry.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = entry.state.lock();
            state.state = ReconnectState::Reconnecting;
            state.last_attempt = Some(Instant::now());
        }
        let retry_count = entry.state.lock().retry_count.max(1);
        self.events.emit(Event::ReconnectStarted { session_key: session_key.to_string(), retry_count });

        let descriptor = entry.descriptor.clone();
        let config = self.config.clone();
        let verifier = Arc::clone(&self.verifier);
        let validation_timeout = self.config.reconnect_validation_timeout;
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || -> Result<ssh2::Session, (String, String)> {
            let established = session::establish(&descriptor, &config, verifier.as_ref())
                .map_err(|err| (err.to_string(), format!("{err:?}")))?;
            session::validate_with_echo(&established.session, validation_timeout)
                .map_err(|err| (err.to_string(), format!("{err:?}")))?;
            Ok(established.session)
        })
        .await;

        entry.in_flight.store(false, Ordering::SeqCst);
        let duration = started.elapsed();

        match outcome {
            Ok(Ok(new_transport)) => {
                log::info!("reconnected session {session_key} after {duration:?}");
                let using_proxy = entry.descriptor.proxy.is_some();
                let generation = self.pool.swap_transport(session_key, new_transport, using_proxy).unwrap_or_default();

                let attempts = {
                    let mut state = entry.state.lock();
                    state.retry_count = 0;
                    state.state = ReconnectState::Connected;
                    state.last_error = None;
                    state.generation = generation;
                    let attempts = state.history.len() as u32 + 1;
                    state.push_history(ReconnectAttempt {
                        timestamp: Instant::now(),
                        success: true,
                        attempts,
                        duration: Some(duration),
                        error: None,
                    });
                    attempts
                };

                self.cancel_pending_reconnect(session_key);
                self.events.emit(Event::ConnectionReplaced { session_key: session_key.to_string(), generation });
                self.events.emit(Event::ReconnectSuccess { session_key: session_key.to_string(), attempts });
            }
            Ok(Err((message, _debug))) => self.handle_failure(&entry, session_key, message, duration),
            Err(join_error) => {
                self.handle_failure(&entry, session_key, format!("reconnect task did not complete: {join_error}"), duration)
            }
        }
    }

    /// Record the failed attempt, decide whether to retry or abandon, and
    /// emit the matching event (§4.4 "Execute reconnect", "Retry policy").
    fn handle_failure(self: &Arc<Self>, entry: &Entry, session_key: &str, message: String, duration: Duration) {
        let class = classify_failure(None, &message);
        log::warn!("reconnect attempt for {session_key} failed after {duration:?}: {message}");

        let retry_count = {
            let mut state = entry.state.lock();
            let attempts = state.history.len() as u32 + 1;
            state.push_history(ReconnectAttempt {
                timestamp: Instant::now(),
                success: false,
                attempts,
                duration: Some(duration),
                error: Some(message.clone()),
            });
            state.last_error = Some(message.clone());
            state.retry_count
        };

        let max_retries = self.config.max_retries;
        let should_retry = is_retryable(class) && retry_count < max_retries;

        if should_retry {
            entry.state.lock().retry_count = retry_count + 1;
            self.schedule(session_key, classify_failure_code(&message));
            return;
        }

        entry.state.lock().state = ReconnectState::Abandoned;
        log::error!("abandoning reconnect for {session_key} after {retry_count} attempts");
        let sanitized = sanitize_for_display(class, &message);
        self.events.emit(Event::ReconnectFailed {
            session_key: session_key.to_string(),
            error: sanitized,
            attempts: retry_count,
            max_retries,
        });
        self.events.emit(Event::ReconnectAbandoned { session_key: session_key.to_string() });
    }
}

/// Best-effort recovery of a POSIX-style error code token embedded in a
/// message, for the fast-path retry check (§4.4 delay computation).
fn classify_failure_code(message: &str) -> Option<&'static str> {
    let upper = message.to_uppercase();
    if upper.contains("ECONNRESET") {
        Some("ECONNRESET")
    } else if upper.contains("EPIPE") {
        Some("EPIPE")
    } else {
        None
    }
}
