//! Checkout session orchestration
//!
//! A [`CheckoutSession`] is created once per browser tab (or CLI run) and
//! drives one identification cycle at a time:
//!
//! | Phase | Entered when | Exits to |
//! |-------|--------------|----------|
//! | initial | session start, nothing cached | initializing / collecting |
//! | collecting | signal collection requested | processing, error |
//! | processing | signals obtained | sending |
//! | sending | store request issued | stored, error |
//! | stored | store response received | identifying |
//! | identifying | identify request issued | complete, error |
//! | complete | identify response received | terminal |
//! | error | any failure | terminal until reset |
//!
//! Every reset bumps a generation counter. Requests capture the generation
//! before they suspend and discard their result if it changed, so a response
//! that lands after a reset never touches the new cycle.

pub mod cookies;
mod phase;
pub mod storage;

pub use cookies::CookieJar;
pub use phase::ProcessingPhase;
pub use storage::{MemoryStorage, SessionStorage};

use crate::api::{is_empty_payload, BackendData, IdentifyResponse, StoreResponse};
use crate::bridge::{
    BridgeError, BridgeHandle, CollectedSignals, STATUS_COLLECTING, STATUS_INITIALIZING,
};
use crate::client::{RelayBackend, RelayClientError};
use crate::context::IDENTIFICATION_COOKIE;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Relay(#[from] RelayClientError),

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition {
        from: ProcessingPhase,
        to: ProcessingPhase,
    },

    #[error("Session was reset while the request was in flight")]
    Superseded,
}

/// Everything the session has learned in the current cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionRecord {
    pub signal_payload: Option<Value>,
    pub collect_latency_ms: Option<f64>,
    pub load_latency_ms: Option<f64>,
    /// Agent load start to end of collection, as measured by the collector
    pub total_latency_ms: Option<f64>,
    /// Round trip of the store call
    pub backend_storage_latency_ms: Option<f64>,
    /// Store handler time as reported by the relay
    pub server_storage_latency_ms: Option<f64>,
    /// Round trip of the identify call
    pub identification_latency_ms: Option<f64>,
    /// Store round trip plus identify round trip
    pub backend_latency_ms: Option<f64>,
    pub visitor_id: Option<String>,
    pub request_id: Option<String>,
    pub botd: Option<Value>,
    /// Store endpoint's record, echoed back for identification
    #[serde(skip)]
    pub stored: Option<BackendData>,
}

impl SessionRecord {
    /// Signal collection plus both backend legs
    pub fn end_to_end_latency_ms(&self) -> Option<f64> {
        Some(self.collect_latency_ms? + self.backend_latency_ms?)
    }
}

/// Point-in-time view for presentation
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub phase: ProcessingPhase,
    pub record: SessionRecord,
    pub error: Option<String>,
}

/// Handle returned by [`CheckoutSession::register_reset_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type ResetObserver = Arc<dyn Fn() + Send + Sync>;

struct SessionState {
    phase: ProcessingPhase,
    record: SessionRecord,
    error: Option<String>,
    generation: u64,
}

pub struct CheckoutSession {
    bridge: BridgeHandle,
    backend: Arc<dyn RelayBackend>,
    storage: Arc<dyn SessionStorage>,
    cookies: CookieJar,
    state: Mutex<SessionState>,
    observers: Mutex<Vec<(ObserverId, ResetObserver)>>,
    next_observer: AtomicU64,
}

impl CheckoutSession {
    /// Create a session, resuming whatever `storage` holds from an earlier page
    pub fn new(
        bridge: BridgeHandle,
        backend: Arc<dyn RelayBackend>,
        storage: Arc<dyn SessionStorage>,
        cookies: CookieJar,
    ) -> Self {
        let (record, phase) = storage::load_record(storage.as_ref());
        let phase = resume_phase(phase, &record);
        if phase != ProcessingPhase::Initial {
            info!(%phase, "Resuming checkout session from storage");
        }

        Self {
            bridge,
            backend,
            storage,
            cookies,
            state: Mutex::new(SessionState {
                phase,
                record,
                error: None,
                generation: 0,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            phase: state.phase,
            record: state.record.clone(),
            error: state.error.clone(),
        }
    }

    pub fn phase(&self) -> ProcessingPhase {
        self.state().phase
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Move to `next` and return the current generation
    fn begin(&self, next: ProcessingPhase) -> Result<u64, SessionError> {
        let mut state = self.state();
        if !state.phase.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: state.phase,
                to: next,
            });
        }
        state.phase = next;
        Ok(state.generation)
    }

    /// Lock the state for a request started in `generation`, unless a reset intervened
    fn resume(&self, generation: u64) -> Result<MutexGuard<'_, SessionState>, SessionError> {
        let state = self.state();
        if state.generation != generation {
            debug!(generation, current = state.generation, "Discarding stale response");
            return Err(SessionError::Superseded);
        }
        Ok(state)
    }

    fn fail<E: Into<SessionError>>(state: &mut SessionState, error: E) -> SessionError {
        let error = error.into();
        warn!(phase = %state.phase, error = %error, "Checkout session failed");
        state.phase = ProcessingPhase::Error;
        state.error = Some(error.to_string());
        error
    }

    fn on_collector_status(&self, generation: u64, status: &str) {
        let next = match status {
            STATUS_INITIALIZING => ProcessingPhase::Initializing,
            STATUS_COLLECTING => ProcessingPhase::Collecting,
            _ => return,
        };
        let mut state = self.state();
        if state.generation == generation && state.phase.can_transition_to(next) {
            state.phase = next;
        }
    }

    /// Gather signals through the collector bridge
    pub async fn collect(&self) -> Result<CollectedSignals, SessionError> {
        let generation = self.begin(ProcessingPhase::Collecting)?;

        let result = self
            .bridge
            .collect(|status| self.on_collector_status(generation, status))
            .await;

        let mut state = self.resume(generation)?;
        let signals = match result {
            Ok(signals) => signals,
            Err(e) => return Err(Self::fail(&mut state, e)),
        };

        state.record.signal_payload = Some(signals.browser_data.clone());
        state.record.collect_latency_ms = Some(signals.collect_latency);
        state.record.load_latency_ms = Some(signals.load_latency);
        state.record.total_latency_ms = Some(signals.total_latency);
        state.phase = ProcessingPhase::Processing;
        storage::persist_record(self.storage.as_ref(), &state.record, state.phase);

        info!(
            collect_latency_ms = signals.collect_latency,
            load_latency_ms = signals.load_latency,
            "Browser signals collected"
        );
        Ok(signals)
    }

    /// Store signals with the relay. Uses `payload` if given, otherwise the
    /// collected one; with neither, returns `Ok(None)` without a request.
    pub async fn send_to_backend(
        &self,
        payload: Option<Value>,
    ) -> Result<Option<StoreResponse>, SessionError> {
        let (generation, payload) = {
            let mut state = self.state();
            let payload = payload
                .or_else(|| state.record.signal_payload.clone())
                .filter(|p| !is_empty_payload(p));
            let Some(payload) = payload else {
                debug!("No browser data available to send");
                return Ok(None);
            };
            if !state.phase.can_transition_to(ProcessingPhase::Sending) {
                return Err(SessionError::InvalidTransition {
                    from: state.phase,
                    to: ProcessingPhase::Sending,
                });
            }
            state.phase = ProcessingPhase::Sending;
            (state.generation, payload)
        };

        let cookie = self.cookies.get(IDENTIFICATION_COOKIE);
        let start = Instant::now();
        let result = self.backend.store(&payload, cookie.as_deref()).await;
        let latency = elapsed_ms(start);

        let mut state = self.resume(generation)?;
        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(Self::fail(&mut state, e)),
        };

        let record = &mut state.record;
        record.signal_payload = Some(payload);
        record.backend_storage_latency_ms = Some(latency);
        record.server_storage_latency_ms = Some(response.backend_latency);
        record.backend_latency_ms = Some(latency);
        record.stored = Some(BackendData {
            collected_data: Some(response.collected_data.clone()),
            backend_latency: Some(response.backend_latency),
        });
        state.phase = ProcessingPhase::Stored;
        storage::persist_record(self.storage.as_ref(), &state.record, state.phase);

        info!(
            storage_latency_ms = latency,
            server_latency_ms = response.backend_latency,
            "Signals stored"
        );
        Ok(Some(response))
    }

    /// Identify the stored record. Returns `Ok(None)` without a request when
    /// nothing has been stored yet.
    pub async fn complete_identification(&self) -> Result<Option<IdentifyResponse>, SessionError> {
        let (generation, stored) = {
            let mut state = self.state();
            let Some(stored) = state.record.stored.clone() else {
                debug!("No stored record to identify");
                return Ok(None);
            };
            if !state.phase.can_transition_to(ProcessingPhase::Identifying) {
                return Err(SessionError::InvalidTransition {
                    from: state.phase,
                    to: ProcessingPhase::Identifying,
                });
            }
            state.phase = ProcessingPhase::Identifying;
            (state.generation, stored)
        };

        let cookie = self.cookies.get(IDENTIFICATION_COOKIE);
        let start = Instant::now();
        let result = self.backend.identify(&stored, cookie.as_deref()).await;
        let latency = elapsed_ms(start);

        let outcome = {
            let mut state = self.resume(generation)?;
            match result {
                Ok(outcome) => outcome,
                Err(e) => return Err(Self::fail(&mut state, e)),
            }
        };

        for cookie in &outcome.set_cookies {
            self.cookies.absorb_set_cookie(cookie);
        }

        // The agent must see follow-up instructions before the cycle completes
        if let Some(agent_data) = outcome.response.agent_data.clone() {
            if let Err(e) = self.bridge.handle_agent_data(agent_data).await {
                warn!(error = %e, "Collector could not apply agent data");
            }
        }

        let mut state = self.resume(generation)?;
        let record = &mut state.record;
        record.identification_latency_ms = Some(latency);
        record.backend_latency_ms = Some(record.backend_storage_latency_ms.unwrap_or(0.0) + latency);
        if record.visitor_id.is_none() {
            record.visitor_id = outcome.response.visitor_id.clone();
        }
        record.request_id = outcome.response.request_id.clone();
        record.botd = outcome.response.botd.clone();
        state.phase = ProcessingPhase::Complete;
        storage::persist_record(self.storage.as_ref(), &state.record, state.phase);

        info!(
            visitor_id = ?state.record.visitor_id,
            identification_latency_ms = latency,
            "Identification complete"
        );
        Ok(Some(outcome.response))
    }

    /// Call `observer` after every reset. Observers run in registration order.
    pub fn register_reset_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    pub fn unregister_reset_observer(&self, id: ObserverId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn notify_reset_observers(&self) {
        let observers: Vec<ResetObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for (index, observer) in observers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| observer())).is_err() {
                warn!(index, "Reset observer panicked");
            }
        }
    }

    /// Wipe the session and start a fresh collection cycle
    pub async fn reset_environment(&self) -> Result<CollectedSignals, SessionError> {
        {
            let mut state = self.state();
            storage::clear_record(self.storage.as_ref());
            self.cookies.clear_identification();
            state.record = SessionRecord::default();
            state.phase = ProcessingPhase::Initial;
            state.error = None;
            state.generation += 1;
            info!(generation = state.generation, "Checkout session reset");
        }

        self.notify_reset_observers();

        match self.backend.clear().await {
            Ok(set_cookies) => {
                for cookie in &set_cookies {
                    self.cookies.absorb_set_cookie(cookie);
                }
            }
            Err(e) => warn!(error = %e, "Failed to clear identification data on the relay"),
        }

        if let Err(e) = self.bridge.reset().await {
            warn!(error = %e, "Collector reset failed");
        }

        self.collect().await
    }
}

/// A persisted in-flight phase means the page went away mid-request; fall
/// back to the last phase whose data survived.
fn resume_phase(phase: ProcessingPhase, record: &SessionRecord) -> ProcessingPhase {
    let has_payload = record
        .signal_payload
        .as_ref()
        .map_or(false, |p| !is_empty_payload(p));

    match phase {
        // The stored record itself is not persisted, so identification
        // cannot pick up where it left off
        ProcessingPhase::Stored | ProcessingPhase::Sending | ProcessingPhase::Identifying
            if has_payload =>
        {
            ProcessingPhase::Processing
        }
        ProcessingPhase::Error => ProcessingPhase::Initial,
        p if p.is_in_flight() || (!has_payload && p != ProcessingPhase::Complete) => {
            ProcessingPhase::Initial
        }
        p => p,
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod flow_tests;
