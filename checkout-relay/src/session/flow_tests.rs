//! End-to-end session flows against an in-process collector and relay

use super::storage::{self, SESSION_KEYS};
use super::*;
use crate::api::{CollectedData, IdentifyResponse};
use crate::bridge::tests::ScriptedCollector;
use crate::bridge::{CollectorError, SignalCollector};
use crate::client::IdentifyOutcome;
use crate::context::ClientRequestContext;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Default)]
struct MockRelay {
    store_calls: AtomicUsize,
    identify_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    identify_gate: Mutex<Option<oneshot::Receiver<()>>>,
    fail_identify: bool,
}

#[async_trait]
impl RelayBackend for MockRelay {
    async fn store(
        &self,
        payload: &Value,
        _cookie: Option<&str>,
    ) -> Result<StoreResponse, RelayClientError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Ok(StoreResponse {
            success: true,
            collected_data: CollectedData {
                fingerprint_data: payload.clone(),
                context: ClientRequestContext::from_headers(&HeaderMap::new()),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
            },
            backend_latency: 0.5,
        })
    }

    async fn identify(
        &self,
        _stored: &BackendData,
        _cookie: Option<&str>,
    ) -> Result<IdentifyOutcome, RelayClientError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.identify_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.fail_identify {
            return Err(RelayClientError::Status {
                status: 502,
                message: "Fingerprint API error: 403, Forbidden".to_string(),
            });
        }

        Ok(IdentifyOutcome {
            response: IdentifyResponse {
                success: true,
                visitor_id: Some("visitor-1".to_string()),
                agent_data: Some(json!("blob")),
                backend_latency: 1.0,
                botd: Some(json!({ "bot": { "result": "notDetected" } })),
                request_id: Some("req-1".to_string()),
            },
            set_cookies: vec!["_iidt=token; Path=/; HttpOnly".to_string()],
        })
    }

    async fn clear(&self) -> Result<Vec<String>, RelayClientError> {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            "_iidt=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; SameSite=Lax".to_string(),
        ])
    }
}

/// Blocks its first collection until the gate opens
struct GatedCollector {
    inner: ScriptedCollector,
    gate: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl SignalCollector for GatedCollector {
    async fn load(&mut self) -> Result<(), CollectorError> {
        self.inner.load().await
    }

    async fn collect(&mut self) -> Result<Value, CollectorError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.await;
        }
        self.inner.collect().await
    }

    async fn handle_agent_data(&mut self, agent_data: &Value) -> Result<(), CollectorError> {
        self.inner.handle_agent_data(agent_data).await
    }

    async fn reset(&mut self) -> Result<(), CollectorError> {
        self.inner.reset().await
    }
}

fn session_with<C>(collector: C, relay: Arc<MockRelay>, storage: MemoryStorage) -> Arc<CheckoutSession>
where
    C: SignalCollector + 'static,
{
    Arc::new(CheckoutSession::new(
        BridgeHandle::spawn(collector),
        relay,
        Arc::new(storage),
        CookieJar::new(),
    ))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition was not reached");
}

#[tokio::test]
async fn test_happy_path_completes_identification() {
    let collector = ScriptedCollector::default();
    let relay = Arc::new(MockRelay::default());
    let storage = MemoryStorage::new();
    let session = session_with(collector.clone(), relay.clone(), storage.clone());

    assert_eq!(session.phase(), ProcessingPhase::Initial);

    session.collect().await.unwrap();
    assert_eq!(session.phase(), ProcessingPhase::Processing);

    session.send_to_backend(None).await.unwrap().unwrap();
    assert_eq!(session.phase(), ProcessingPhase::Stored);

    let response = session.complete_identification().await.unwrap().unwrap();
    assert_eq!(response.visitor_id.as_deref(), Some("visitor-1"));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Complete);
    assert!(snapshot.error.is_none());

    let record = snapshot.record;
    assert_eq!(record.visitor_id.as_deref(), Some("visitor-1"));
    assert_eq!(record.request_id.as_deref(), Some("req-1"));
    assert_eq!(record.botd.as_ref().unwrap()["bot"]["result"], "notDetected");
    assert_eq!(record.server_storage_latency_ms, Some(0.5));

    let storage_ms = record.backend_storage_latency_ms.unwrap();
    let identification_ms = record.identification_latency_ms.unwrap();
    let total = record.backend_latency_ms.unwrap();
    assert!((storage_ms + identification_ms - total).abs() < 1e-9);
    assert!(total >= storage_ms);
    let end_to_end = record.end_to_end_latency_ms().unwrap();
    assert!((end_to_end - (record.collect_latency_ms.unwrap() + total)).abs() < 1e-9);

    // The store key keeps the client round trip, not the relay's own timing
    let persisted: f64 = storage
        .get(storage::KEY_STORAGE_LATENCY)
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert!((persisted - storage_ms).abs() < 1e-9);

    // Agent data went back to the collector and the vendor cookie was kept
    assert!(collector.calls.lock().unwrap().contains(&"agent:blob".to_string()));
    assert_eq!(session.cookies().get("_iidt").as_deref(), Some("token"));

    assert_eq!(
        storage.get(storage::KEY_PROCESSING_PHASE).unwrap().as_deref(),
        Some("complete")
    );
    assert_eq!(
        storage.get(storage::KEY_VISITOR_ID).unwrap().as_deref(),
        Some("visitor-1")
    );
    assert_eq!(relay.store_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.identify_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_without_payload_short_circuits() {
    let relay = Arc::new(MockRelay::default());
    let session = session_with(ScriptedCollector::default(), relay.clone(), MemoryStorage::new());

    assert!(session.send_to_backend(None).await.unwrap().is_none());
    assert!(session.send_to_backend(Some(json!(""))).await.unwrap().is_none());
    assert_eq!(relay.store_calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.phase(), ProcessingPhase::Initial);
}

#[tokio::test]
async fn test_identify_requires_stored_record() {
    let relay = Arc::new(MockRelay::default());
    let session = session_with(ScriptedCollector::default(), relay.clone(), MemoryStorage::new());

    session.collect().await.unwrap();
    assert!(session.complete_identification().await.unwrap().is_none());
    assert_eq!(relay.identify_calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.phase(), ProcessingPhase::Processing);
}

#[tokio::test]
async fn test_send_before_collect_is_rejected() {
    let session = session_with(
        ScriptedCollector::default(),
        Arc::new(MockRelay::default()),
        MemoryStorage::new(),
    );

    let err = session.send_to_backend(Some(json!("signals"))).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidTransition {
            from: ProcessingPhase::Initial,
            to: ProcessingPhase::Sending
        }
    ));
}

#[tokio::test]
async fn test_collector_failure_enters_error() {
    let collector = ScriptedCollector {
        fail_collect: Some("Network blocked".to_string()),
        ..Default::default()
    };
    let session = session_with(collector, Arc::new(MockRelay::default()), MemoryStorage::new());

    assert!(session.collect().await.is_err());

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Error);
    assert_eq!(snapshot.error.as_deref(), Some("Network blocked"));

    // Only a reset leaves the error phase
    assert!(matches!(
        session.collect().await,
        Err(SessionError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_identify_failure_enters_error() {
    let relay = Arc::new(MockRelay {
        fail_identify: true,
        ..Default::default()
    });
    let session = session_with(ScriptedCollector::default(), relay, MemoryStorage::new());

    session.collect().await.unwrap();
    session.send_to_backend(None).await.unwrap();
    assert!(session.complete_identification().await.is_err());

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Error);
    assert!(snapshot.error.unwrap().contains("Fingerprint API error"));
    assert!(snapshot.record.visitor_id.is_none());
}

#[tokio::test]
async fn test_reset_clears_everything_before_recollecting() {
    let collector = ScriptedCollector::default();
    let relay = Arc::new(MockRelay::default());
    let storage = MemoryStorage::new();
    let session = session_with(collector.clone(), relay.clone(), storage.clone());

    session.collect().await.unwrap();
    session.send_to_backend(None).await.unwrap();
    session.complete_identification().await.unwrap();
    session.cookies().set("_vid_t", "v");
    session.cookies().set("_dd_s", "d");

    // What an observer sees at notification time
    let seen = Arc::new(Mutex::new(None));
    {
        let seen = seen.clone();
        let storage = storage.clone();
        let cookies = session.cookies().clone();
        session.register_reset_observer(move || {
            let keys_left = SESSION_KEYS
                .iter()
                .filter(|k| storage.get(k).unwrap().is_some())
                .count();
            *seen.lock().unwrap() = Some((keys_left, cookies.is_empty()));
        });
    }

    session.reset_environment().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), Some((0, true)));
    assert_eq!(relay.clear_calls.load(Ordering::SeqCst), 1);

    // A fresh cycle was started right away
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Processing);
    assert!(snapshot.record.visitor_id.is_none());
    assert!(snapshot.record.identification_latency_ms.is_none());
    assert!(storage.get(storage::KEY_VISITOR_ID).unwrap().is_none());
    assert_eq!(
        *collector.calls.lock().unwrap(),
        vec!["load", "collect", "agent:blob", "reset", "load", "collect"]
    );
}

#[tokio::test]
async fn test_reset_recovers_from_error() {
    let relay = Arc::new(MockRelay {
        fail_identify: true,
        ..Default::default()
    });
    let session = session_with(ScriptedCollector::default(), relay, MemoryStorage::new());

    session.collect().await.unwrap();
    session.send_to_backend(None).await.unwrap();
    let _ = session.complete_identification().await;
    assert_eq!(session.phase(), ProcessingPhase::Error);

    session.reset_environment().await.unwrap();
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Processing);
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn test_observers_run_in_order_despite_panics() {
    let session = session_with(
        ScriptedCollector::default(),
        Arc::new(MockRelay::default()),
        MemoryStorage::new(),
    );
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = order.clone();
    session.register_reset_observer(move || first.lock().unwrap().push(1));
    session.register_reset_observer(|| panic!("observer failure"));
    let third = order.clone();
    session.register_reset_observer(move || third.lock().unwrap().push(3));
    let fourth = order.clone();
    let removed = session.register_reset_observer(move || fourth.lock().unwrap().push(4));
    session.unregister_reset_observer(removed);

    session.reset_environment().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 3]);
}

#[tokio::test]
async fn test_stale_identify_after_reset_is_discarded() {
    let (release, gate) = oneshot::channel();
    let relay = Arc::new(MockRelay {
        identify_gate: Mutex::new(Some(gate)),
        ..Default::default()
    });
    let session = session_with(ScriptedCollector::default(), relay, MemoryStorage::new());

    session.collect().await.unwrap();
    session.send_to_backend(None).await.unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.complete_identification().await })
    };
    wait_for(|| session.phase() == ProcessingPhase::Identifying).await;

    session.reset_environment().await.unwrap();
    release.send(()).unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SessionError::Superseded)));

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Processing);
    assert!(snapshot.record.visitor_id.is_none());
    assert!(session.cookies().get("_iidt").is_none());
}

#[tokio::test]
async fn test_stale_collect_after_reset_is_discarded() {
    let (release, gate) = oneshot::channel();
    let inner = ScriptedCollector::default();
    let collector = GatedCollector {
        inner: inner.clone(),
        gate: Some(gate),
    };
    let session = session_with(collector, Arc::new(MockRelay::default()), MemoryStorage::new());

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.collect().await })
    };
    // The agent has loaded and collection is now parked on the gate
    wait_for(|| inner.calls.lock().unwrap().contains(&"load".to_string())).await;

    let reset = {
        let session = session.clone();
        tokio::spawn(async move { session.reset_environment().await })
    };
    wait_for(|| session.phase() == ProcessingPhase::Initial).await;

    release.send(()).unwrap();

    assert!(matches!(first.await.unwrap(), Err(SessionError::Superseded)));
    reset.await.unwrap().unwrap();

    assert_eq!(session.phase(), ProcessingPhase::Processing);
    assert_eq!(
        *inner.calls.lock().unwrap(),
        vec!["load", "collect", "reset", "load", "collect"]
    );
}

#[tokio::test]
async fn test_session_resumes_from_storage() {
    let storage = MemoryStorage::new();
    let record = SessionRecord {
        signal_payload: Some(json!("signals")),
        collect_latency_ms: Some(10.0),
        backend_storage_latency_ms: Some(2.0),
        identification_latency_ms: Some(3.0),
        backend_latency_ms: Some(5.0),
        visitor_id: Some("visitor-9".to_string()),
        ..SessionRecord::default()
    };
    storage::persist_record(&storage, &record, ProcessingPhase::Complete);

    let session = session_with(
        ScriptedCollector::default(),
        Arc::new(MockRelay::default()),
        storage,
    );
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, ProcessingPhase::Complete);
    assert_eq!(snapshot.record.visitor_id.as_deref(), Some("visitor-9"));
    assert_eq!(snapshot.record.backend_latency_ms, Some(5.0));
}

#[tokio::test]
async fn test_stored_phase_resumes_as_processing() {
    let storage = MemoryStorage::new();
    let record = SessionRecord {
        signal_payload: Some(json!("signals")),
        collect_latency_ms: Some(10.0),
        ..SessionRecord::default()
    };
    storage::persist_record(&storage, &record, ProcessingPhase::Stored);

    let relay = Arc::new(MockRelay::default());
    let session = session_with(ScriptedCollector::default(), relay.clone(), storage);
    assert_eq!(session.phase(), ProcessingPhase::Processing);

    // Resumed signals can be stored again without recollecting
    session.send_to_backend(None).await.unwrap().unwrap();
    assert_eq!(session.phase(), ProcessingPhase::Stored);
    assert_eq!(relay.store_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_in_flight_phases_resume_at_initial() {
    let empty = SessionRecord::default();
    assert_eq!(resume_phase(ProcessingPhase::Collecting, &empty), ProcessingPhase::Initial);
    assert_eq!(resume_phase(ProcessingPhase::Processing, &empty), ProcessingPhase::Initial);
    assert_eq!(resume_phase(ProcessingPhase::Error, &empty), ProcessingPhase::Initial);
}
