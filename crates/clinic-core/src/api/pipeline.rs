//! The authenticated request pipeline.
//!
//! Every call goes through two hooks around the [`Dispatcher`]:
//!
//! - **outbound** ([`AuthPipeline::on_request`]): attach the current bearer
//!   credential (or none), then run the registered [`OutboundStage`]s.
//! - **inbound** ([`AuthPipeline::on_response`]): run the registered
//!   [`InboundStage`]s, then decide between delivering the result and
//!   replaying the request with a refreshed credential.
//!
//! An unauthorized response to a request that carried a credential triggers
//! one refresh through [`CredentialStore::refresh`], shared with every other
//! caller that hit the same expiry. The request is then replayed once. A
//! second unauthorized response fails with [`ApiError::ReplayExhausted`]; a
//! failed refresh ends the session and fails with [`ApiError::SessionExpired`].

use std::sync::Arc;
use std::time::Instant;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, HttpResponse, RequestDescriptor, TransportError};
use super::ApiError;
use crate::auth::{Credential, CredentialStore, SessionTerminator, TokenRefresher};

/// Runs on every request just before it is dispatched (originals and replays).
pub trait OutboundStage: Send + Sync {
    fn prepare(&self, request: &mut RequestDescriptor);
}

/// Sees every raw dispatch result before the auth logic does.
pub trait InboundStage: Send + Sync {
    fn observe(&self, request: &RequestDescriptor, result: &Result<HttpResponse, TransportError>);
}

/// Logs each request and its outcome. Never logs header values.
pub struct TraceStage;

impl OutboundStage for TraceStage {
    fn prepare(&self, request: &mut RequestDescriptor) {
        debug!(
            method = %request.method,
            path = %request.path,
            authenticated = request.bearer().is_some(),
            "Sending request"
        );
    }
}

impl InboundStage for TraceStage {
    fn observe(&self, request: &RequestDescriptor, result: &Result<HttpResponse, TransportError>) {
        match result {
            Ok(response) if response.is_success() => {
                debug!(method = %request.method, path = %request.path, status = %response.status(), "Request succeeded");
            }
            Ok(response) => {
                info!(method = %request.method, path = %request.path, status = %response.status(), "Request returned error status");
            }
            Err(e) => {
                warn!(method = %request.method, path = %request.path, error = %e, "Request failed");
            }
        }
    }
}

/// Adds fixed headers to every request unless the request already sets them.
pub struct HeaderStage {
    headers: HeaderMap,
}

impl HeaderStage {
    pub fn new() -> Self {
        Self {
            headers: HeaderMap::new(),
        }
    }

    pub fn with(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl Default for HeaderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundStage for HeaderStage {
    fn prepare(&self, request: &mut RequestDescriptor) {
        for (name, value) in &self.headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// A request the pipeline may send again after a refresh. The replay marker
/// is single-use.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    descriptor: RequestDescriptor,
    replayed: bool,
}

impl PendingRequest {
    pub fn new(descriptor: RequestDescriptor) -> Self {
        Self {
            descriptor,
            replayed: false,
        }
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    /// Consume the replay marker. False if it was already used.
    pub fn mark_replay(&mut self) -> bool {
        !std::mem::replace(&mut self.replayed, true)
    }
}

/// What the inbound hook decided.
#[derive(Debug)]
pub enum Inbound {
    /// Hand this response to the caller.
    Deliver(HttpResponse),
    /// Send the request again carrying this credential.
    Replay(Credential),
}

pub struct AuthPipeline {
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    terminator: Arc<SessionTerminator>,
    outbound: Vec<Arc<dyn OutboundStage>>,
    inbound: Vec<Arc<dyn InboundStage>>,
}

pub struct AuthPipelineBuilder {
    pipeline: AuthPipeline,
}

impl AuthPipelineBuilder {
    pub fn outbound(mut self, stage: Arc<dyn OutboundStage>) -> Self {
        self.pipeline.outbound.push(stage);
        self
    }

    pub fn inbound(mut self, stage: Arc<dyn InboundStage>) -> Self {
        self.pipeline.inbound.push(stage);
        self
    }

    /// Register [`TraceStage`] on both sides
    pub fn with_tracing(self) -> Self {
        let stage = Arc::new(TraceStage);
        self.outbound(stage.clone()).inbound(stage)
    }

    pub fn build(self) -> AuthPipeline {
        self.pipeline
    }
}

impl AuthPipeline {
    /// The credential store is the terminator's, so clearing and reading can
    /// never diverge.
    pub fn builder(
        dispatcher: Arc<dyn Dispatcher>,
        refresher: Arc<dyn TokenRefresher>,
        terminator: Arc<SessionTerminator>,
    ) -> AuthPipelineBuilder {
        AuthPipelineBuilder {
            pipeline: AuthPipeline {
                dispatcher,
                store: Arc::clone(terminator.store()),
                refresher,
                terminator,
                outbound: Vec::new(),
                inbound: Vec::new(),
            },
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn terminator(&self) -> &Arc<SessionTerminator> {
        &self.terminator
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Send a request, refreshing the credential and replaying once if the
    /// backend reports it expired. Non-auth statuses come back as responses.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<HttpResponse, ApiError> {
        let mut pending = PendingRequest::new(descriptor);
        self.on_request(&mut pending)?;

        loop {
            let result = self.dispatch(&pending).await;
            match self.on_response(&mut pending, result).await? {
                Inbound::Deliver(response) => return Ok(response),
                Inbound::Replay(credential) => self.attach(&mut pending, Some(&credential))?,
            }
        }
    }

    /// Outbound hook: attach whatever credential is current right now.
    pub fn on_request(&self, pending: &mut PendingRequest) -> Result<(), ApiError> {
        let credential = self.store.get();
        self.attach(pending, credential.as_ref())
    }

    fn attach(&self, pending: &mut PendingRequest, credential: Option<&Credential>) -> Result<(), ApiError> {
        let request = &mut pending.descriptor;
        match credential {
            Some(credential) => request.set_bearer(&credential.access_token)?,
            None => request.clear_bearer(),
        }
        for stage in &self.outbound {
            stage.prepare(request);
        }
        Ok(())
    }

    async fn dispatch(&self, pending: &PendingRequest) -> Result<HttpResponse, TransportError> {
        let request = &pending.descriptor;
        let started = Instant::now();
        let result = self.dispatcher.send(request).await;
        debug!(
            method = %request.method,
            path = %request.path,
            replay = pending.is_replay(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );
        for stage in &self.inbound {
            stage.observe(request, &result);
        }
        result
    }

    /// Inbound hook: deliver, replay, or fail.
    pub async fn on_response(
        &self,
        pending: &mut PendingRequest,
        result: Result<HttpResponse, TransportError>,
    ) -> Result<Inbound, ApiError> {
        let response = result?;
        if !response.is_unauthorized() {
            return Ok(Inbound::Deliver(response));
        }

        let request = &pending.descriptor;
        let Some(sent_with) = request.bearer().map(str::to_owned) else {
            // Nothing was attached, so there is nothing to refresh
            debug!(method = %request.method, path = %request.path, "Unauthorized response to anonymous request");
            return Ok(Inbound::Deliver(response));
        };

        if !pending.mark_replay() {
            let request = &pending.descriptor;
            warn!(method = %request.method, path = %request.path, "Credentials rejected on replay");
            return Err(ApiError::ReplayExhausted {
                method: request.method.clone(),
                path: request.path.clone(),
            });
        }

        let request = &pending.descriptor;
        warn!(method = %request.method, path = %request.path, "Access token rejected, refreshing");

        // A refresh that finished while this request was on the wire already
        // produced a newer credential
        if let Some(current) = self.store.get() {
            if current.access_token != sent_with {
                debug!("Credential already rotated, replaying without refresh");
                return Ok(Inbound::Replay(current));
            }
        }

        match self.store.refresh(Arc::clone(&self.refresher)).await {
            Ok(credential) => Ok(Inbound::Replay(credential)),
            Err(e) => {
                self.terminator.terminate();
                Err(ApiError::SessionExpired(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;
    use crate::auth::{KeyValueStore, Navigator, RefreshError, SessionUser};
    use async_trait::async_trait;
    use reqwest::header;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Responder =
        Box<dyn Fn(&RequestDescriptor) -> Result<HttpResponse, TransportError> + Send + Sync>;

    /// Records every request it is given and answers after one yield, so
    /// concurrent callers interleave the way real network calls do.
    struct FakeDispatcher {
        responder: Responder,
        seen: Mutex<Vec<RequestDescriptor>>,
    }

    impl FakeDispatcher {
        fn new(
            responder: impl Fn(&RequestDescriptor) -> Result<HttpResponse, TransportError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                responder: Box::new(responder),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn bearers(&self) -> Vec<Option<String>> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.bearer().map(str::to_owned))
                .collect()
        }
    }

    #[async_trait]
    impl Dispatcher for FakeDispatcher {
        async fn send(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            tokio::task::yield_now().await;
            (self.responder)(request)
        }
    }

    /// Accepts only `token`; everything else is unauthorized.
    fn accepts(token: &'static str) -> impl Fn(&RequestDescriptor) -> Result<HttpResponse, TransportError> {
        move |request| {
            if request.bearer() == Some(token) {
                Ok(HttpResponse::new(StatusCode::OK, r#"[{"id":"p-1"}]"#))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, "token expired"))
            }
        }
    }

    struct FakeRefresher {
        calls: AtomicUsize,
        outcome: Result<Credential, RefreshError>,
        delay: Option<Duration>,
    }

    impl FakeRefresher {
        fn new(outcome: Result<Credential, RefreshError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: None,
            })
        }

        fn slow(outcome: Result<Credential, RefreshError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct RecordingNavigator {
        routes: Mutex<Vec<String>>,
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, route: &str) {
            self.routes.lock().unwrap().push(route.to_string());
        }
    }

    struct Harness {
        dispatcher: Arc<FakeDispatcher>,
        refresher: Arc<FakeRefresher>,
        storage: Arc<MemoryStorage>,
        store: Arc<CredentialStore>,
        navigator: Arc<RecordingNavigator>,
        pipeline: AuthPipeline,
    }

    fn refreshed(token: &str) -> Result<Credential, RefreshError> {
        Ok(Credential::new(token, Some("r2".to_string())))
    }

    fn harness(dispatcher: Arc<FakeDispatcher>, refresh_outcome: Result<Credential, RefreshError>) -> Harness {
        harness_with(dispatcher, FakeRefresher::new(refresh_outcome))
    }

    fn harness_with(dispatcher: Arc<FakeDispatcher>, refresher: Arc<FakeRefresher>) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(CredentialStore::new(storage.clone()));
        store.set_session(
            Credential::new("t1", Some("r1".to_string())),
            SessionUser {
                id: "u-1".to_string(),
                email: Some("reception@clinic.test".to_string()),
                name: "Reception".to_string(),
                role: "receptionist".to_string(),
            },
        );
        let navigator = Arc::new(RecordingNavigator::default());
        let terminator = Arc::new(SessionTerminator::new(store.clone(), navigator.clone(), "/login"));
        let pipeline = AuthPipeline::builder(dispatcher.clone(), refresher.clone(), terminator).build();

        Harness {
            dispatcher,
            refresher,
            storage,
            store,
            navigator,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_attaches_current_credential() {
        let h = harness(FakeDispatcher::new(accepts("t1")), refreshed("t2"));

        let response = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.dispatcher.bearers(), vec![Some("t1".to_string())]);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_credential_dispatches_without_header() {
        let h = harness(
            FakeDispatcher::new(|_| Ok(HttpResponse::new(StatusCode::OK, "{}"))),
            refreshed("t2"),
        );
        h.store.clear();

        let mut request = RequestDescriptor::get("/patients");
        // A stale header supplied by the caller is not trusted either
        request.set_bearer("leftover").unwrap();
        h.pipeline.request(request).await.unwrap();

        assert_eq!(h.dispatcher.bearers(), vec![None]);
    }

    #[tokio::test]
    async fn test_non_auth_statuses_pass_through() {
        let h = harness(
            FakeDispatcher::new(|_| Ok(HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom"))),
            refreshed("t2"),
        );

        let response = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body(), "boom");
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_propagates_unchanged() {
        let h = harness(FakeDispatcher::new(|_| Err(TransportError::Timeout)), refreshed("t2"));

        let err = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap_err();

        assert!(matches!(err, ApiError::Transport(TransportError::Timeout)));
        assert_eq!(h.dispatcher.calls(), 1);
        assert_eq!(h.refresher.calls(), 0);
        assert!(h.store.is_authenticated());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed() {
        let h = harness(FakeDispatcher::new(accepts("abc123")), refreshed("abc123"));

        let response = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let patients: Vec<serde_json::Value> = response.json().unwrap();
        assert_eq!(patients[0]["id"], "p-1");

        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(
            h.dispatcher.bearers(),
            vec![Some("t1".to_string()), Some("abc123".to_string())]
        );
        let replay = &h.dispatcher.seen.lock().unwrap()[1];
        assert_eq!(replay.method, reqwest::Method::GET);
        assert_eq!(replay.path, "/patients");
        assert_eq!(replay.headers.get(header::AUTHORIZATION).unwrap(), "Bearer abc123");

        // The new credential is current and persisted
        assert_eq!(h.store.get().unwrap().access_token, "abc123");
        assert_eq!(h.storage.get("access_token").unwrap().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_replay_keeps_method_path_and_body() {
        let h = harness(FakeDispatcher::new(accepts("t2")), refreshed("t2"));
        let request = RequestDescriptor::post("/appointments/a-1/cancel")
            .query("notify", "sms")
            .json(&serde_json::json!({"reason": "patient request"}))
            .unwrap();

        h.pipeline.request(request).await.unwrap();

        let seen = h.dispatcher.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].method, reqwest::Method::POST);
        assert_eq!(seen[1].path, "/appointments/a-1/cancel");
        assert_eq!(seen[1].query, vec![("notify".to_string(), "sms".to_string())]);
        assert_eq!(seen[1].body, Some(serde_json::json!({"reason": "patient request"})));
    }

    #[tokio::test]
    async fn test_concurrent_expiry_triggers_single_refresh() {
        let h = harness(FakeDispatcher::new(accepts("t2")), refreshed("t2"));

        let requests = (0..5).map(|i| h.pipeline.request(RequestDescriptor::get(format!("/patients/{}", i))));
        let results = futures::future::join_all(requests).await;

        assert_eq!(h.refresher.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().status(), StatusCode::OK);
        }
        // Five originals with t1, five replays with t2
        let bearers = h.dispatcher.bearers();
        assert_eq!(bearers.len(), 10);
        assert_eq!(bearers.iter().filter(|b| b.as_deref() == Some("t1")).count(), 5);
        assert_eq!(bearers.iter().filter(|b| b.as_deref() == Some("t2")).count(), 5);
    }

    #[tokio::test]
    async fn test_second_expiry_is_replay_exhausted() {
        let h = harness(
            FakeDispatcher::new(|_| Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))),
            refreshed("t2"),
        );

        let err = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap_err();

        match err {
            ApiError::ReplayExhausted { method, path } => {
                assert_eq!(method, reqwest::Method::GET);
                assert_eq!(path, "/patients");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.dispatcher.calls(), 2);
        assert_eq!(h.refresher.calls(), 1);
        // Terminal for the request only
        assert_eq!(h.store.get().unwrap().access_token, "t2");
        assert!(h.navigator.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_terminates_session() {
        let h = harness(
            FakeDispatcher::new(accepts("never")),
            Err(RefreshError::Rejected { status: 401 }),
        );

        let err = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap_err();

        assert!(matches!(err, ApiError::SessionExpired(RefreshError::Rejected { status: 401 })));
        assert!(h.store.get().is_none());
        assert!(h.storage.is_empty());
        assert_eq!(*h.navigator.routes.lock().unwrap(), vec!["/login".to_string()]);
        assert_eq!(h.dispatcher.calls(), 1);

        // A new request goes out without credentials
        let _ = h.pipeline.request(RequestDescriptor::get("/patients")).await;
        assert_eq!(h.dispatcher.bearers().last().cloned(), Some(None));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_failure_navigates_once() {
        let h = harness(
            FakeDispatcher::new(accepts("never")),
            Err(RefreshError::Transport(TransportError::Timeout)),
        );

        let requests = (0..4).map(|_| h.pipeline.request(RequestDescriptor::get("/finance/invoices")));
        let results = futures::future::join_all(requests).await;

        assert_eq!(h.refresher.calls(), 1);
        for result in results {
            assert!(result.unwrap_err().is_session_expired());
        }
        assert_eq!(h.navigator.routes.lock().unwrap().len(), 1);
        assert_eq!(h.dispatcher.calls(), 4);
    }

    #[tokio::test]
    async fn test_rotated_credential_replays_without_refresh() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(CredentialStore::new(storage));
        store.set(Credential::new("t1", Some("r1".to_string())));

        // Another caller's refresh lands while this request is on the wire
        let rotating = store.clone();
        let dispatcher = FakeDispatcher::new(move |request| {
            if request.bearer() == Some("t1") {
                rotating.set(Credential::new("t2", Some("r2".to_string())));
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))
            } else {
                Ok(HttpResponse::new(StatusCode::OK, "[]"))
            }
        });
        let navigator = Arc::new(RecordingNavigator::default());
        let terminator = Arc::new(SessionTerminator::new(store.clone(), navigator, "/login"));
        let refresher = FakeRefresher::new(refreshed("t3"));
        let pipeline = AuthPipeline::builder(dispatcher.clone(), refresher.clone(), terminator).build();

        let response = pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(refresher.calls(), 0);
        assert_eq!(
            dispatcher.bearers(),
            vec![Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_anonymous_unauthorized_is_delivered() {
        let h = harness(
            FakeDispatcher::new(|_| Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, "login required"))),
            refreshed("t2"),
        );
        h.store.clear();

        let response = h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.refresher.calls(), 0);
        assert!(h.navigator.routes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pending_request_marker_is_single_use() {
        let mut pending = PendingRequest::new(RequestDescriptor::get("/patients"));
        assert!(!pending.is_replay());
        assert!(pending.mark_replay());
        assert!(pending.is_replay());
        assert!(!pending.mark_replay());
    }

    struct CountingStage {
        prepared: AtomicUsize,
        observed: Mutex<Vec<u16>>,
    }

    impl OutboundStage for CountingStage {
        fn prepare(&self, _request: &mut RequestDescriptor) {
            self.prepared.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InboundStage for CountingStage {
        fn observe(&self, _request: &RequestDescriptor, result: &Result<HttpResponse, TransportError>) {
            if let Ok(response) = result {
                self.observed.lock().unwrap().push(response.status().as_u16());
            }
        }
    }

    #[tokio::test]
    async fn test_stages_run_for_original_and_replay() {
        let dispatcher = FakeDispatcher::new(accepts("t2"));
        let h = harness(dispatcher.clone(), refreshed("t2"));
        let stage = Arc::new(CountingStage {
            prepared: AtomicUsize::new(0),
            observed: Mutex::new(Vec::new()),
        });
        let pipeline = AuthPipeline::builder(dispatcher.clone(), h.refresher.clone(), h.pipeline.terminator().clone())
            .with_tracing()
            .outbound(stage.clone())
            .inbound(stage.clone())
            .outbound(Arc::new(
                HeaderStage::new().with(HeaderName::from_static("x-client"), HeaderValue::from_static("clinic-core")),
            ))
            .build();

        pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();

        assert_eq!(stage.prepared.load(Ordering::SeqCst), 2);
        assert_eq!(*stage.observed.lock().unwrap(), vec![401, 200]);
        for request in dispatcher.seen.lock().unwrap().iter() {
            assert_eq!(request.headers.get("x-client").unwrap(), "clinic-core");
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_stall_refresh() {
        let h = harness_with(
            FakeDispatcher::new(accepts("t2")),
            FakeRefresher::slow(refreshed("t2"), Duration::from_millis(50)),
        );

        // Caller navigates away while its refresh is in flight
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            h.pipeline.request(RequestDescriptor::get("/patients")),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(h.store.get().unwrap().access_token, "t2");
        assert!(!h.store.is_refreshing());
        assert!(h.navigator.routes.lock().unwrap().is_empty());

        // The next request uses the refreshed credential straight away
        h.pipeline.request(RequestDescriptor::get("/patients")).await.unwrap();
        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(h.dispatcher.bearers().last().cloned(), Some(Some("t2".to_string())));
    }
}
