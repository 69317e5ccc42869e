//! Test harness for controller integration tests.
//!
//! Runs an in-process catalog (resources, permissions, events, locks and
//! authentication) over scriptable state, plus an in-memory query engine
//! that records every call.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use etl_controller::catalog::{CatalogClient, SessionManager};
use etl_controller::config::ControllerConfig;
use etl_controller::controller::Controller;
use etl_controller::engine::{EngineError, QueryEngine, RelationHandle, SourceBinding, WriteMode};
use etl_controller::error::ControllerError;
use etl_controller::proto::catalog::events_server::{Events, EventsServer};
use etl_controller::proto::catalog::locks_server::{Locks, LocksServer};
use etl_controller::proto::catalog::permissions_server::{Permissions, PermissionsServer};
use etl_controller::proto::catalog::resources_server::{Resources, ResourcesServer};
use etl_controller::proto::catalog::{
    CreateResourceRequest, Event, EventType, GetResourceRequest, ListResourcesRequest, LockRequest,
    LockResponse, PermissionCheckRequest, PermissionCheckResponse, Resource, SubscribeRequest,
    UpdateResourceRequest,
};
use etl_controller::proto::idp::authentication_server::{Authentication, AuthenticationServer};
use etl_controller::proto::idp::{LoginRequest, LoginResponse, RefreshRequest};

// =============================================================================
// Catalog state
// =============================================================================

/// Scriptable in-memory catalog state, shared between the gRPC services and
/// the test assertions.
pub struct CatalogState {
    resources: Mutex<HashMap<String, Resource>>,
    /// Granted (principal, resource id, action) triples.
    grants: Mutex<HashSet<(String, String, String)>>,
    locks: Mutex<HashSet<String>>,
    access_tokens: Mutex<HashMap<String, String>>,
    refresh_tokens: Mutex<HashMap<String, String>>,
    /// Every state value written through Update, in write order.
    state_log: Mutex<Vec<(String, String)>>,
    events_tx: broadcast::Sender<Event>,
    token_seq: AtomicUsize,
    fencing_seq: AtomicI64,
    login_count: AtomicUsize,
    refresh_count: AtomicUsize,
    fail_next_list: AtomicBool,
}

impl CatalogState {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            resources: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashSet::new()),
            access_tokens: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
            state_log: Mutex::new(Vec::new()),
            events_tx,
            token_seq: AtomicUsize::new(0),
            fencing_seq: AtomicI64::new(0),
            login_count: AtomicUsize::new(0),
            refresh_count: AtomicUsize::new(0),
            fail_next_list: AtomicBool::new(false),
        }
    }

    fn issue_tokens(&self, principal: &str) -> (String, String) {
        let n = self.token_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("access-{principal}-{n}");
        let refresh = format!("refresh-{principal}-{n}");
        self.access_tokens
            .lock()
            .unwrap()
            .insert(access.clone(), principal.to_string());
        self.refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh.clone(), principal.to_string());
        (access, refresh)
    }

    /// Validates the bearer token of a request and returns its principal.
    fn authorize<T>(&self, request: &Request<T>) -> Result<String, Status> {
        let value = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization metadata"))?;
        let value = value
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization metadata"))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("malformed authorization metadata"))?;
        self.access_tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| Status::unauthenticated("token expired"))
    }

    fn publish(&self, resource: &Resource, event_type: EventType) {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            resource_id: resource.id.clone(),
            resource_kind: resource.kind.clone(),
            resource_labels: resource.labels.clone(),
            event_type: event_type as i32,
            data: resource.data.clone(),
            created_at: Some(now_ts()),
        };
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    // --- seeding -------------------------------------------------------------

    /// Inserts a resource directly, without emitting an event. Jobs seeded
    /// this way are only discoverable through the pending snapshot.
    pub fn insert_resource(&self, kind: &str, creator_id: &str, data: String) -> String {
        let id = Uuid::new_v4().to_string();
        let resource = Resource {
            id: id.clone(),
            kind: kind.to_string(),
            creator_id: creator_id.to_string(),
            data,
            created_at: Some(now_ts()),
            updated_at: Some(now_ts()),
            ..Default::default()
        };
        self.resources.lock().unwrap().insert(id.clone(), resource);
        id
    }

    pub fn seed_job(&self, creator_id: &str, sql: &str, target: &str) -> String {
        let data = serde_json::json!({ "sql": sql, "target": target, "state": "PENDING" });
        self.insert_resource("etl-job", creator_id, data.to_string())
    }

    pub fn seed_datasource(&self, name: &str, url: &str) -> String {
        let data = serde_json::json!({ "name": name, "url": url, "properties": {} });
        self.insert_resource("datasource", "admin", data.to_string())
    }

    pub fn grant(&self, principal_id: &str, resource_id: &str, action: &str) {
        self.grants.lock().unwrap().insert((
            principal_id.to_string(),
            resource_id.to_string(),
            action.to_string(),
        ));
    }

    /// Re-broadcasts the CREATE event for an existing resource.
    pub fn emit_created(&self, resource_id: &str) {
        let resource = self
            .resources
            .lock()
            .unwrap()
            .get(resource_id)
            .cloned()
            .expect("emit_created: unknown resource");
        self.publish(&resource, EventType::Create);
    }

    // --- fault injection -----------------------------------------------------

    /// Makes the next Resources.List call fail with UNAVAILABLE.
    pub fn fail_next_list(&self) {
        self.fail_next_list.store(true, Ordering::SeqCst);
    }

    /// Invalidates all outstanding access tokens. Refresh tokens stay valid.
    pub fn revoke_access_tokens(&self) {
        self.access_tokens.lock().unwrap().clear();
    }

    /// Invalidates all outstanding refresh tokens.
    pub fn revoke_refresh_tokens(&self) {
        self.refresh_tokens.lock().unwrap().clear();
    }

    /// Marks a lock as held by some other process.
    pub fn hold_lock(&self, lock_id: &str) {
        self.locks.lock().unwrap().insert(lock_id.to_string());
    }

    pub fn release_lock(&self, lock_id: &str) {
        self.locks.lock().unwrap().remove(lock_id);
    }

    // --- assertions ----------------------------------------------------------

    pub fn lock_held(&self, lock_id: &str) -> bool {
        self.locks.lock().unwrap().contains(lock_id)
    }

    /// Current `state` field of a job's document.
    pub fn job_state(&self, id: &str) -> Option<String> {
        let resources = self.resources.lock().unwrap();
        let resource = resources.get(id)?;
        let doc: serde_json::Value = serde_json::from_str(&resource.data).ok()?;
        Some(doc.get("state")?.as_str()?.to_string())
    }

    /// States written for one job through Update, in write order.
    pub fn recorded_states(&self, id: &str) -> Vec<String> {
        self.state_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, _)| job_id == id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn login_count(&self) -> usize {
        self.login_count.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }
}

fn now_ts() -> prost_types::Timestamp {
    let now = chrono::Utc::now();
    prost_types::Timestamp {
        seconds: now.timestamp(),
        nanos: now.timestamp_subsec_nanos() as i32,
    }
}

/// RFC 7386 style merge of a patch document into a stored one.
fn merge_document(doc: &mut serde_json::Value, patch: &serde_json::Value) {
    match (doc, patch) {
        (serde_json::Value::Object(doc), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_document(
                    doc.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}

/// Evaluates the `$.field == "value"` filters the controller uses against a
/// resource's document.
fn matches_filter(resource: &Resource, filter: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let Some((field, value)) = parse_filter(filter) else {
        return false;
    };
    let doc: serde_json::Value = match serde_json::from_str(&resource.data) {
        Ok(doc) => doc,
        Err(_) => return false,
    };
    doc.get(field).and_then(|v| v.as_str()) == Some(value)
}

fn parse_filter(filter: &str) -> Option<(&str, &str)> {
    let (lhs, rhs) = filter.split_once("==")?;
    let field = lhs.trim().strip_prefix("$.")?;
    let value = rhs.trim().strip_prefix('"')?.strip_suffix('"')?;
    Some((field, value))
}

// =============================================================================
// Catalog services
// =============================================================================

struct ResourcesSvc {
    state: Arc<CatalogState>,
}

#[tonic::async_trait]
impl Resources for ResourcesSvc {
    async fn create(
        &self,
        request: Request<CreateResourceRequest>,
    ) -> Result<Response<Resource>, Status> {
        let principal = self.state.authorize(&request)?;
        let req = request.into_inner();
        let id = self.state.insert_resource(&req.kind, &principal, req.data);
        let resource = self
            .state
            .resources
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("created resource exists");
        self.state.publish(&resource, EventType::Create);
        Ok(Response::new(resource))
    }

    async fn get(&self, request: Request<GetResourceRequest>) -> Result<Response<Resource>, Status> {
        self.state.authorize(&request)?;
        let req = request.into_inner();
        self.state
            .resources
            .lock()
            .unwrap()
            .get(&req.id)
            .cloned()
            .map(Response::new)
            .ok_or_else(|| Status::not_found("not found"))
    }

    async fn update(
        &self,
        request: Request<UpdateResourceRequest>,
    ) -> Result<Response<Resource>, Status> {
        self.state.authorize(&request)?;
        let req = request.into_inner();
        let patch: serde_json::Value = serde_json::from_str(&req.data)
            .map_err(|e| Status::invalid_argument(format!("invalid document: {e}")))?;

        let updated = {
            let mut resources = self.state.resources.lock().unwrap();
            let resource = resources
                .get_mut(&req.id)
                .ok_or_else(|| Status::not_found("not found"))?;
            let mut document: serde_json::Value = serde_json::from_str(&resource.data)
                .unwrap_or(serde_json::Value::Null);
            merge_document(&mut document, &patch);
            resource.data = document.to_string();
            resource.updated_at = Some(now_ts());
            resource.clone()
        };

        if let Some(state) = patch.get("state").and_then(|s| s.as_str()) {
            self.state
                .state_log
                .lock()
                .unwrap()
                .push((req.id.clone(), state.to_string()));
        }
        Ok(Response::new(updated))
    }

    type ListStream = Pin<Box<dyn Stream<Item = Result<Resource, Status>> + Send>>;

    async fn list(
        &self,
        request: Request<ListResourcesRequest>,
    ) -> Result<Response<Self::ListStream>, Status> {
        self.state.authorize(&request)?;
        if self.state.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(Status::unavailable("injected list failure"));
        }
        let req = request.into_inner();
        let matches: Vec<Result<Resource, Status>> = self
            .state
            .resources
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.kind == req.kind && matches_filter(r, &req.filter))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Response::new(Box::pin(tokio_stream::iter(matches))))
    }
}

struct PermissionsSvc {
    state: Arc<CatalogState>,
}

#[tonic::async_trait]
impl Permissions for PermissionsSvc {
    async fn check(
        &self,
        request: Request<PermissionCheckRequest>,
    ) -> Result<Response<PermissionCheckResponse>, Status> {
        self.state.authorize(&request)?;
        let req = request.into_inner();
        let key = (req.principal_id, req.resource_id, req.action);
        let granted = self.state.grants.lock().unwrap().contains(&key);
        Ok(Response::new(PermissionCheckResponse { granted }))
    }
}

struct EventsSvc {
    state: Arc<CatalogState>,
}

#[tonic::async_trait]
impl Events for EventsSvc {
    type SubscribeStream = Pin<Box<dyn Stream<Item = Result<Event, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        self.state.authorize(&request)?;
        let req = request.into_inner();
        let rx = self.state.events_tx.subscribe();
        let kind = req.resource_kind;
        let event_type = req.event_type;
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event)
                if (kind.is_empty() || event.resource_kind == kind)
                    && (event_type == EventType::None as i32
                        || event.event_type == event_type) =>
            {
                Some(Ok(event))
            }
            // Filtered out, or the subscriber lagged
            _ => None,
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

struct LocksSvc {
    state: Arc<CatalogState>,
}

#[tonic::async_trait]
impl Locks for LocksSvc {
    type TryLockStream = Pin<Box<dyn Stream<Item = Result<LockResponse, Status>> + Send>>;

    async fn try_lock(
        &self,
        request: Request<LockRequest>,
    ) -> Result<Response<Self::TryLockStream>, Status> {
        self.state.authorize(&request)?;
        let req = request.into_inner();
        let lock_id = req.lock_id;
        {
            let mut locks = self.state.locks.lock().unwrap();
            if !locks.insert(lock_id.clone()) {
                return Err(Status::resource_exhausted("failed to get lock"));
            }
        }
        let fencing_token = self.state.fencing_seq.fetch_add(1, Ordering::SeqCst) + 1;

        // Keep-alive ticker; the lock is released when the client drops the
        // stream and the next send fails.
        let (tx, rx) = mpsc::channel(4);
        let state = self.state.clone();
        let held_id = lock_id.clone();
        tokio::spawn(async move {
            loop {
                let message = LockResponse {
                    lock_id: held_id.clone(),
                    fencing_token,
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            state.locks.lock().unwrap().remove(&held_id);
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

struct AuthSvc {
    state: Arc<CatalogState>,
}

#[tonic::async_trait]
impl Authentication for AuthSvc {
    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        self.state.login_count.fetch_add(1, Ordering::SeqCst);
        if req.service_account_id.is_empty() {
            return Err(Status::unauthenticated("unknown service account"));
        }
        let (access_token, refresh_token) = self.state.issue_tokens(&req.service_account_id);
        Ok(Response::new(LoginResponse {
            access_token,
            refresh_token,
        }))
    }

    async fn refresh(
        &self,
        request: Request<RefreshRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        self.state.refresh_count.fetch_add(1, Ordering::SeqCst);
        let principal = self
            .state
            .refresh_tokens
            .lock()
            .unwrap()
            .remove(&req.refresh_token)
            .ok_or_else(|| Status::unauthenticated("refresh token expired"))?;
        let (access_token, refresh_token) = self.state.issue_tokens(&principal);
        Ok(Response::new(LoginResponse {
            access_token,
            refresh_token,
        }))
    }
}

// =============================================================================
// Test catalog server
// =============================================================================

/// In-process catalog server plus its scriptable state.
pub struct TestCatalog {
    pub addr: String,
    pub state: Arc<CatalogState>,
    server_handle: JoinHandle<()>,
}

impl TestCatalog {
    pub async fn spawn(port: u16) -> Self {
        let state = Arc::new(CatalogState::new());
        let socket_addr = format!("127.0.0.1:{port}").parse().unwrap();
        let server = Server::builder()
            .add_service(ResourcesServer::new(ResourcesSvc {
                state: state.clone(),
            }))
            .add_service(PermissionsServer::new(PermissionsSvc {
                state: state.clone(),
            }))
            .add_service(EventsServer::new(EventsSvc {
                state: state.clone(),
            }))
            .add_service(LocksServer::new(LocksSvc {
                state: state.clone(),
            }))
            .add_service(AuthenticationServer::new(AuthSvc {
                state: state.clone(),
            }));
        let server_handle = tokio::spawn(async move {
            if let Err(e) = server.serve(socket_addr).await {
                eprintln!("test catalog server error: {e}");
            }
        });

        // Wait briefly for the server to start listening
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr: format!("http://127.0.0.1:{port}"),
            state,
            server_handle,
        }
    }

    /// Connected catalog client logged in as `principal`.
    pub async fn client(&self, principal: &str) -> (CatalogClient, SessionManager) {
        let (client, session) = CatalogClient::connect(&self.addr, Duration::from_secs(5))
            .await
            .expect("connect to test catalog");
        session
            .login(principal, "test-secret")
            .await
            .expect("login to test catalog");
        (client, session)
    }
}

impl Drop for TestCatalog {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

// =============================================================================
// Recording engine
// =============================================================================

/// What the engine was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Read { url: String, table: String },
    RegisterView { alias: String },
    RunQuery { sql: String },
    Write { url: String, table: String, mode: WriteMode },
}

/// In-memory [`QueryEngine`] that records every call. Clones share state, so
/// a test keeps one handle while the controller owns another.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    inner: Arc<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    calls: Mutex<Vec<EngineCall>>,
    handle_seq: AtomicUsize,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn queries_run(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RunQuery { sql } => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn registered_aliases(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::RegisterView { alias } => Some(alias),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, EngineCall::Write { .. }))
            .collect()
    }

    /// Makes every write fail with an engine rejection.
    pub fn fail_writes(&self) {
        self.inner.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Delays every write, keeping the job in flight long enough to observe.
    pub fn delay_writes(&self, delay: Duration) {
        *self.inner.write_delay.lock().unwrap() = Some(delay);
    }

    fn next_handle(&self) -> RelationHandle {
        let n = self.inner.handle_seq.fetch_add(1, Ordering::SeqCst);
        RelationHandle(format!("rel-{n}"))
    }
}

#[async_trait]
impl QueryEngine for RecordingEngine {
    async fn read(&self, source: &SourceBinding) -> Result<RelationHandle, EngineError> {
        self.inner.calls.lock().unwrap().push(EngineCall::Read {
            url: source.url.clone(),
            table: source.table.clone(),
        });
        Ok(self.next_handle())
    }

    async fn register_view(
        &self,
        _relation: &RelationHandle,
        alias: &str,
    ) -> Result<(), EngineError> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push(EngineCall::RegisterView {
                alias: alias.to_string(),
            });
        Ok(())
    }

    async fn run_query(&self, sql: &str) -> Result<RelationHandle, EngineError> {
        self.inner.calls.lock().unwrap().push(EngineCall::RunQuery {
            sql: sql.to_string(),
        });
        Ok(self.next_handle())
    }

    async fn write(
        &self,
        _relation: &RelationHandle,
        target: &SourceBinding,
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        let delay = *self.inner.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("injected write failure".to_string()));
        }
        self.inner.calls.lock().unwrap().push(EngineCall::Write {
            url: target.url.clone(),
            table: target.table.clone(),
            mode,
        });
        Ok(())
    }
}

// =============================================================================
// Controller helpers
// =============================================================================

/// Spawns a controller logged in as its service account. Returns the shutdown
/// token and the join handle carrying the controller's exit result.
pub async fn spawn_controller(
    catalog: &TestCatalog,
    engine: RecordingEngine,
) -> (CancellationToken, JoinHandle<Result<(), ControllerError>>) {
    let (client, session) = catalog.client("controller-sa").await;
    let config = ControllerConfig::new(&catalog.addr, "http://127.0.0.1:1")
        .with_retry_delay(Duration::from_millis(50));
    let controller = Controller::new(client, session, engine, &config);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { controller.run(token).await });
    (shutdown, handle)
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Waits until a job's stored state equals `want`.
pub async fn wait_for_job_state(state: &CatalogState, job_id: &str, want: &str) -> bool {
    wait_for(
        || async { state.job_state(job_id).as_deref() == Some(want) },
        Duration::from_secs(5),
    )
    .await
}
