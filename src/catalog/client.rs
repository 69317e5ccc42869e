use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Streaming};

use crate::catalog::lock::LockGuard;
use crate::catalog::session::{Session, SessionManager, SharedSession};
use crate::error::{ControllerError, Result};
use crate::proto::catalog::events_client::EventsClient;
use crate::proto::catalog::locks_client::LocksClient;
use crate::proto::catalog::permissions_client::PermissionsClient;
use crate::proto::catalog::resources_client::ResourcesClient;
use crate::proto::catalog::{
    CreateResourceRequest, Event, EventType, GetResourceRequest, ListResourcesRequest, LockRequest,
    PermissionCheckRequest, Resource, SubscribeRequest, UpdateResourceRequest,
};

/// Resource kind of the analytical jobs this controller drives.
pub const ETL_JOB_KIND: &str = "etl-job";
/// Resource kind of external data source definitions.
pub const DATASOURCE_KIND: &str = "datasource";

/// Outcome of a lock attempt. A lock already held elsewhere is an expected
/// answer, not an error.
pub enum TryLockOutcome {
    Acquired(LockGuard),
    Held,
}

/// Authenticated client for the catalog services. Every call carries the
/// current access token as a bearer credential; the paired
/// [`SessionManager`] rotates that token out of band.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    resources: ResourcesClient<Channel>,
    permissions: PermissionsClient<Channel>,
    events: EventsClient<Channel>,
    locks: LocksClient<Channel>,
    session: SharedSession,
}

impl CatalogClient {
    /// Connects to the catalog endpoint and returns the client together with
    /// the session manager for the same connection.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<(CatalogClient, SessionManager)> {
        let channel = Endpoint::from_shared(addr.to_string())?
            .connect_timeout(timeout)
            .connect()
            .await?;
        let session: SharedSession = Arc::new(RwLock::new(Session::default()));
        let client = CatalogClient {
            resources: ResourcesClient::new(channel.clone()),
            permissions: PermissionsClient::new(channel.clone()),
            events: EventsClient::new(channel.clone()),
            locks: LocksClient::new(channel.clone()),
            session: session.clone(),
        };
        Ok((client, SessionManager::new(channel, session)))
    }

    async fn authed<T>(&self, message: T) -> Result<Request<T>> {
        let access_token = self.session.read().await.access_token.clone();
        let value = MetadataValue::try_from(format!("Bearer {access_token}"))
            .map_err(|e| ControllerError::Auth(format!("access token not metadata-safe: {e}")))?;
        let mut request = Request::new(message);
        request.metadata_mut().insert("authorization", value);
        Ok(request)
    }

    /// Lists resources of one kind matching a document filter such as
    /// `$.state == "PENDING"`. An empty filter lists the whole kind.
    pub async fn list_resources(&self, kind: &str, filter: &str) -> Result<Vec<Resource>> {
        let request = self
            .authed(ListResourcesRequest {
                kind: kind.to_string(),
                filter: filter.to_string(),
                ..Default::default()
            })
            .await?;
        let mut stream = self
            .resources
            .clone()
            .list(request)
            .await
            .map_err(ControllerError::from_status)?
            .into_inner();
        let mut resources = Vec::new();
        while let Some(resource) = stream.message().await.map_err(ControllerError::from_status)? {
            resources.push(resource);
        }
        Ok(resources)
    }

    pub async fn get_resource(&self, id: &str) -> Result<Resource> {
        let request = self
            .authed(GetResourceRequest { id: id.to_string() })
            .await?;
        let response = self
            .resources
            .clone()
            .get(request)
            .await
            .map_err(ControllerError::from_status)?;
        Ok(response.into_inner())
    }

    pub async fn create_resource(&self, kind: &str, data: String) -> Result<Resource> {
        let request = self
            .authed(CreateResourceRequest {
                kind: kind.to_string(),
                data,
                ..Default::default()
            })
            .await?;
        let response = self
            .resources
            .clone()
            .create(request)
            .await
            .map_err(ControllerError::from_status)?;
        Ok(response.into_inner())
    }

    /// Applies a JSON merge patch to a resource's document.
    pub async fn update_resource(&self, id: &str, patch: String) -> Result<Resource> {
        let request = self
            .authed(UpdateResourceRequest {
                id: id.to_string(),
                data: patch,
                ..Default::default()
            })
            .await?;
        let response = self
            .resources
            .clone()
            .update(request)
            .await
            .map_err(ControllerError::from_status)?;
        Ok(response.into_inner())
    }

    /// Resolves a datasource definition by the name stored in its document.
    pub async fn find_datasource(&self, name: &str) -> Result<Resource> {
        let filter = format!(r#"$.name == "{name}""#);
        let mut matches = self.list_resources(DATASOURCE_KIND, &filter).await?;
        if matches.is_empty() {
            return Err(ControllerError::NotFound(format!("datasource {name}")));
        }
        Ok(matches.swap_remove(0))
    }

    /// Asks whether `principal_id` may perform `action` on a resource.
    pub async fn check_permission(
        &self,
        principal_id: &str,
        resource_id: &str,
        action: &str,
    ) -> Result<bool> {
        let request = self
            .authed(PermissionCheckRequest {
                resource_id: resource_id.to_string(),
                principal_id: principal_id.to_string(),
                action: action.to_string(),
            })
            .await?;
        let response = self
            .permissions
            .clone()
            .check(request)
            .await
            .map_err(ControllerError::from_status)?;
        Ok(response.into_inner().granted)
    }

    /// Opens a stream of CREATE events for one resource kind.
    pub async fn subscribe_created(&self, kind: &str) -> Result<Streaming<Event>> {
        let request = self
            .authed(SubscribeRequest {
                resource_id: String::new(),
                resource_kind: kind.to_string(),
                event_type: EventType::Create as i32,
            })
            .await?;
        let response = self
            .events
            .clone()
            .subscribe(request)
            .await
            .map_err(ControllerError::from_status)?;
        Ok(response.into_inner())
    }

    /// Attempts to take the exclusive lock named `lock_id`. Acquisition is
    /// confirmed by the first keep-alive message, which carries the fencing
    /// token.
    pub async fn try_lock(&self, lock_id: &str) -> Result<TryLockOutcome> {
        let request = self
            .authed(LockRequest {
                lock_id: lock_id.to_string(),
            })
            .await?;
        let mut stream = match self.locks.clone().try_lock(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == tonic::Code::ResourceExhausted => {
                return Ok(TryLockOutcome::Held);
            }
            Err(status) => return Err(ControllerError::from_status(status)),
        };
        match stream.message().await.map_err(ControllerError::from_status)? {
            Some(confirmation) => Ok(TryLockOutcome::Acquired(LockGuard::new(
                lock_id.to_string(),
                confirmation.fencing_token,
                stream,
            ))),
            None => Err(ControllerError::Transport(tonic::Status::aborted(
                "lock stream closed before confirmation",
            ))),
        }
    }
}
