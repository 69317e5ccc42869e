use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};

use crate::catalog::{CatalogClient, ETL_JOB_KIND};
use crate::error::{ControllerError, Result};

/// Document filter selecting jobs that still await execution.
const PENDING_FILTER: &str = r#"$.state == "PENDING""#;

/// Stream of job ids to consider for execution. Ends only when the catalog
/// closes the event subscription.
pub type DiscoveredJobs = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Merges a snapshot of currently pending jobs with live CREATE events into
/// one id stream, snapshot first.
///
/// The subscription is opened before the snapshot is taken, so a job created
/// between the two calls cannot be missed. At worst it is delivered twice;
/// the state re-check under the job lock absorbs that.
pub async fn discover(catalog: &CatalogClient) -> Result<DiscoveredJobs> {
    let events = catalog.subscribe_created(ETL_JOB_KIND).await?;
    let pending = catalog.list_resources(ETL_JOB_KIND, PENDING_FILTER).await?;
    tracing::debug!(pending = pending.len(), "discovery snapshot taken");

    let snapshot = tokio_stream::iter(pending.into_iter().map(|resource| Ok(resource.id)));
    let live = events.map(|event| {
        event
            .map(|e| e.resource_id)
            .map_err(ControllerError::from_status)
    });
    Ok(Box::pin(snapshot.chain(live)))
}
