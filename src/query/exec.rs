use crate::catalog::CatalogClient;
use crate::engine::{QueryEngine, WriteMode};
use crate::error::{ControllerError, Result};

use super::scan::parse_target;
use super::source_binding;

/// Runs prepared SQL on the engine and persists the result into the job's
/// target table, overwriting previous contents.
///
/// The write permission is checked before the query runs; a job that may not
/// store its result does no engine work at all.
pub async fn execute<E: QueryEngine>(
    catalog: &CatalogClient,
    engine: &E,
    sql: &str,
    target: &str,
    principal_id: &str,
) -> Result<()> {
    let reference =
        parse_target(target).ok_or_else(|| ControllerError::InvalidTarget(target.to_string()))?;

    let source = catalog.find_datasource(&reference.source).await?;
    if !catalog
        .check_permission(principal_id, &source.id, "write")
        .await?
    {
        return Err(ControllerError::Authorization {
            principal: principal_id.to_string(),
            action: "write".to_string(),
            resource: reference.source.clone(),
        });
    }

    let binding = source_binding(&source, &reference.table)?;
    let relation = engine.run_query(sql).await?;
    engine.write(&relation, &binding, WriteMode::Overwrite).await?;
    tracing::debug!(
        source = %reference.source,
        table = %reference.table,
        "stored query result"
    );
    Ok(())
}
