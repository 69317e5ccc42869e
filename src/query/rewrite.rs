use std::collections::HashSet;

use uuid::Uuid;

use crate::catalog::CatalogClient;
use crate::engine::QueryEngine;
use crate::error::{ControllerError, Result};

use super::scan::scan_references;
use super::source_binding;

/// Rewrites every data-source reference in `sql` into a registered engine
/// view, after checking that the job's creator may read the referenced
/// source.
///
/// All occurrences of the same literal share one loaded view. Text without
/// references passes through untouched, with no catalog or engine calls.
pub async fn prepare<E: QueryEngine>(
    catalog: &CatalogClient,
    engine: &E,
    sql: &str,
    principal_id: &str,
) -> Result<String> {
    let references = scan_references(sql);
    if references.is_empty() {
        return Ok(sql.to_string());
    }

    let mut rewritten = sql.to_string();
    let mut bound: HashSet<String> = HashSet::new();
    for reference in &references {
        if !bound.insert(reference.literal.clone()) {
            continue;
        }

        let source = catalog.find_datasource(&reference.source).await?;
        if !catalog
            .check_permission(principal_id, &source.id, "read")
            .await?
        {
            return Err(ControllerError::Authorization {
                principal: principal_id.to_string(),
                action: "read".to_string(),
                resource: reference.source.clone(),
            });
        }

        let binding = source_binding(&source, &reference.table)?;
        let alias = view_alias();
        let relation = engine.read(&binding).await?;
        engine.register_view(&relation, &alias).await?;
        tracing::debug!(
            source = %reference.source,
            table = %reference.table,
            %alias,
            "bound data-source reference"
        );
        rewritten = rewritten.replace(&reference.literal, &alias);
    }
    Ok(rewritten)
}

/// Alias that cannot collide with identifiers in user SQL.
fn view_alias() -> String {
    format!("table_{}", Uuid::new_v4().simple())
}
