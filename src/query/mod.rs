//! Turning job SQL into engine work: reference scanning, permission-checked
//! rewriting and result persistence.

use std::collections::HashMap;

use serde::Deserialize;

use crate::engine::SourceBinding;
use crate::error::{ControllerError, Result};
use crate::proto::catalog::Resource;

mod exec;
mod rewrite;
mod scan;

pub use exec::execute;
pub use rewrite::prepare;
pub use scan::{parse_target, scan_references, Reference};

/// Connection details stored in a datasource resource's document. Extra
/// fields such as `name` are ignored.
#[derive(Debug, Deserialize)]
struct DatasourcePayload {
    url: String,
    #[serde(default)]
    properties: HashMap<String, String>,
}

/// Resolves a datasource resource plus a table name into a binding the
/// engine can open.
fn source_binding(resource: &Resource, table: &str) -> Result<SourceBinding> {
    let payload: DatasourcePayload = serde_json::from_str(&resource.data)
        .map_err(|e| ControllerError::Payload(format!("datasource {}: {e}", resource.id)))?;
    Ok(SourceBinding {
        url: payload.url,
        table: table.to_string(),
        properties: payload.properties,
    })
}
