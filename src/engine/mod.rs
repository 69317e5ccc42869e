use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

mod remote;

pub use remote::RemoteEngine;

/// A fully resolved external table: connection URL, table name and driver
/// properties taken from the datasource definition in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    pub url: String,
    pub table: String,
    pub properties: HashMap<String, String>,
}

/// Opaque reference to a relation held by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Engine connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("Engine rejected request: {0}")]
    Rejected(String),
}

/// The four engine operations the controller needs to run a job. Implemented
/// over gRPC by [`RemoteEngine`]; tests substitute an in-memory recorder.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Loads an external table into the engine.
    async fn read(&self, source: &SourceBinding) -> Result<RelationHandle, EngineError>;

    /// Makes a relation addressable from SQL under `alias`.
    async fn register_view(
        &self,
        relation: &RelationHandle,
        alias: &str,
    ) -> Result<(), EngineError>;

    /// Runs a SQL statement and returns a handle to its result relation.
    async fn run_query(&self, sql: &str) -> Result<RelationHandle, EngineError>;

    /// Persists a relation into an external table.
    async fn write(
        &self,
        relation: &RelationHandle,
        target: &SourceBinding,
        mode: WriteMode,
    ) -> Result<(), EngineError>;
}
