use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::engine::{EngineError, QueryEngine, RelationHandle, SourceBinding, WriteMode};
use crate::proto::engine::engine_client::EngineClient;
use crate::proto::engine::{
    ReadRequest, RegisterViewRequest, RunQueryRequest, WriteMode as ProtoWriteMode, WriteRequest,
};

/// gRPC client for a remote query engine.
#[derive(Debug, Clone)]
pub struct RemoteEngine {
    client: EngineClient<Channel>,
}

impl RemoteEngine {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, EngineError> {
        let channel = Endpoint::from_shared(addr.to_string())?
            .connect_timeout(timeout)
            .connect()
            .await?;
        Ok(Self {
            client: EngineClient::new(channel),
        })
    }
}

impl From<WriteMode> for ProtoWriteMode {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Overwrite => ProtoWriteMode::Overwrite,
            WriteMode::Append => ProtoWriteMode::Append,
        }
    }
}

#[async_trait]
impl QueryEngine for RemoteEngine {
    async fn read(&self, source: &SourceBinding) -> Result<RelationHandle, EngineError> {
        let response = self
            .client
            .clone()
            .read(ReadRequest {
                url: source.url.clone(),
                table: source.table.clone(),
                properties: source.properties.clone(),
            })
            .await?;
        Ok(RelationHandle(response.into_inner().handle))
    }

    async fn register_view(
        &self,
        relation: &RelationHandle,
        alias: &str,
    ) -> Result<(), EngineError> {
        self.client
            .clone()
            .register_view(RegisterViewRequest {
                handle: relation.0.clone(),
                alias: alias.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn run_query(&self, sql: &str) -> Result<RelationHandle, EngineError> {
        let response = self
            .client
            .clone()
            .run_query(RunQueryRequest {
                sql: sql.to_string(),
            })
            .await?;
        Ok(RelationHandle(response.into_inner().handle))
    }

    async fn write(
        &self,
        relation: &RelationHandle,
        target: &SourceBinding,
        mode: WriteMode,
    ) -> Result<(), EngineError> {
        self.client
            .clone()
            .write(WriteRequest {
                handle: relation.0.clone(),
                url: target.url.clone(),
                table: target.table.clone(),
                mode: ProtoWriteMode::from(mode) as i32,
                properties: target.properties.clone(),
            })
            .await?;
        Ok(())
    }
}
