use std::time::Duration;

/// Runtime configuration for the controller process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Catalog endpoint, e.g. `http://127.0.0.1:50051`.
    pub catalog_addr: String,
    /// Query engine endpoint.
    pub engine_addr: String,
    /// Service account the controller authenticates as.
    pub service_account_id: String,
    pub service_account_secret: String,
    /// Deadline applied to catalog and engine connections.
    pub rpc_timeout: Duration,
    /// Pause before restarting discovery after a transport failure.
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            catalog_addr: "http://127.0.0.1:50051".to_string(),
            engine_addr: "http://127.0.0.1:50052".to_string(),
            service_account_id: String::new(),
            service_account_secret: String::new(),
            rpc_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ControllerConfig {
    pub fn new(catalog_addr: impl Into<String>, engine_addr: impl Into<String>) -> Self {
        Self {
            catalog_addr: catalog_addr.into(),
            engine_addr: engine_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_service_account(
        mut self,
        id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.service_account_id = id.into();
        self.service_account_secret = secret.into();
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}
