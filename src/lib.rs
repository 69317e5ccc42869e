pub mod catalog;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod query;
pub mod shutdown;

// Re-export generated protobuf types
pub mod proto {
    pub mod catalog {
        tonic::include_proto!("catalog");
    }
    pub mod engine {
        tonic::include_proto!("engine");
    }
    pub mod idp {
        tonic::include_proto!("idp");
    }
}
