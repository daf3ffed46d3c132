//! gRPC surface: generated wire types plus the three service
//! implementations that sit directly on top of the dispatch engine.

pub mod admin_service;
pub mod chat_service;
pub mod file_service;
pub mod interceptors;

pub mod pb {
    tonic::include_proto!("gateway.v1");
}

pub use admin_service::AdminServiceImpl;
pub use chat_service::ChatServiceImpl;
pub use file_service::FileServiceImpl;
