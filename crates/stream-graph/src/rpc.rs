//! In-process RPC surface. The wire transport is a deployment concern; what
//! lives here is the JSON service registry: services register under their
//! element or policy name and methods dispatch by name with JSON payloads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("no service registered at: {0}")]
    NoSuchService(String),
    #[error("no method {method} on service {service}")]
    NoSuchMethod { service: String, method: String },
    #[error("bad parameters: {0}")]
    BadParams(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

pub trait RpcService: Send + Sync {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Default)]
pub struct RpcRegistry {
    services: RwLock<HashMap<String, Arc<dyn RpcService>>>,
}

impl RpcRegistry {
    pub fn new() -> Arc<RpcRegistry> {
        Arc::new(RpcRegistry::default())
    }

    pub fn register(&self, path: impl Into<String>, service: Arc<dyn RpcService>) -> bool {
        let mut services = self.services.write();
        let path = path.into();
        if services.contains_key(&path) {
            return false;
        }
        services.insert(path, service);
        true
    }

    pub fn unregister(&self, path: &str) {
        self.services.write().remove(path);
    }

    pub fn invoke(&self, path: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let service = self
            .services
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchService(path.to_string()))?;
        service.invoke(method, params)
    }

    pub fn service_paths(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}
