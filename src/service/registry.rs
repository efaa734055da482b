//! Service registry for dispatching requests by `"Service.Method"` name.

use std::collections::HashMap;
use std::sync::Arc;

use super::{MethodDescriptor, Service};
use crate::error::{RpcError, Result};

/// Registry mapping service names to services.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ServiceAlreadyDefined`] if a service with the same
    /// name is already registered; the registry is left unchanged.
    pub fn register(&mut self, service: Service) -> Result<()> {
        if self.services.contains_key(service.name()) {
            return Err(RpcError::ServiceAlreadyDefined(service.name().to_string()));
        }
        tracing::debug!(
            "rpc server: register service {} ({} methods)",
            service.name(),
            service.methods.len()
        );
        self.services
            .insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve `"Service.Method"`.
    ///
    /// The name is split at the last `.`.
    pub fn find_method(
        &self,
        service_method: &str,
    ) -> Result<(Arc<Service>, Arc<MethodDescriptor>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::IllFormedMethod(service_method.to_string()))?;

        let service = self
            .services
            .get(service_name)
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))?;

        Ok((service.clone(), method.clone()))
    }
}
