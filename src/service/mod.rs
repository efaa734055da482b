//! Service module - registered receivers and name-based method lookup.
//!
//! A [`Service`] binds a receiver object to the set of methods that may be
//! invoked remotely. Methods are registered explicitly through a
//! [`ServiceBuilder`]; each becomes a [`MethodDescriptor`] holding a
//! type-erased [`Handler`] that decodes the argument, runs the method and
//! encodes the reply.
//!
//! # Example
//!
//! ```
//! use poseidon::service::{Service, ServiceRegistry};
//!
//! struct Arith;
//!
//! impl Arith {
//!     fn add(&self, args: (i64, i64), reply: &mut i64) -> Result<(), String> {
//!         *reply = args.0 + args.1;
//!         Ok(())
//!     }
//! }
//!
//! let service = Service::builder("Arith", Arith)
//!     .method("Add", Arith::add)
//!     .build()
//!     .unwrap();
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register(service).unwrap();
//! assert!(registry.find_method("Arith.Add").is_ok());
//! ```

mod method;
mod registry;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Body, BodyFormat, BoxFuture};
use crate::error::{RpcError, Result};

pub use method::{
    new_reply_slot, AsyncMethod, Handler, HandlerResult, MethodDescriptor, SyncMethod,
};
pub use registry::ServiceRegistry;

/// Whether `name` may be called remotely: non-empty, first character uppercase.
pub fn is_exported(name: &str) -> bool {
    name.chars().next().map_or(false, char::is_uppercase)
}

/// A receiver registered for remote invocation.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Start building a service around `receiver`.
    pub fn builder<S>(name: &str, receiver: S) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        Self::builder_shared(name, Arc::new(receiver))
    }

    /// Start building a service around a receiver that is already shared.
    pub fn builder_shared<S>(name: &str, receiver: Arc<S>) -> ServiceBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        ServiceBuilder {
            name: name.to_string(),
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    /// Iterate over all registered methods.
    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.methods.values()
    }

    /// Invoke `method` with an argument encoded in `format`.
    ///
    /// The call counter is incremented before the method runs; the method's
    /// result is returned unchanged, its reply encoded in `format`.
    pub fn call(
        &self,
        method: &MethodDescriptor,
        arg: Body,
        format: BodyFormat,
    ) -> BoxFuture<'static, HandlerResult> {
        method.invoke(arg, format)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &names)
            .finish()
    }
}

/// Builder collecting the methods of a [`Service`].
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<S> ServiceBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Register a method that fills a reply slot.
    ///
    /// The slot starts at `R::default()`. A returned error is sent back to
    /// the caller as text and the slot is discarded.
    pub fn method<A, R, E, F>(self, name: &str, method: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        E: Display + 'static,
        F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        let handler = SyncMethod::new(self.receiver.clone(), method);
        self.insert::<A, R>(name, Box::new(handler))
    }

    /// Register an async method that returns its reply.
    pub fn async_method<A, R, E, F, Fut>(self, name: &str, method: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let handler = AsyncMethod::new(self.receiver.clone(), method);
        self.insert::<A, R>(name, Box::new(handler))
    }

    fn insert<A, R>(mut self, name: &str, handler: Box<dyn Handler>) -> Self {
        if !is_exported(name) {
            tracing::debug!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }
        let descriptor = MethodDescriptor::new::<A, R>(name, handler);
        if self
            .methods
            .insert(name.to_string(), Arc::new(descriptor))
            .is_some()
        {
            tracing::warn!("rpc server: method {}.{} registered twice", self.name, name);
        }
        tracing::debug!("rpc server: register {}.{}", self.name, name);
        self
    }

    /// Finish the service.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidServiceName`] if the name is not exported.
    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        if self.methods.is_empty() {
            tracing::warn!("rpc server: service {} has no exported methods", self.name);
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FORMAT: BodyFormat = BodyFormat::MsgPack;

    async fn call<A: Serialize + ?Sized, R: DeserializeOwned>(
        service: &Service,
        method: &MethodDescriptor,
        arg: &A,
    ) -> R {
        let reply = service
            .call(method, FORMAT.encode(arg).unwrap(), FORMAT)
            .await
            .unwrap();
        FORMAT.decode(&reply).unwrap()
    }

    struct Foo;

    impl Foo {
        fn sum(&self, args: (i32, i32), reply: &mut i32) -> std::result::Result<(), String> {
            *reply = args.0 + args.1;
            Ok(())
        }

        fn index(
            &self,
            words: Vec<String>,
            reply: &mut HashMap<String, usize>,
        ) -> std::result::Result<(), String> {
            for (i, w) in words.into_iter().enumerate() {
                reply.insert(w, i);
            }
            Ok(())
        }
    }

    #[test]
    fn test_is_exported() {
        assert!(is_exported("Foo"));
        assert!(is_exported("Ünïcode"));
        assert!(!is_exported("foo"));
        assert!(!is_exported("_Foo"));
        assert!(!is_exported(""));
    }

    #[test]
    fn test_unexported_service_name_is_rejected() {
        let err = Service::builder("foo", Foo).build().unwrap_err();
        assert!(matches!(err, RpcError::InvalidServiceName(name) if name == "foo"));
        assert!(Service::builder("", Foo).build().is_err());
    }

    #[test]
    fn test_unexported_methods_are_skipped() {
        let service = Service::builder("Foo", Foo)
            .method("Sum", Foo::sum)
            .method("sum", Foo::sum)
            .build()
            .unwrap();

        assert_eq!(service.name(), "Foo");
        assert!(service.method("Sum").is_some());
        assert!(service.method("sum").is_none());
        assert_eq!(service.methods().count(), 1);
    }

    #[tokio::test]
    async fn test_call_counts_and_replies() {
        let service = Service::builder("Foo", Foo)
            .method("Sum", Foo::sum)
            .method("Index", Foo::index)
            .build()
            .unwrap();

        let sum = service.method("Sum").unwrap().clone();
        assert_eq!(call::<_, i32>(&service, &sum, &(1, 2)).await, 3);
        assert_eq!(call::<_, i32>(&service, &sum, &(3, 4)).await, 7);
        assert_eq!(sum.num_calls(), 2);

        let index = service.method("Index").unwrap().clone();
        let empty: HashMap<String, usize> = call(&service, &index, &Vec::<String>::new()).await;
        assert!(empty.is_empty());
        assert_eq!(index.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_async_method_shares_receiver() {
        let service = Service::builder_shared("Greeter", Arc::new("hello".to_string()))
            .async_method("Greet", |prefix: Arc<String>, name: String| async move {
                Ok::<_, String>(format!("{} {}", prefix, name))
            })
            .build()
            .unwrap();

        let greet = service.method("Greet").unwrap().clone();
        assert_eq!(call::<_, String>(&service, &greet, "bob").await, "hello bob");
        assert_eq!(greet.reply_type(), std::any::type_name::<String>());
    }
}
