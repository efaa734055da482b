//! Method descriptors and the type-erased handlers behind them.
//!
//! A registered method is stored as a [`Handler`]: it takes the request body
//! and the connection's [`BodyFormat`], decodes the typed argument, runs the
//! method and encodes the typed reply in the same format.
//! Two adapters produce handlers from ordinary Rust functions:
//!
//! - [`SyncMethod`] - `fn(&S, A, &mut R) -> Result<(), E>`, reply slot
//!   starts at `R::default()`
//! - [`AsyncMethod`] - `fn(Arc<S>, A) -> impl Future<Output = Result<R, E>>`

use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Body, BodyFormat, BoxFuture};
use crate::error::{RpcError, Result};

/// Result type for handler invocations: the encoded reply.
pub type HandlerResult = Result<Body>;

/// Trait for type-erased method handlers.
pub trait Handler: Send + Sync + 'static {
    /// Decode `arg`, run the method and return the reply encoded in `format`.
    fn call(&self, arg: Body, format: BodyFormat) -> BoxFuture<'static, HandlerResult>;
}

/// Allocate a zero-valued reply slot.
///
/// `Default` yields empty (not absent) maps and sequences, so methods can
/// fill them by mutation.
pub fn new_reply_slot<R: Default>() -> R {
    R::default()
}

/// Handler wrapping a synchronous method with an out-parameter reply.
pub struct SyncMethod<S, A, R, E, F>
where
    F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
{
    receiver: Arc<S>,
    method: F,
    _phantom: PhantomData<fn(A) -> (R, E)>,
}

impl<S, A, R, E, F> SyncMethod<S, A, R, E, F>
where
    F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
{
    /// Bind `method` to `receiver`.
    pub fn new(receiver: Arc<S>, method: F) -> Self {
        Self {
            receiver,
            method,
            _phantom: PhantomData,
        }
    }
}

impl<S, A, R, E, F> Handler for SyncMethod<S, A, R, E, F>
where
    S: Send + Sync + 'static,
    A: DeserializeOwned + 'static,
    R: Serialize + Default + 'static,
    E: Display + 'static,
    F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
{
    fn call(&self, arg: Body, format: BodyFormat) -> BoxFuture<'static, HandlerResult> {
        let result = format.decode::<A>(&arg).and_then(|arg| {
            let mut reply = new_reply_slot::<R>();
            (self.method)(self.receiver.as_ref(), arg, &mut reply)
                .map_err(|e| RpcError::Remote(e.to_string()))?;
            format.encode(&reply)
        });
        Box::pin(std::future::ready(result))
    }
}

/// Handler wrapping an async method that returns its reply.
pub struct AsyncMethod<S, A, R, E, F, Fut>
where
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    receiver: Arc<S>,
    method: F,
    _phantom: PhantomData<fn(A) -> (Fut, R, E)>,
}

impl<S, A, R, E, F, Fut> AsyncMethod<S, A, R, E, F, Fut>
where
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    /// Bind `method` to `receiver`.
    pub fn new(receiver: Arc<S>, method: F) -> Self {
        Self {
            receiver,
            method,
            _phantom: PhantomData,
        }
    }
}

impl<S, A, R, E, F, Fut> Handler for AsyncMethod<S, A, R, E, F, Fut>
where
    S: Send + Sync + 'static,
    A: DeserializeOwned + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    fn call(&self, arg: Body, format: BodyFormat) -> BoxFuture<'static, HandlerResult> {
        let arg = match format.decode::<A>(&arg) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.method)(self.receiver.clone(), arg);
        Box::pin(async move {
            let reply = fut.await.map_err(|e| RpcError::Remote(e.to_string()))?;
            format.encode(&reply)
        })
    }
}

/// A registered method: its name, declared types, call counter and handler.
pub struct MethodDescriptor {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Box<dyn Handler>,
}

impl MethodDescriptor {
    /// Describe a method taking `A` and replying with `R`.
    pub fn new<A, R>(name: &str, handler: Box<dyn Handler>) -> Self {
        Self {
            name: name.to_string(),
            arg_type: type_name::<A>(),
            reply_type: type_name::<R>(),
            num_calls: AtomicU64::new(0),
            handler,
        }
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the argument.
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply.
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Acquire)
    }

    /// Count the call, then run the handler.
    pub(crate) fn invoke(&self, arg: Body, format: BodyFormat) -> BoxFuture<'static, HandlerResult> {
        self.num_calls.fetch_add(1, Ordering::AcqRel);
        self.handler.call(arg, format)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FORMAT: BodyFormat = BodyFormat::MsgPack;

    fn body<T: Serialize + ?Sized>(value: &T) -> Body {
        FORMAT.encode(value).unwrap()
    }

    struct Calc;

    impl Calc {
        fn double(&self, n: i64, reply: &mut i64) -> std::result::Result<(), String> {
            *reply = n * 2;
            Ok(())
        }

        fn fail(&self, _: (), _: &mut String) -> std::result::Result<(), String> {
            Err("always fails".to_string())
        }
    }

    #[tokio::test]
    async fn test_sync_method_replies() {
        let handler = SyncMethod::new(Arc::new(Calc), Calc::double);
        let reply = handler.call(body(&21), FORMAT).await.unwrap();
        assert_eq!(FORMAT.decode::<i64>(&reply).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_reply_uses_connection_format() {
        let handler = SyncMethod::new(Arc::new(Calc), Calc::double);
        let json = BodyFormat::Json;
        let reply = handler.call(json.encode(&4).unwrap(), json).await.unwrap();
        assert_eq!(&reply[..], b"8");
    }

    #[tokio::test]
    async fn test_sync_method_error_text_unchanged() {
        let handler = SyncMethod::new(Arc::new(Calc), Calc::fail);
        let err = handler.call(FORMAT.unit(), FORMAT).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(text) if text == "always fails"));
    }

    #[tokio::test]
    async fn test_bad_argument_is_decode_error() {
        let handler = SyncMethod::new(Arc::new(Calc), Calc::double);
        let err = handler.call(body("not a number"), FORMAT).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[tokio::test]
    async fn test_container_reply_slots_start_empty() {
        let handler = SyncMethod::new(
            Arc::new(()),
            |_: &(), keys: Vec<String>, reply: &mut HashMap<String, usize>| {
                for key in keys {
                    reply.insert(key.clone(), key.len());
                }
                Ok::<(), String>(())
            },
        );

        let reply = handler.call(body(&Vec::<String>::new()), FORMAT).await.unwrap();
        assert!(FORMAT.decode::<HashMap<String, usize>>(&reply).unwrap().is_empty());
        let reply = handler.call(body(&["ab"]), FORMAT).await.unwrap();
        assert_eq!(
            FORMAT.decode::<HashMap<String, usize>>(&reply).unwrap(),
            HashMap::from([("ab".to_string(), 2)])
        );

        let empty: Vec<u8> = new_reply_slot();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_async_method() {
        let handler = AsyncMethod::new(Arc::new(10i64), |base: Arc<i64>, n: i64| async move {
            if n < 0 {
                return Err("negative");
            }
            Ok(*base + n)
        });

        let reply = handler.call(body(&5), FORMAT).await.unwrap();
        assert_eq!(FORMAT.decode::<i64>(&reply).unwrap(), 15);
        let err = handler.call(body(&-1), FORMAT).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(text) if text == "negative"));
    }

    #[tokio::test]
    async fn test_descriptor_counts_calls() {
        let descriptor = MethodDescriptor::new::<i64, i64>(
            "Double",
            Box::new(SyncMethod::new(Arc::new(Calc), Calc::double)),
        );
        assert_eq!(descriptor.name(), "Double");
        assert_eq!(descriptor.arg_type(), "i64");
        assert_eq!(descriptor.num_calls(), 0);

        descriptor.invoke(body(&1), FORMAT).await.unwrap();
        descriptor.invoke(body("bad"), FORMAT).await.unwrap_err();
        assert_eq!(descriptor.num_calls(), 2);
    }
}
