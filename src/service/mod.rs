//! Service module - registration tables for remotely callable methods.
//!
//! Provides:
//! - [`Service`] - a receiver plus its routable methods, immutable once built
//! - [`ServiceBuilder`] - the explicit registration step
//! - [`MethodType`] - per-method descriptor with call counter
//!
//! A method qualifies when its name is exported (leading ASCII uppercase,
//! then alphanumerics or `_`). Anything else is skipped with a warning, not
//! rejected.
//!
//! # Example
//!
//! ```
//! use rpcwire::service::Service;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! struct Foo;
//!
//! let service = Service::builder(Foo)
//!     .method("Sum", |_foo: &Foo, args: Args, reply: &mut i32| {
//!         *reply = args.num1 + args.num2;
//!         Ok::<_, String>(())
//!     })
//!     .build();
//!
//! assert_eq!(service.name(), "Foo");
//! assert!(service.method("Sum").is_some());
//! ```

mod method;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RpcError, Result};
use method::{AsyncMethod, BlockingMethod, Invoke};

pub use method::{BoxFuture, ErasedValue, MethodResult, MethodType};

/// A registered receiver and its methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    /// Start a service named after the receiver's type.
    pub fn builder<S: Send + Sync + 'static>(receiver: S) -> ServiceBuilder<S> {
        let name = short_type_name::<S>();
        ServiceBuilder::new(name, Arc::new(receiver))
    }

    /// Start a service with an explicit name.
    pub fn named<S: Send + Sync + 'static>(name: impl Into<String>, receiver: S) -> ServiceBuilder<S> {
        ServiceBuilder::new(name.into(), Arc::new(receiver))
    }

    /// Service name used as the `Service` half of `Service.Method`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method descriptor.
    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    /// All method descriptors, in no particular order.
    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodType>> {
        self.methods.values()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('.') {
            return Err(RpcError::InvalidServiceName(self.name.clone()));
        }
        Ok(())
    }
}

/// Builder that collects the qualifying methods of one receiver.
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    fn new(name: String, receiver: Arc<S>) -> Self {
        tracing::debug!(service = %name, "rpc service: new service");
        Self {
            name,
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Register a method that fills a pre-allocated reply.
    ///
    /// The reply starts as `R::default()`, so `Vec` and `HashMap` replies
    /// arrive empty rather than absent. The method runs on the blocking
    /// pool; its error text is relayed to the caller verbatim.
    pub fn method<A, R, E, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display,
        F: Fn(&S, A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let handler = move |args: A, reply: &mut R| f(&*receiver, args, reply).map_err(|e| e.to_string());
        let invoker = BlockingMethod::new(Arc::new(handler));
        self.insert::<A, R>(name, Box::new(invoker));
        self
    }

    /// Register an async method; its output is the reply.
    pub fn async_method<A, R, E, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        E: Display,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let receiver = Arc::clone(&self.receiver);
        let handler = move |args: A| -> BoxFuture<'static, std::result::Result<R, String>> {
            let fut = f(Arc::clone(&receiver), args);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        };
        let invoker = AsyncMethod::new(Arc::new(handler));
        self.insert::<A, R>(name, Box::new(invoker));
        self
    }

    fn insert<A, R>(&mut self, name: &str, invoker: Box<dyn Invoke>) {
        if !is_exported(name) {
            tracing::warn!(service = %self.name, method = name, "rpc service: method is not exported, skipped");
            return;
        }
        if self.methods.contains_key(name) {
            tracing::warn!(service = %self.name, method = name, "rpc service: method already registered, skipped");
            return;
        }
        tracing::debug!(service = %self.name, method = name, "rpc service: register");
        self.methods
            .insert(name.to_string(), Arc::new(MethodType::new::<A, R>(name, invoker)));
    }

    /// Finish registration.
    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Exported means: starts with an ASCII uppercase letter, rest alphanumeric or `_`.
fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Last path segment of a type name, without generic parameters.
fn short_type_name<S>() -> String {
    let full = std::any::type_name::<S>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecType;
    use serde::Deserialize;
    use std::collections::HashMap as Map;

    #[derive(Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    struct Foo;

    fn sum(_: &Foo, args: Args, reply: &mut i32) -> std::result::Result<(), String> {
        *reply = args.num1 + args.num2;
        Ok(())
    }

    fn foo_service() -> Service {
        Service::builder(Foo)
            .method("Sum", sum)
            .method("sum", sum)
            .build()
    }

    #[test]
    fn test_only_exported_methods_register() {
        let service = foo_service();
        assert_eq!(service.name(), "Foo");
        assert_eq!(service.methods().count(), 1);

        let method = service.method("Sum").unwrap();
        assert!(method.arg_type().ends_with("Args"));
        assert_eq!(method.reply_type(), "i32");
        assert!(service.method("sum").is_none());
    }

    #[test]
    fn test_is_exported() {
        assert!(is_exported("Sum"));
        assert!(is_exported("Get_All2"));
        assert!(!is_exported("sum"));
        assert!(!is_exported(""));
        assert!(!is_exported("Sum.Bad"));
        assert!(!is_exported("_Sum"));
    }

    #[test]
    fn test_duplicate_method_keeps_first() {
        let service = Service::named("Calc", Foo)
            .method("Sum", sum)
            .method("Sum", |_: &Foo, _: Args, reply: &mut i32| {
                *reply = -1;
                Ok::<_, String>(())
            })
            .build();
        assert_eq!(service.methods().count(), 1);
    }

    #[test]
    fn test_short_type_name() {
        struct Wrapper<T>(T);
        assert_eq!(short_type_name::<Foo>(), "Foo");
        assert_eq!(short_type_name::<Wrapper<Foo>>(), "Wrapper");
    }

    #[test]
    fn test_invalid_service_name() {
        let service = Service::named("Bad.Name", Foo).build();
        assert!(matches!(service.validate(), Err(RpcError::InvalidServiceName(_))));
        assert!(Service::named("", Foo).build().validate().is_err());
    }

    #[test]
    fn test_new_reply_containers_start_empty() {
        let service = Service::named("Lists", Foo)
            .method("Keys", |_: &Foo, _: (), reply: &mut Vec<String>| {
                reply.push("a".into());
                Ok::<_, String>(())
            })
            .method("Index", |_: &Foo, _: (), reply: &mut Map<String, i32>| {
                reply.insert("a".into(), 1);
                Ok::<_, String>(())
            })
            .build();

        let keys = service.method("Keys").unwrap().new_reply();
        assert!(keys.downcast_ref::<Vec<String>>().unwrap().is_empty());
        let index = service.method("Index").unwrap().new_reply();
        assert!(index.downcast_ref::<Map<String, i32>>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_method_call_counts_and_fills_reply() {
        let service = foo_service();
        let method = service.method("Sum").unwrap();
        let codec = CodecType::MsgPack;

        let body = codec.encode(&Args { num1: 1, num2: 2 }).unwrap();
        let args = method.new_args(codec, &body).unwrap();
        let reply = method.call(args, method.new_reply()).await.unwrap();

        assert_eq!(*reply.downcast_ref::<i32>().unwrap(), 3);
        assert_eq!(method.num_calls(), 1);

        let encoded = method.encode_reply(codec, &reply).unwrap();
        assert_eq!(codec.decode::<i32>(&encoded).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_method_error_is_relayed_unchanged() {
        let service = Service::named("Fail", Foo)
            .method("Always", |_: &Foo, _: (), _: &mut ()| Err("no luck"))
            .build();
        let method = service.method("Always").unwrap();
        let body = CodecType::Json.encode(&()).unwrap();
        let args = method.new_args(CodecType::Json, &body).unwrap();

        let err = method.call(args, method.new_reply()).await.unwrap_err();
        assert_eq!(err, "no luck");
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_async_method() {
        struct Counter {
            base: i32,
        }
        let service = Service::builder(Counter { base: 10 })
            .async_method("Add", |c: Arc<Counter>, n: i32| async move {
                Ok::<_, String>(c.base + n)
            })
            .build();
        let method = service.method("Add").unwrap();
        let body = CodecType::MsgPack.encode(&5).unwrap();
        let args = method.new_args(CodecType::MsgPack, &body).unwrap();

        let reply = method.call(args, method.new_reply()).await.unwrap();
        assert_eq!(*reply.downcast_ref::<i32>().unwrap(), 15);
    }

    #[tokio::test]
    async fn test_panicking_method_becomes_error() {
        let service = Service::named("Boom", Foo)
            .method("Now", |_: &Foo, _: (), _: &mut ()| -> std::result::Result<(), String> {
                panic!("kaboom")
            })
            .build();
        let method = service.method("Now").unwrap();
        let body = CodecType::Json.encode(&()).unwrap();
        let args = method.new_args(CodecType::Json, &body).unwrap();

        let err = method.call(args, method.new_reply()).await.unwrap_err();
        assert!(err.contains("panicked"));
    }

    #[test]
    fn test_bad_args_are_decode_errors() {
        let service = foo_service();
        let method = service.method("Sum").unwrap();
        let body = CodecType::Json.encode(&"not args").unwrap();
        assert!(matches!(
            method.new_args(CodecType::Json, &body),
            Err(RpcError::Decode(_))
        ));
    }
}
