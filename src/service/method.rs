//! Method descriptors and their type-erased invokers.
//!
//! A [`MethodType`] is built once at registration from a typed handler and
//! then only read. Arguments and replies cross it as `Box<dyn Any + Send>`:
//! the descriptor knows the concrete types and is the only thing that ever
//! downcasts them.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::{RpcError, Result};

/// Boxed future for method results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A decoded argument or a reply slot, typed only inside its descriptor.
pub type ErasedValue = Box<dyn Any + Send>;

/// Outcome of a method: the filled reply, or the method's own error text.
pub type MethodResult = std::result::Result<ErasedValue, String>;

/// Typed handler behind a descriptor.
pub(crate) trait Invoke: Send + Sync + 'static {
    fn decode_args(&self, codec: CodecType, body: &[u8]) -> Result<ErasedValue>;
    fn new_reply(&self) -> ErasedValue;
    fn invoke(&self, args: ErasedValue, reply: ErasedValue) -> BoxFuture<'static, MethodResult>;
    fn encode_reply(&self, codec: CodecType, reply: &ErasedValue) -> Result<Vec<u8>>;
}

type BlockingFn<A, R> = dyn Fn(A, &mut R) -> std::result::Result<(), String> + Send + Sync;
type AsyncFn<A, R> = dyn Fn(A) -> BoxFuture<'static, std::result::Result<R, String>> + Send + Sync;

fn mismatch<T>() -> String {
    format!("rpc server: value is not a {}", std::any::type_name::<T>())
}

/// Method that fills a caller-allocated reply; runs on the blocking pool.
pub(crate) struct BlockingMethod<A, R> {
    handler: Arc<BlockingFn<A, R>>,
}

impl<A, R> BlockingMethod<A, R> {
    pub(crate) fn new(handler: Arc<BlockingFn<A, R>>) -> Self {
        Self { handler }
    }
}

/// Method that produces its reply from a future.
pub(crate) struct AsyncMethod<A, R> {
    handler: Arc<AsyncFn<A, R>>,
}

impl<A, R> AsyncMethod<A, R> {
    pub(crate) fn new(handler: Arc<AsyncFn<A, R>>) -> Self {
        Self { handler }
    }
}

fn decode_args<A: DeserializeOwned + Send + 'static>(codec: CodecType, body: &[u8]) -> Result<ErasedValue> {
    let args: A = codec.decode(body)?;
    Ok(Box::new(args))
}

fn new_reply<R: Default + Send + 'static>() -> ErasedValue {
    Box::new(R::default())
}

fn encode_reply<R: Serialize + 'static>(codec: CodecType, reply: &ErasedValue) -> Result<Vec<u8>> {
    let reply = reply
        .downcast_ref::<R>()
        .ok_or_else(|| RpcError::Encode(mismatch::<R>()))?;
    codec.encode(reply)
}

impl<A, R> Invoke for BlockingMethod<A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Default + Send + 'static,
{
    fn decode_args(&self, codec: CodecType, body: &[u8]) -> Result<ErasedValue> {
        decode_args::<A>(codec, body)
    }

    fn new_reply(&self) -> ErasedValue {
        new_reply::<R>()
    }

    fn invoke(&self, args: ErasedValue, reply: ErasedValue) -> BoxFuture<'static, MethodResult> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let args = *args.downcast::<A>().map_err(|_| mismatch::<A>())?;
            let mut reply = *reply.downcast::<R>().map_err(|_| mismatch::<R>())?;
            tokio::task::spawn_blocking(move || -> MethodResult {
                handler(args, &mut reply)?;
                Ok(Box::new(reply) as ErasedValue)
            })
            .await
            .map_err(|e| format!("rpc server: method panicked: {e}"))?
        })
    }

    fn encode_reply(&self, codec: CodecType, reply: &ErasedValue) -> Result<Vec<u8>> {
        encode_reply::<R>(codec, reply)
    }
}

impl<A, R> Invoke for AsyncMethod<A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Default + Send + 'static,
{
    fn decode_args(&self, codec: CodecType, body: &[u8]) -> Result<ErasedValue> {
        decode_args::<A>(codec, body)
    }

    fn new_reply(&self) -> ErasedValue {
        new_reply::<R>()
    }

    // The pre-allocated slot is replaced by the future's output.
    fn invoke(&self, args: ErasedValue, _reply: ErasedValue) -> BoxFuture<'static, MethodResult> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let args = *args.downcast::<A>().map_err(|_| mismatch::<A>())?;
            let reply = handler(args).await?;
            Ok::<_, String>(Box::new(reply) as ErasedValue)
        })
    }

    fn encode_reply(&self, codec: CodecType, reply: &ErasedValue) -> Result<Vec<u8>> {
        encode_reply::<R>(codec, reply)
    }
}

/// Descriptor of one registered method.
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    invoker: Box<dyn Invoke>,
}

impl MethodType {
    pub(crate) fn new<A, R>(name: &str, invoker: Box<dyn Invoke>) -> Self {
        Self {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            num_calls: AtomicU64::new(0),
            invoker,
        }
    }

    /// Method name (without the service prefix).
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

    /// Number of times [`call`](Self::call) has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a fresh argument value from an encoded body.
    pub fn new_args(&self, codec: CodecType, body: &[u8]) -> Result<ErasedValue> {
        self.invoker.decode_args(codec, body)
    }

    /// Allocate a fresh reply; containers start empty, never absent.
    pub fn new_reply(&self) -> ErasedValue {
        self.invoker.new_reply()
    }

    /// Count the call and invoke the method.
    ///
    /// The returned future is `'static` so the caller can run it as its own
    /// task. The method's error comes back unchanged.
    pub fn call(&self, args: ErasedValue, reply: ErasedValue) -> BoxFuture<'static, MethodResult> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.invoker.invoke(args, reply)
    }

    /// Encode a reply produced by [`call`](Self::call).
    pub fn encode_reply(&self, codec: CodecType, reply: &ErasedValue) -> Result<Vec<u8>> {
        self.invoker.encode_reply(codec, reply)
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}
