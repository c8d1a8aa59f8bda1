use std::future::Future;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::{FunctionInput, StepContext};
use crate::error::Result;

/// A named function registered on a step.
///
/// The returned value is raised as `"{function}.OnResult"`. Any error other
/// than [`crate::ProcessError::Cancelled`] is treated as a step failure and
/// handed to the error router.
///
/// Implemented for every `async` closure of the right shape:
///
/// ```ignore
/// let square = |input: FunctionInput, _ctx: StepContext| async move {
///     let x: i64 = input.arg("x")?;
///     Ok(json!(x * x))
/// };
/// ```
pub trait StepFunction: Send + Sync + 'static {
    fn call(&self, input: FunctionInput, ctx: StepContext) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> StepFunction for F
where
    F: Fn(FunctionInput, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, input: FunctionInput, ctx: StepContext) -> BoxFuture<'static, Result<Value>> {
        Box::pin(self(input, ctx))
    }
}

/// Key-value storage the runtime persists step state and join buffers into.
///
/// Writes are full-document overwrites; the runtime never needs cross-key
/// transactions. Implementations report failures as
/// [`crate::ProcessError::Persistence`] or [`crate::ProcessError::Database`].
pub trait StorageConnector: Send + Sync + 'static {
    /// Fetch the document stored under `key`, if any.
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<Value>>>;

    /// Store `blob` under `key`, replacing any previous document.
    fn put(&self, key: &str, blob: Value) -> BoxFuture<'_, Result<()>>;

    /// Backend name, for diagnostics.
    fn name(&self) -> &str {
        "storage"
    }
}
