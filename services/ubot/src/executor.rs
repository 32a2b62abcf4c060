//! Cloud method execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use ubot_id::PoolId;

use crate::contract::StartingContract;
use crate::storage::{CloudApi, StorageError};

/// One invocation of a cloud method.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub pool_id: PoolId,
    pub contract: Arc<StartingContract>,
    pub method: String,
    pub args: Value,
}

/// Method execution errors.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no cloud method named {0:?} is registered")]
    UnknownMethod(String),

    #[error("method failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Runs cloud methods.
///
/// Every pool member runs the same call; the pool agrees on the result by
/// comparing hashes of the returned JSON.
#[async_trait]
pub trait CloudExecutor: Send + Sync {
    async fn execute(&self, call: MethodCall, api: CloudApi) -> Result<Value, ExecError>;
}

type MethodFn = Arc<dyn Fn(MethodCall, CloudApi) -> BoxFuture<'static, Result<Value, ExecError>> + Send + Sync>;

/// Executor backed by methods registered in-process by name.
#[derive(Clone, Default)]
pub struct RegisteredMethods {
    methods: HashMap<String, MethodFn>,
}

impl RegisteredMethods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any previous one.
    pub fn register<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(MethodCall, CloudApi) -> BoxFuture<'static, Result<Value, ExecError>>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Methods every node ships with.
    ///
    /// - `echo` returns its arguments.
    /// - `increment` bumps a single-storage counter under the storage lock.
    /// - `collect` writes the arguments to a multi storage and returns the
    ///   agreed value of what the pool wrote.
    pub fn builtin() -> Self {
        Self::new()
            .register("echo", |call, _api| Box::pin(async move { Ok::<_, ExecError>(call.args) }))
            .register("increment", |call, api| {
                Box::pin(async move {
                    let name = call.args["storage"].as_str().unwrap_or("counter").to_string();
                    let _guard = api.lock(&name).await;
                    let current = match api.read_single(&name).await? {
                        Some(bytes) => serde_json::from_slice::<u64>(&bytes)
                            .map_err(|e| ExecError::Failed(e.to_string()))?,
                        None => 0,
                    };
                    let next = current + 1;
                    api.write_single(&name, next.to_string()).await?;
                    Ok::<_, ExecError>(Value::from(next))
                })
            })
            .register("collect", |call, api| {
                Box::pin(async move {
                    let name = call.args["storage"].as_str().unwrap_or("collected").to_string();
                    let value = serde_json::to_vec(&call.args["value"])
                        .map_err(|e| ExecError::Failed(e.to_string()))?;
                    api.write_multi(&name, value).await?;
                    let view = api.read_multi(&name).await?;
                    let agreed = view
                        .agreed_value(api.required_slots())
                        .ok_or_else(|| ExecError::Failed(format!("no agreed value in {name:?}")))?;
                    serde_json::from_slice::<Value>(agreed).map_err(|e| ExecError::Failed(e.to_string()))
                })
            })
    }
}

#[async_trait]
impl CloudExecutor for RegisteredMethods {
    async fn execute(&self, call: MethodCall, api: CloudApi) -> Result<Value, ExecError> {
        let method = self
            .methods
            .get(&call.method)
            .cloned()
            .ok_or_else(|| ExecError::UnknownMethod(call.method.clone()))?;

        info!(pool_id = %call.pool_id, method = %call.method, "Executing cloud method");
        method(call, api).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor;
    use crate::config::StorageConfig;
    use crate::contract::ExecutableContract;
    use crate::storage::{MemoryLedger, NamedMutex};
    use ubot_id::{ContractId, NodeNumber};

    fn call(method: &str, args: Value) -> (MethodCall, CloudApi) {
        let (processor, _mailbox) = actor::mailbox("processor", 1);
        let contract = StartingContract {
            executable_contract: ExecutableContract {
                name: "test".to_string(),
                cloud_methods: Default::default(),
            },
            method: method.to_string(),
            args: args.clone(),
        };
        let call = MethodCall {
            pool_id: PoolId::of(b"pool"),
            contract: Arc::new(contract),
            method: method.to_string(),
            args,
        };
        let api = CloudApi {
            pool_id: call.pool_id,
            contract_id: ContractId::of(b"contract"),
            me: NodeNumber::new(1),
            pool_size: 1,
            trust_level: 0.5,
            config: StorageConfig::default(),
            ledger: Arc::new(MemoryLedger::new()),
            locks: Arc::new(NamedMutex::new()),
            processor,
            epoch: 0,
        };
        (call, api)
    }

    #[tokio::test]
    async fn test_echo_returns_args() {
        let (call, api) = call("echo", serde_json::json!({"x": 1}));
        let output = RegisteredMethods::builtin().execute(call, api).await.unwrap();
        assert_eq!(output, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (call, api) = call("missing", Value::Null);
        let err = RegisteredMethods::new().execute(call, api).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownMethod(name) if name == "missing"));
    }

    #[test]
    fn test_register_replaces() {
        let methods = RegisteredMethods::new()
            .register("a", |_, _| Box::pin(async { Ok::<_, ExecError>(Value::from(1)) }))
            .register("a", |_, _| Box::pin(async { Ok::<_, ExecError>(Value::from(2)) }));
        assert_eq!(methods.names().collect::<Vec<_>>(), vec!["a"]);
    }
}
