//! Contracts and error records.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ubot_id::{ContractId, PoolId};

use crate::pool::SizePolicy;

/// Contract errors.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("malformed contract: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("contract has no cloud method named {0:?}")]
    UnknownMethod(String),
}

/// The contract that triggers a cloud method run.
///
/// Its packed form is hashed into the [`PoolId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartingContract {
    pub executable_contract: ExecutableContract,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl StartingContract {
    pub fn pack(&self) -> Result<Bytes, ContractError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn unpack(packed: &[u8]) -> Result<Self, ContractError> {
        Ok(serde_json::from_slice(packed)?)
    }

    /// Policy of the invoked method.
    pub fn method_policy(&self) -> Result<&CloudMethodPolicy, ContractError> {
        self.executable_contract
            .cloud_methods
            .get(&self.method)
            .ok_or_else(|| ContractError::UnknownMethod(self.method.clone()))
    }
}

/// Pool id of a packed starting contract.
pub fn pool_id_of(packed: &[u8]) -> PoolId {
    PoolId::of(packed)
}

/// Contract declaring the cloud methods it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutableContract {
    pub name: String,
    #[serde(default)]
    pub cloud_methods: BTreeMap<String, CloudMethodPolicy>,
}

impl ExecutableContract {
    /// Content hash of the packed contract.
    pub fn id(&self) -> Result<ContractId, ContractError> {
        Ok(ContractId::of(&serde_json::to_vec(self)?))
    }
}

/// Per-method overrides of the processor defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMethodPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<SizePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<SizePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_read_trust_level: Option<f64>,
}

/// Error classification, as reported by `getState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Failure,
    BadValue,
    Timeout,
}

/// An error accumulated by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    /// What the error is about: a phase, a field or a storage name.
    pub object: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            object: object.into(),
            message: message.into(),
        }
    }

    pub fn failure(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Failure, object, message)
    }

    pub fn timeout(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, object, message)
    }

    pub fn bad_value(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, object, message)
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} in {}: {}", self.code, self.object, self.message)
    }
}
