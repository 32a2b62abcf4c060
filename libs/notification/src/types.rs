//! Notification type definitions.

use ubot_id::{PoolId, ResultHash};

use crate::node::NodeDescriptor;

/// Type code of the starting-contract download invite/answer.
pub const TYPE_STARTING_CONTRACT: u16 = 1;

/// Type code of the generic cloud notification envelope.
pub const TYPE_CLOUD: u16 = 2;

/// A phase message exchanged between pool members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Sending node, resolved through the network config.
    pub from: NodeDescriptor,

    /// Pool this notification belongs to.
    pub pool_id: PoolId,

    /// True if this answers a request from the recipient.
    pub is_answer: bool,

    /// Type-specific payload.
    pub body: NotificationBody,
}

/// Payload of a notification; one variant per registered type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationBody {
    /// Invite to download the starting contract, or its acknowledgement.
    StartingContract,

    /// Generic cloud envelope used during method execution.
    Cloud(CloudKind),
}

/// Kinds carried inside the cloud envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudKind {
    /// Hash of the sender's method result.
    ExecResult { hash: ResultHash },

    /// Vote for the `seq`-th write to a single storage.
    SingleStorage {
        name: String,
        seq: u32,
        hash: ResultHash,
    },

    /// Announcement of the sender's slot for the `seq`-th multi storage write.
    MultiStorage {
        name: String,
        seq: u32,
        hash: ResultHash,
    },
}

/// Identifies which request a notification belongs to, ignoring direction.
///
/// Used to find a cached answer for a retried request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKey {
    StartingContract,
    ExecResult,
    SingleStorage { name: String, seq: u32 },
    MultiStorage { name: String, seq: u32 },
}

impl NotificationBody {
    /// The registered type code of this body.
    pub fn type_code(&self) -> u16 {
        match self {
            NotificationBody::StartingContract => TYPE_STARTING_CONTRACT,
            NotificationBody::Cloud(_) => TYPE_CLOUD,
        }
    }

    /// The request this body belongs to.
    pub fn request_key(&self) -> RequestKey {
        match self {
            NotificationBody::StartingContract => RequestKey::StartingContract,
            NotificationBody::Cloud(CloudKind::ExecResult { .. }) => RequestKey::ExecResult,
            NotificationBody::Cloud(CloudKind::SingleStorage { name, seq, .. }) => {
                RequestKey::SingleStorage {
                    name: name.clone(),
                    seq: *seq,
                }
            }
            NotificationBody::Cloud(CloudKind::MultiStorage { name, seq, .. }) => {
                RequestKey::MultiStorage {
                    name: name.clone(),
                    seq: *seq,
                }
            }
        }
    }
}

impl Notification {
    /// Creates a request notification.
    pub fn request(from: NodeDescriptor, pool_id: PoolId, body: NotificationBody) -> Self {
        Self {
            from,
            pool_id,
            is_answer: false,
            body,
        }
    }

    /// Creates an answer notification.
    pub fn answer(from: NodeDescriptor, pool_id: PoolId, body: NotificationBody) -> Self {
        Self {
            from,
            pool_id,
            is_answer: true,
            body,
        }
    }

    /// The request this notification belongs to.
    pub fn request_key(&self) -> RequestKey {
        self.body.request_key()
    }

    /// Short name of the body, for log lines.
    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            NotificationBody::StartingContract => "starting_contract",
            NotificationBody::Cloud(CloudKind::ExecResult { .. }) => "exec_result",
            NotificationBody::Cloud(CloudKind::SingleStorage { .. }) => "single_storage",
            NotificationBody::Cloud(CloudKind::MultiStorage { .. }) => "multi_storage",
        }
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKey::StartingContract => write!(f, "starting_contract"),
            RequestKey::ExecResult => write!(f, "exec_result"),
            RequestKey::SingleStorage { name, seq } => write!(f, "single_storage:{name}#{seq}"),
            RequestKey::MultiStorage { name, seq } => write!(f, "multi_storage:{name}#{seq}"),
        }
    }
}
