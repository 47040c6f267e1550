//! # Result Messages
//!
//! One typed message per task kind, sent from the completion phase. Entity
//! scoped results echo the DBID and the caller's callback id so the caller can
//! correlate them with its request.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{AccountFlags, ComponentType, ServerErrorCode};
use crate::database::{Dbid, EntityTypeId, QueryRows};
use crate::registry::EntityHolder;

/// Network address of a cluster process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Who a result is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// The process that submitted the task
    Endpoint(Endpoint),
    /// A registered component, resolved by the sink at send time
    Component {
        component_type: ComponentType,
        component_id: u64,
    },
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Endpoint(endpoint) => write!(f, "{endpoint}"),
            Recipient::Component {
                component_type,
                component_id,
            } => write!(f, "{component_type}:{component_id}"),
        }
    }
}

/// Which creation callback a by-DBID load answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Create on the requesting node
    #[default]
    Local,
    /// Create on whichever node the requester picks
    Anywhere,
}

/// Typed task results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum OutboundMessage {
    RawCommandResult {
        callback_id: u64,
        error: Option<String>,
        rows: QueryRows,
    },
    WriteEntityResult {
        entity_id: i32,
        dbid: Dbid,
        db_index: u16,
        callback_id: u64,
        success: bool,
    },
    DeleteEntityResult {
        success: bool,
        holder: Option<EntityHolder>,
        callback_id: u64,
        entity_type: EntityTypeId,
        dbid: Dbid,
    },
    LookUpEntityResult {
        success: bool,
        holder: Option<EntityHolder>,
        callback_id: u64,
        entity_type: EntityTypeId,
        dbid: Dbid,
    },
    AutoLoadResult {
        db_index: u16,
        entity_type: EntityTypeId,
        dbids: Vec<Dbid>,
    },
    QueryEntityResult {
        mode: QueryMode,
        db_index: u16,
        entity_type: EntityTypeId,
        dbid: Dbid,
        callback_id: u64,
        success: bool,
        entity_id: i32,
        /// Holder that already had the entity online
        was_active: Option<EntityHolder>,
        payload: Option<Vec<u8>>,
    },
    QueryAccountResult {
        db_index: u16,
        account_name: String,
        dbid: Dbid,
        success: bool,
        entity_id: i32,
        flags: AccountFlags,
        deadline: u64,
        payload: Option<Vec<u8>>,
        error: Option<String>,
    },
    CreateAccountResult {
        result: ServerErrorCode,
        register_name: String,
        reply_datas: Vec<u8>,
    },
    CreateMailAccountResult {
        result: ServerErrorCode,
        register_name: String,
        /// Code to mail to the address being registered
        verification_code: Option<String>,
    },
    AccountActivated {
        code: String,
        result: ServerErrorCode,
    },
    ResetPasswordRequested {
        account_name: String,
        email: String,
        result: ServerErrorCode,
        verification_code: Option<String>,
    },
    PasswordReset {
        code: String,
        result: ServerErrorCode,
    },
    BindEmailRequested {
        entity_id: i32,
        account_name: String,
        email: String,
        result: ServerErrorCode,
        verification_code: Option<String>,
    },
    EmailBound {
        code: String,
        result: ServerErrorCode,
    },
    PasswordChanged {
        entity_id: i32,
        account_name: String,
        result: ServerErrorCode,
    },
    LoginResult {
        result: ServerErrorCode,
        login_name: String,
        account_name: String,
        /// Holder of the account entity when `result` is `AccountIsOnline`
        holder: Option<EntityHolder>,
        dbid: Dbid,
        flags: AccountFlags,
        deadline: u64,
        reply_datas: Vec<u8>,
    },
}

impl OutboundMessage {
    /// Result code common to every message
    pub fn result_code(&self) -> ServerErrorCode {
        let from_flag = |success: bool| {
            if success {
                ServerErrorCode::Success
            } else {
                ServerErrorCode::OpFailed
            }
        };

        match self {
            OutboundMessage::RawCommandResult { error, .. } => {
                if error.is_some() {
                    ServerErrorCode::DbError
                } else {
                    ServerErrorCode::Success
                }
            }
            OutboundMessage::WriteEntityResult { success, .. }
            | OutboundMessage::DeleteEntityResult { success, .. }
            | OutboundMessage::QueryAccountResult { success, .. } => from_flag(*success),
            OutboundMessage::LookUpEntityResult { success, .. } => {
                if *success {
                    ServerErrorCode::Success
                } else {
                    ServerErrorCode::EntityNotFound
                }
            }
            OutboundMessage::QueryEntityResult {
                success,
                was_active,
                ..
            } => match (success, was_active) {
                (true, _) => ServerErrorCode::Success,
                (false, Some(_)) => ServerErrorCode::AccountIsOnline,
                (false, None) => ServerErrorCode::EntityNotFound,
            },
            OutboundMessage::AutoLoadResult { .. } => ServerErrorCode::Success,
            OutboundMessage::CreateAccountResult { result, .. }
            | OutboundMessage::CreateMailAccountResult { result, .. }
            | OutboundMessage::AccountActivated { result, .. }
            | OutboundMessage::ResetPasswordRequested { result, .. }
            | OutboundMessage::PasswordReset { result, .. }
            | OutboundMessage::BindEmailRequested { result, .. }
            | OutboundMessage::EmailBound { result, .. }
            | OutboundMessage::PasswordChanged { result, .. }
            | OutboundMessage::LoginResult { result, .. } => *result,
        }
    }

    /// Snake-case message name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::RawCommandResult { .. } => "raw_command_result",
            OutboundMessage::WriteEntityResult { .. } => "write_entity_result",
            OutboundMessage::DeleteEntityResult { .. } => "delete_entity_result",
            OutboundMessage::LookUpEntityResult { .. } => "look_up_entity_result",
            OutboundMessage::AutoLoadResult { .. } => "auto_load_result",
            OutboundMessage::QueryEntityResult { .. } => "query_entity_result",
            OutboundMessage::QueryAccountResult { .. } => "query_account_result",
            OutboundMessage::CreateAccountResult { .. } => "create_account_result",
            OutboundMessage::CreateMailAccountResult { .. } => "create_mail_account_result",
            OutboundMessage::AccountActivated { .. } => "account_activated",
            OutboundMessage::ResetPasswordRequested { .. } => "reset_password_requested",
            OutboundMessage::PasswordReset { .. } => "password_reset",
            OutboundMessage::BindEmailRequested { .. } => "bind_email_requested",
            OutboundMessage::EmailBound { .. } => "email_bound",
            OutboundMessage::PasswordChanged { .. } => "password_changed",
            OutboundMessage::LoginResult { .. } => "login_result",
        }
    }
}

/// A message together with its addressee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub recipient: Recipient,
    pub message: OutboundMessage,
}

impl Reply {
    pub fn to(recipient: Recipient, message: OutboundMessage) -> Self {
        Self { recipient, message }
    }

    /// Reply addressed to the task's requester
    pub fn to_requester(requester: &Endpoint, message: OutboundMessage) -> Self {
        Self::to(Recipient::Endpoint(requester.clone()), message)
    }
}
