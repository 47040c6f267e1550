//! # System Constants
//!
//! Result codes, account flags and component roles shared by every task type.
//! The numeric values are part of the contract with front-end processes, which
//! echo them to game clients, so they must never be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result code carried by every outbound task result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ServerErrorCode {
    Success = 0,
    SrvNoReady = 1,
    NameError = 2,
    PasswordError = 3,
    NotFoundAccount = 4,
    AccountCreateFailed = 5,
    AccountExists = 6,
    AccountIsOnline = 7,
    AccountNotActivated = 8,
    CannotUseMail = 9,
    InvalidCode = 10,
    OpFailed = 11,
    DbError = 12,
    EntityNotFound = 13,
}

impl ServerErrorCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::SrvNoReady => "server_not_ready",
            Self::NameError => "name_error",
            Self::PasswordError => "password_error",
            Self::NotFoundAccount => "account_not_found",
            Self::AccountCreateFailed => "account_create_failed",
            Self::AccountExists => "account_exists",
            Self::AccountIsOnline => "account_is_online",
            Self::AccountNotActivated => "account_not_activated",
            Self::CannotUseMail => "cannot_use_mail",
            Self::InvalidCode => "invalid_code",
            Self::OpFailed => "op_failed",
            Self::DbError => "db_error",
            Self::EntityNotFound => "entity_not_found",
        };
        write!(f, "{name}")
    }
}

/// Account status flags stored alongside each account record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountFlags(pub u32);

impl AccountFlags {
    pub const NORMAL: AccountFlags = AccountFlags(0x0);
    pub const LOCK: AccountFlags = AccountFlags(0x1);
    pub const NOT_ACTIVATED: AccountFlags = AccountFlags(0x2);

    pub fn is_normal(&self) -> bool {
        *self == Self::NORMAL
    }

    pub fn is_not_activated(&self) -> bool {
        self.0 & Self::NOT_ACTIVATED.0 != 0
    }

    pub fn with(self, other: AccountFlags) -> AccountFlags {
        AccountFlags(self.0 | other.0)
    }

    pub fn without(self, other: AccountFlags) -> AccountFlags {
        AccountFlags(self.0 & !other.0)
    }
}

/// Cluster component roles that can receive a task result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Front-end node hosting base entities (world simulation)
    Baseapp,
    /// Front-end node hosting spatial entities
    Cellapp,
    /// Login gateway
    Loginapp,
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseapp => write!(f, "baseapp"),
            Self::Cellapp => write!(f, "cellapp"),
            Self::Loginapp => write!(f, "loginapp"),
        }
    }
}

/// What a verification code unlocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPurpose {
    CreateAccount,
    ResetPassword,
    BindEmail,
}

impl fmt::Display for VerificationPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateAccount => write!(f, "create_account"),
            Self::ResetPassword => write!(f, "reset_password"),
            Self::BindEmail => write!(f, "bind_email"),
        }
    }
}

/// Account naming policy applied by the login gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Normal,
    Email,
    Smart,
}

/// Suffix of the placeholder email given to directly created accounts
pub const PLACEHOLDER_EMAIL_DOMAIN: &str = "@0.0";
