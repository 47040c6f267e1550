//! # Account Lifecycle Tasks
//!
//! Accounts move `UNREGISTERED → NOT_ACTIVATED → NORMAL`. Direct creation skips
//! the middle state; mail creation parks the account there until a
//! CREATE_ACCOUNT code is consumed. Password reset and email binding also go
//! through one-time codes, which the store hands out at most once.
//!
//! Store calls inside one background phase are not atomic with each other, so
//! every task keeps enough progress in its own fields to make a RETRY pick up
//! where the lost connection left it: an allocated entity DBID is reused, an
//! issued or consumed code is kept, the login counter is bumped once.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::credentials::{
    credential_digest, digest_matches, generate_verification_code, is_valid_email,
};
use super::{claim, unresolved};
use crate::constants::{
    AccountFlags, AccountType, ServerErrorCode, VerificationPurpose, PLACEHOLDER_EMAIL_DOMAIN,
};
use crate::database::{
    AccountRecord, AccountTable, Dbid, EntityStore, StoreError, VerificationRecord,
    VerificationTable,
};
use crate::execution::{CompletionContext, Task, TaskContext};
use crate::messaging::{Endpoint, OutboundMessage, Reply};
use crate::registry::{EntityHolder, LogOutcome};
use crate::resilience::Fault;

/// Code for an account that exists but may not log in
fn inactive_code(flags: AccountFlags) -> ServerErrorCode {
    if flags.is_not_activated() {
        ServerErrorCode::AccountNotActivated
    } else {
        ServerErrorCode::OpFailed
    }
}

fn default_success() -> ServerErrorCode {
    ServerErrorCode::Success
}

/// Progress of a direct account write, kept across retries
#[derive(Debug, Clone, Default)]
struct AccountWriteProgress {
    entity_dbid: Dbid,
    /// The account row update has been sent at least once
    row_sent: bool,
}

enum AccountWrite {
    Created(Dbid),
    Refused(ServerErrorCode),
}

/// Create `name` as an active account, reusing a NOT_ACTIVATED row if present
fn write_account(
    ctx: &TaskContext<'_>,
    name: &str,
    password: &str,
    datas: &[u8],
    progress: &mut AccountWriteProgress,
) -> Result<AccountWrite, Fault> {
    if name.is_empty() {
        return Ok(AccountWrite::Refused(ServerErrorCode::NameError));
    }

    let existing = ctx.store(|store| store.query_account(name))?;
    if let Some(account) = &existing {
        // A row we already wrote in an earlier attempt is not a duplicate
        let ours = progress.row_sent && account.dbid == progress.entity_dbid;
        if !account.flags.is_not_activated() && !ours {
            return Ok(AccountWrite::Refused(ServerErrorCode::AccountExists));
        }
    }

    let accounts = ctx.accounts();
    if progress.entity_dbid == 0 {
        let reusable = existing.as_ref().map_or(0, |account| account.dbid);
        progress.entity_dbid = if reusable != 0 {
            reusable
        } else {
            let entity_type = accounts.account_entity_type;
            ctx.store(|store| store.write_entity(0, Some(false), &[], entity_type))?
        };
    }
    let dbid = progress.entity_dbid;
    let digest = credential_digest(password);
    progress.row_sent = true;

    match existing {
        None => {
            let record = AccountRecord {
                name: name.to_string(),
                password_digest: digest,
                email: format!("{name}{PLACEHOLDER_EMAIL_DOMAIN}"),
                flags: accounts.default_flags,
                deadline: accounts.deadline_from_now(),
                dbid,
                datas: datas.to_vec(),
                login_count: 0,
            };
            ctx.store(|store| store.log_account(&record))?;
        }
        Some(account) => {
            // dbid first: a retry recognises the row by it
            ctx.store(|store| store.set_dbid(name, dbid))?;
            ctx.store(|store| store.update_password(name, &digest))?;
            ctx.store(|store| {
                store.set_flags_deadline(
                    name,
                    account.flags.without(AccountFlags::NOT_ACTIVATED),
                    account.deadline,
                )
            })?;
        }
    }

    Ok(AccountWrite::Created(dbid))
}

/// Take a one-time code, remembering it so a retry does not take it again
fn consume_code(
    ctx: &TaskContext<'_>,
    taken: &mut Option<VerificationRecord>,
    code: &str,
    purpose: VerificationPurpose,
) -> Result<Option<VerificationRecord>, Fault> {
    if taken.is_none() {
        *taken = ctx.store(|store| store.take_verification(code, purpose))?;
    }
    Ok(taken.clone())
}

/// Issue `slot`'s code once, then store it as pending
fn issue_code(
    ctx: &TaskContext<'_>,
    slot: &mut Option<String>,
    seed: &str,
    record: impl FnOnce(String) -> VerificationRecord,
) -> Result<(), Fault> {
    let code = slot
        .get_or_insert_with(|| generate_verification_code(seed))
        .clone();
    let record = record(code);
    ctx.store(|store| store.log_verification(&record))
}

/// Register an account that can log in immediately
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub register_name: String,
    pub password: String,
    /// Opaque client payload stored with the account
    #[serde(default)]
    pub datas: Vec<u8>,
    #[serde(skip)]
    progress: AccountWriteProgress,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl CreateAccount {
    pub fn new(register_name: impl Into<String>, password: impl Into<String>, datas: Vec<u8>) -> Self {
        Self {
            register_name: register_name.into(),
            password: password.into(),
            datas,
            progress: AccountWriteProgress::default(),
            result: unresolved(),
        }
    }
}

impl Task for CreateAccount {
    fn kind(&self) -> &'static str {
        "create_account"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.result = match write_account(
            ctx,
            &self.register_name,
            &self.password,
            &self.datas,
            &mut self.progress,
        )? {
            AccountWrite::Created(dbid) => {
                info!(account = %self.register_name, dbid, "👤 Account created");
                ServerErrorCode::Success
            }
            AccountWrite::Refused(code) => code,
        };
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::CreateAccountResult {
                result: self.result,
                register_name: self.register_name.clone(),
                reply_datas: self.datas.clone(),
            },
        ))
    }
}

/// Register an account by email; it stays NOT_ACTIVATED until the mailed code is used
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMailAccount {
    /// The email address doubles as the login name
    pub register_name: String,
    pub password: String,
    #[serde(default)]
    pub datas: Vec<u8>,
    #[serde(skip)]
    code: Option<String>,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl CreateMailAccount {
    pub fn new(register_name: impl Into<String>, password: impl Into<String>, datas: Vec<u8>) -> Self {
        Self {
            register_name: register_name.into(),
            password: password.into(),
            datas,
            code: None,
            result: unresolved(),
        }
    }
}

impl Task for CreateMailAccount {
    fn kind(&self) -> &'static str {
        "create_mail_account"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let name = self.register_name.as_str();
        if name.is_empty() || !is_valid_email(name) {
            self.result = ServerErrorCode::NameError;
            return Ok(());
        }

        let existing = ctx.store(|store| store.query_account(name))?;
        if existing
            .as_ref()
            .is_some_and(|account| !account.flags.is_not_activated())
        {
            self.result = ServerErrorCode::AccountExists;
            return Ok(());
        }

        let digest = credential_digest(&self.password);
        match existing {
            None => {
                let accounts = ctx.accounts();
                let record = AccountRecord {
                    name: name.to_string(),
                    password_digest: digest.clone(),
                    email: name.to_string(),
                    flags: accounts.default_flags.with(AccountFlags::NOT_ACTIVATED),
                    deadline: accounts.deadline_from_now(),
                    dbid: 0,
                    datas: self.datas.clone(),
                    login_count: 0,
                };
                ctx.store(|store| store.log_account(&record))?;
            }
            // pending registration asked again: the newest credential wins
            Some(_) => {
                ctx.store(|store| store.update_password(name, &digest))?;
            }
        }

        issue_code(ctx, &mut self.code, &self.password, |code| VerificationRecord {
            purpose: VerificationPurpose::CreateAccount,
            account_name: name.to_string(),
            code,
            email: name.to_string(),
            password_digest: Some(digest),
        })?;
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::CreateMailAccountResult {
                result: self.result,
                register_name: self.register_name.clone(),
                verification_code: self.code.clone().filter(|_| self.result.is_success()),
            },
        ))
    }
}

/// Consume a CREATE_ACCOUNT code and activate the account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateAccount {
    pub code: String,
    #[serde(skip)]
    taken: Option<VerificationRecord>,
    #[serde(skip)]
    entity_dbid: Dbid,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl ActivateAccount {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            taken: None,
            entity_dbid: 0,
            result: unresolved(),
        }
    }
}

impl Task for ActivateAccount {
    fn kind(&self) -> &'static str {
        "activate_account"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let Some(record) = consume_code(
            ctx,
            &mut self.taken,
            &self.code,
            VerificationPurpose::CreateAccount,
        )?
        else {
            self.result = ServerErrorCode::InvalidCode;
            return Ok(());
        };

        let name = record.account_name.as_str();
        let Some(account) = ctx.store(|store| store.query_account(name))? else {
            error!(account = %name, "Verification code names an account with no row");
            self.result = ServerErrorCode::DbError;
            return Ok(());
        };

        if self.entity_dbid == 0 {
            self.entity_dbid = if account.dbid != 0 {
                account.dbid
            } else {
                let entity_type = ctx.accounts().account_entity_type;
                ctx.store(|store| store.write_entity(0, Some(false), &[], entity_type))?
            };
        }
        let dbid = self.entity_dbid;

        ctx.store(|store| store.set_dbid(name, dbid))?;
        if let Some(digest) = &record.password_digest {
            ctx.store(|store| store.update_password(name, digest))?;
        }
        ctx.store(|store| {
            store.set_flags_deadline(
                name,
                account.flags.without(AccountFlags::NOT_ACTIVATED),
                account.deadline,
            )
        })?;

        info!(account = %name, dbid, "✅ Account activated");
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::AccountActivated {
                code: self.code.clone(),
                result: self.result,
            },
        ))
    }
}

/// Issue a RESET_PASSWORD code for an active account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResetPassword {
    pub account_name: String,
    #[serde(skip)]
    code: Option<String>,
    #[serde(skip)]
    email: String,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl RequestResetPassword {
    pub fn new(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            code: None,
            email: String::new(),
            result: unresolved(),
        }
    }
}

impl Task for RequestResetPassword {
    fn kind(&self) -> &'static str {
        "request_reset_password"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let name = self.account_name.as_str();
        if name.is_empty() {
            self.result = ServerErrorCode::NameError;
            return Ok(());
        }

        let Some(account) = ctx.store(|store| store.query_account(name))? else {
            self.result = ServerErrorCode::NotFoundAccount;
            return Ok(());
        };
        if account.dbid == 0 || !account.flags.is_normal() {
            self.result = inactive_code(account.flags);
            return Ok(());
        }

        self.email = account.email.clone();
        issue_code(ctx, &mut self.code, name, |code| VerificationRecord {
            purpose: VerificationPurpose::ResetPassword,
            account_name: name.to_string(),
            code,
            email: account.email,
            password_digest: None,
        })?;
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::ResetPasswordRequested {
                account_name: self.account_name.clone(),
                email: self.email.clone(),
                result: self.result,
                verification_code: self.code.clone().filter(|_| self.result.is_success()),
            },
        ))
    }
}

/// Consume a RESET_PASSWORD code and install a new credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetPassword {
    pub account_name: String,
    pub new_password: String,
    pub code: String,
    #[serde(skip)]
    taken: Option<VerificationRecord>,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl ResetPassword {
    pub fn new(
        account_name: impl Into<String>,
        new_password: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            new_password: new_password.into(),
            code: code.into(),
            taken: None,
            result: unresolved(),
        }
    }
}

impl Task for ResetPassword {
    fn kind(&self) -> &'static str {
        "reset_password"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let record = consume_code(
            ctx,
            &mut self.taken,
            &self.code,
            VerificationPurpose::ResetPassword,
        )?;
        // A code presented for the wrong account is burnt all the same
        let Some(record) = record.filter(|record| record.account_name == self.account_name) else {
            self.result = ServerErrorCode::InvalidCode;
            return Ok(());
        };

        let name = record.account_name.as_str();
        let Some(account) = ctx.store(|store| store.query_account(name))? else {
            self.result = ServerErrorCode::NotFoundAccount;
            return Ok(());
        };
        if !account.flags.is_normal() {
            self.result = inactive_code(account.flags);
            return Ok(());
        }

        let digest = credential_digest(&self.new_password);
        ctx.store(|store| store.update_password(name, &digest))?;
        info!(account = %name, "🔑 Password reset");
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::PasswordReset {
                code: self.code.clone(),
                result: self.result,
            },
        ))
    }
}

/// Issue a BIND_EMAIL code after checking the account's credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBindEmail {
    /// Proxy entity on the requesting node, echoed back
    pub entity_id: i32,
    pub account_name: String,
    pub password: String,
    pub email: String,
    #[serde(skip)]
    code: Option<String>,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl RequestBindEmail {
    pub fn new(
        entity_id: i32,
        account_name: impl Into<String>,
        password: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            entity_id,
            account_name: account_name.into(),
            password: password.into(),
            email: email.into(),
            code: None,
            result: unresolved(),
        }
    }
}

impl Task for RequestBindEmail {
    fn kind(&self) -> &'static str {
        "request_bind_email"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let name = self.account_name.as_str();
        let Some(account) = ctx.store(|store| store.query_account(name))? else {
            self.result = ServerErrorCode::NotFoundAccount;
            return Ok(());
        };
        if account.dbid == 0 || !account.flags.is_normal() {
            self.result = inactive_code(account.flags);
            return Ok(());
        }
        if !digest_matches(&account.password_digest, &self.password) {
            self.result = ServerErrorCode::PasswordError;
            return Ok(());
        }
        if !is_valid_email(&self.email) {
            self.result = ServerErrorCode::OpFailed;
            return Ok(());
        }

        let email = self.email.clone();
        issue_code(ctx, &mut self.code, name, |code| VerificationRecord {
            purpose: VerificationPurpose::BindEmail,
            account_name: name.to_string(),
            code,
            email,
            password_digest: None,
        })?;
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::BindEmailRequested {
                entity_id: self.entity_id,
                account_name: self.account_name.clone(),
                email: self.email.clone(),
                result: self.result,
                verification_code: self.code.clone().filter(|_| self.result.is_success()),
            },
        ))
    }
}

/// Consume a BIND_EMAIL code and store the address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindEmail {
    pub account_name: String,
    pub code: String,
    #[serde(skip)]
    taken: Option<VerificationRecord>,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl BindEmail {
    pub fn new(account_name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            code: code.into(),
            taken: None,
            result: unresolved(),
        }
    }
}

impl Task for BindEmail {
    fn kind(&self) -> &'static str {
        "bind_email"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let record = consume_code(ctx, &mut self.taken, &self.code, VerificationPurpose::BindEmail)?;
        let Some(record) = record.filter(|record| record.account_name == self.account_name) else {
            self.result = ServerErrorCode::InvalidCode;
            return Ok(());
        };

        let bound = ctx.store(|store| store.set_email(&record.account_name, &record.email))?;
        self.result = if bound {
            ServerErrorCode::Success
        } else {
            ServerErrorCode::NotFoundAccount
        };
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::EmailBound {
                code: self.code.clone(),
                result: self.result,
            },
        ))
    }
}

/// Replace the credential of a logged-in account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePassword {
    pub entity_id: i32,
    pub account_name: String,
    pub old_password: String,
    pub new_password: String,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
}

impl ChangePassword {
    pub fn new(
        entity_id: i32,
        account_name: impl Into<String>,
        old_password: impl Into<String>,
        new_password: impl Into<String>,
    ) -> Self {
        Self {
            entity_id,
            account_name: account_name.into(),
            old_password: old_password.into(),
            new_password: new_password.into(),
            result: unresolved(),
        }
    }
}

impl Task for ChangePassword {
    fn kind(&self) -> &'static str {
        "change_password"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        let name = self.account_name.as_str();
        let Some(account) = ctx.store(|store| store.query_account(name))? else {
            self.result = ServerErrorCode::NotFoundAccount;
            return Ok(());
        };
        if account.dbid == 0 || !account.flags.is_normal() {
            self.result = inactive_code(account.flags);
            return Ok(());
        }
        if !digest_matches(&account.password_digest, &self.old_password) {
            self.result = ServerErrorCode::PasswordError;
            return Ok(());
        }

        let digest = credential_digest(&self.new_password);
        ctx.store(|store| store.update_password(name, &digest))?;
        self.result = ServerErrorCode::Success;
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::PasswordChanged {
                entity_id: self.entity_id,
                account_name: self.account_name.clone(),
                result: self.result,
            },
        ))
    }
}

/// Authenticate a login and take the account entity online
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLogin {
    /// Name the client typed
    pub login_name: String,
    /// Name the account is stored under, after any gateway mapping
    pub account_name: String,
    pub password: String,
    /// The external authenticator accepted the credential
    #[serde(default)]
    pub vouched: bool,
    /// Verdict of the external authenticator; anything but success is passed through
    #[serde(default = "default_success")]
    pub upstream_result: ServerErrorCode,
    /// Stored with the account if the login creates it
    #[serde(default)]
    pub client_datas: Vec<u8>,
    /// Echoed back to the gateway
    #[serde(default)]
    pub reply_datas: Vec<u8>,
    /// Node and proxy entity that will hold the account online
    pub component_id: u64,
    pub entity_id: i32,
    /// Where the holding node listens; defaults to the requester
    #[serde(default)]
    pub holder_endpoint: Option<Endpoint>,
    #[serde(skip, default = "unresolved")]
    result: ServerErrorCode,
    #[serde(skip)]
    holder: Option<EntityHolder>,
    #[serde(skip)]
    dbid: Dbid,
    #[serde(skip)]
    flags: AccountFlags,
    #[serde(skip)]
    deadline: u64,
    #[serde(skip)]
    write: AccountWriteProgress,
    #[serde(skip)]
    counted: bool,
    #[serde(skip)]
    claim_attempted: bool,
}

impl AccountLogin {
    pub fn new(
        account_name: impl Into<String>,
        password: impl Into<String>,
        component_id: u64,
        entity_id: i32,
    ) -> Self {
        let account_name = account_name.into();
        Self {
            login_name: account_name.clone(),
            account_name,
            password: password.into(),
            vouched: false,
            upstream_result: ServerErrorCode::Success,
            client_datas: Vec::new(),
            reply_datas: Vec::new(),
            component_id,
            entity_id,
            holder_endpoint: None,
            result: unresolved(),
            holder: None,
            dbid: 0,
            flags: AccountFlags::NORMAL,
            deadline: 0,
            write: AccountWriteProgress::default(),
            counted: false,
            claim_attempted: false,
        }
    }

    /// Mark the credential as vouched for by the external authenticator
    pub fn vouched(mut self) -> Self {
        self.vouched = true;
        self
    }

    pub fn with_holder_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.holder_endpoint = Some(endpoint);
        self
    }

    pub fn with_upstream_result(mut self, result: ServerErrorCode) -> Self {
        self.upstream_result = result;
        self
    }
}

impl Task for AccountLogin {
    fn kind(&self) -> &'static str {
        "account_login"
    }

    fn run_background(&mut self, ctx: &TaskContext<'_>) -> Result<(), Fault> {
        self.holder = None;
        if !self.upstream_result.is_success() {
            self.result = self.upstream_result;
            return Ok(());
        }
        if self.account_name.is_empty() {
            self.result = ServerErrorCode::NameError;
            return Ok(());
        }

        let accounts = ctx.accounts();
        let mut account = ctx.store(|store| store.query_account(&self.account_name))?;

        if account.is_none() {
            if accounts.account_type != AccountType::Normal && is_valid_email(&self.account_name) {
                self.result = ServerErrorCode::CannotUseMail;
                return Ok(());
            }
            if !accounts.auto_create_allowed(self.vouched) {
                self.result = ServerErrorCode::NotFoundAccount;
                return Ok(());
            }

            let written = write_account(
                ctx,
                &self.account_name,
                &self.password,
                &self.client_datas,
                &mut self.write,
            )?;
            if let AccountWrite::Refused(code) = written {
                error!(account = %self.account_name, refused = %code, "Auto-create on login failed");
                self.result = ServerErrorCode::DbError;
                return Ok(());
            }
            info!(account = %self.account_name, "👤 Unknown account auto-created on login");
            account = ctx.store(|store| store.query_account(&self.account_name))?;
        }

        let Some(account) = account else {
            error!(account = %self.account_name, "Account row missing right after it was written");
            self.result = ServerErrorCode::DbError;
            return Ok(());
        };
        self.flags = account.flags;
        self.deadline = account.deadline;

        if account.dbid == 0 || !account.flags.is_normal() {
            self.result = inactive_code(account.flags);
            return Ok(());
        }
        if !accounts.skip_digest_check(self.vouched)
            && !digest_matches(&account.password_digest, &self.password)
        {
            self.result = ServerErrorCode::PasswordError;
            return Ok(());
        }

        self.dbid = account.dbid;
        if !self.counted {
            ctx.store(|store| store.update_login_count(&self.account_name, account.dbid))?;
            self.counted = true;
        }

        let holder = EntityHolder::new(
            self.component_id,
            self.entity_id,
            self.holder_endpoint
                .clone()
                .unwrap_or_else(|| ctx.requester().clone()),
        );
        self.result = match claim(
            ctx,
            account.dbid,
            accounts.account_entity_type,
            &holder,
            &mut self.claim_attempted,
        )? {
            LogOutcome::Logged => ServerErrorCode::Success,
            LogOutcome::AlreadyHeld(existing) => {
                warn!(
                    account = %self.account_name,
                    dbid = account.dbid,
                    holder = %existing,
                    "Login refused, account is already online"
                );
                self.holder = Some(existing);
                ServerErrorCode::AccountIsOnline
            }
        };
        Ok(())
    }

    fn record_failure(&mut self, _error: &StoreError) {
        self.result = ServerErrorCode::DbError;
    }

    fn completion(&self, ctx: &CompletionContext<'_>) -> Option<Reply> {
        Some(Reply::to_requester(
            ctx.requester,
            OutboundMessage::LoginResult {
                result: self.result,
                login_name: self.login_name.clone(),
                account_name: self.account_name.clone(),
                holder: self.holder.clone(),
                dbid: self.dbid,
                flags: self.flags,
                deadline: self.deadline,
                reply_datas: self.reply_datas.clone(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountsConfig;
    use crate::registry::EntityRegistry;
    use crate::tasks::testing::Harness;

    fn result_of(message: Option<OutboundMessage>) -> ServerErrorCode {
        message.map_or(ServerErrorCode::OpFailed, |message| message.result_code())
    }

    fn login(harness: &Harness, name: &str, password: &str, entity_id: i32) -> OutboundMessage {
        let mut task = AccountLogin::new(name, password, 1, entity_id);
        harness.run(&mut task, "loginapp-1").unwrap()
    }

    #[test]
    fn test_create_then_duplicate() {
        let harness = Harness::new();
        let mut create = CreateAccount::new("alice", "pw1", Vec::new());
        assert_eq!(result_of(harness.run(&mut create, "loginapp-1")), ServerErrorCode::Success);

        let account = harness.store.query_account("alice").unwrap().unwrap();
        assert!(account.flags.is_normal());
        assert!(account.dbid > 0);
        assert_eq!(account.email, "alice@0.0");
        assert!(digest_matches(&account.password_digest, "pw1"));

        let mut again = CreateAccount::new("alice", "other", Vec::new());
        assert_eq!(
            result_of(harness.run(&mut again, "loginapp-1")),
            ServerErrorCode::AccountExists
        );
    }

    #[test]
    fn test_create_with_empty_name() {
        let harness = Harness::new();
        let mut create = CreateAccount::new("", "pw1", Vec::new());
        assert_eq!(result_of(harness.run(&mut create, "loginapp-1")), ServerErrorCode::NameError);
    }

    #[test]
    fn test_mail_account_activation_is_single_use() {
        let harness = Harness::new();
        let mut create = CreateMailAccount::new("bob@example.com", "pw1", Vec::new());
        let Some(OutboundMessage::CreateMailAccountResult {
            result,
            verification_code: Some(code),
            ..
        }) = harness.run(&mut create, "loginapp-1")
        else {
            panic!("expected a verification code");
        };
        assert!(result.is_success());

        // cannot log in before activation
        let reply = login(&harness, "bob@example.com", "pw1", 3);
        assert_eq!(reply.result_code(), ServerErrorCode::AccountNotActivated);

        let mut activate = ActivateAccount::new(code.clone());
        assert_eq!(result_of(harness.run(&mut activate, "loginapp-1")), ServerErrorCode::Success);
        let account = harness.store.query_account("bob@example.com").unwrap().unwrap();
        assert!(account.flags.is_normal());
        assert!(account.dbid > 0);

        let mut replay = ActivateAccount::new(code);
        assert_eq!(result_of(harness.run(&mut replay, "loginapp-1")), ServerErrorCode::InvalidCode);

        assert_eq!(login(&harness, "bob@example.com", "pw1", 3).result_code(), ServerErrorCode::Success);
    }

    #[test]
    fn test_pending_mail_account_can_be_created_directly() {
        let harness = Harness::new();
        let mut pending = CreateMailAccount::new("carol@example.com", "pw1", Vec::new());
        harness.run(&mut pending, "loginapp-1");

        let mut direct = CreateAccount::new("carol@example.com", "pw2", Vec::new());
        assert_eq!(result_of(harness.run(&mut direct, "loginapp-1")), ServerErrorCode::Success);

        let account = harness.store.query_account("carol@example.com").unwrap().unwrap();
        assert!(account.flags.is_normal());
        assert!(digest_matches(&account.password_digest, "pw2"));
    }

    #[test]
    fn test_reset_password_flow() {
        let harness = Harness::new();
        harness.run(&mut CreateAccount::new("alice", "pw1", Vec::new()), "loginapp-1");

        let mut request = RequestResetPassword::new("alice");
        let Some(OutboundMessage::ResetPasswordRequested {
            verification_code: Some(code),
            email,
            ..
        }) = harness.run(&mut request, "loginapp-1")
        else {
            panic!("expected a verification code");
        };
        assert_eq!(email, "alice@0.0");

        let mut reset = ResetPassword::new("alice", "pw2", code.clone());
        assert_eq!(result_of(harness.run(&mut reset, "loginapp-1")), ServerErrorCode::Success);

        let mut replay = ResetPassword::new("alice", "pw3", code);
        assert_eq!(result_of(harness.run(&mut replay, "loginapp-1")), ServerErrorCode::InvalidCode);

        assert_eq!(login(&harness, "alice", "pw1", 1).result_code(), ServerErrorCode::PasswordError);
        assert_eq!(login(&harness, "alice", "pw2", 1).result_code(), ServerErrorCode::Success);
    }

    #[test]
    fn test_reset_code_for_another_account_is_burnt() {
        let harness = Harness::new();
        harness.run(&mut CreateAccount::new("alice", "pw1", Vec::new()), "loginapp-1");
        let mut request = RequestResetPassword::new("alice");
        let Some(OutboundMessage::ResetPasswordRequested {
            verification_code: Some(code),
            ..
        }) = harness.run(&mut request, "loginapp-1")
        else {
            panic!("expected a verification code");
        };

        let mut wrong = ResetPassword::new("mallory", "pw9", code.clone());
        assert_eq!(result_of(harness.run(&mut wrong, "loginapp-1")), ServerErrorCode::InvalidCode);
        let mut right = ResetPassword::new("alice", "pw2", code);
        assert_eq!(result_of(harness.run(&mut right, "loginapp-1")), ServerErrorCode::InvalidCode);
    }

    #[test]
    fn test_reset_request_for_unknown_account() {
        let harness = Harness::new();
        let mut request = RequestResetPassword::new("nobody");
        assert_eq!(
            result_of(harness.run(&mut request, "loginapp-1")),
            ServerErrorCode::NotFoundAccount
        );
        assert_eq!(harness.store.pending_verifications(), 0);
    }

    #[test]
    fn test_bind_email_flow() {
        let harness = Harness::new();
        harness.run(&mut CreateAccount::new("alice", "pw1", Vec::new()), "loginapp-1");

        let mut bad_password = RequestBindEmail::new(9, "alice", "nope", "alice@example.com");
        assert_eq!(
            result_of(harness.run(&mut bad_password, "baseapp-1")),
            ServerErrorCode::PasswordError
        );

        let mut bad_address = RequestBindEmail::new(9, "alice", "pw1", "not-an-address");
        assert_eq!(result_of(harness.run(&mut bad_address, "baseapp-1")), ServerErrorCode::OpFailed);

        let mut request = RequestBindEmail::new(9, "alice", "pw1", "alice@example.com");
        let Some(OutboundMessage::BindEmailRequested {
            verification_code: Some(code),
            ..
        }) = harness.run(&mut request, "baseapp-1")
        else {
            panic!("expected a verification code");
        };

        let mut bind = BindEmail::new("alice", code.clone());
        assert_eq!(result_of(harness.run(&mut bind, "loginapp-1")), ServerErrorCode::Success);
        let account = harness.store.query_account("alice").unwrap().unwrap();
        assert_eq!(account.email, "alice@example.com");

        let mut replay = BindEmail::new("alice", code);
        assert_eq!(result_of(harness.run(&mut replay, "loginapp-1")), ServerErrorCode::InvalidCode);
    }

    #[test]
    fn test_change_password() {
        let harness = Harness::new();
        harness.run(&mut CreateAccount::new("alice", "pw1", Vec::new()), "loginapp-1");

        let mut wrong = ChangePassword::new(4, "alice", "nope", "pw2");
        assert_eq!(result_of(harness.run(&mut wrong, "baseapp-1")), ServerErrorCode::PasswordError);

        let mut change = ChangePassword::new(4, "alice", "pw1", "pw2");
        assert_eq!(result_of(harness.run(&mut change, "baseapp-1")), ServerErrorCode::Success);
        assert_eq!(login(&harness, "alice", "pw2", 1).result_code(), ServerErrorCode::Success);
    }

    #[test]
    fn test_login_logs_holder_and_rejects_second_node() {
        let harness = Harness::new();
        harness.run(&mut CreateAccount::new("alice", "pw1", Vec::new()), "loginapp-1");
        let dbid = harness.store.query_account("alice").unwrap().unwrap().dbid;

        let mut first = AccountLogin::new("alice", "pw1", 1, 100)
            .with_holder_endpoint(Endpoint::new("baseapp-a"));
        let reply = harness.run(&mut first, "loginapp-1").unwrap();
        assert_eq!(reply.result_code(), ServerErrorCode::Success);
        let holder = harness.registry.query_entity(dbid, 1).unwrap().unwrap();
        assert_eq!(holder, EntityHolder::new(1, 100, Endpoint::new("baseapp-a")));

        let mut second = AccountLogin::new("alice", "pw1", 2, 200)
            .with_holder_endpoint(Endpoint::new("baseapp-b"));
        let Some(OutboundMessage::LoginResult {
            result,
            holder: Some(existing),
            ..
        }) = harness.run(&mut second, "loginapp-1")
        else {
            panic!("expected the existing holder");
        };
        assert_eq!(result, ServerErrorCode::AccountIsOnline);
        assert_eq!((existing.component_id, existing.entity_id), (1, 100));
        assert_eq!(harness.store.query_account("alice").unwrap().unwrap().login_count, 2);
    }

    #[test]
    fn test_login_upstream_failure_passes_through() {
        let harness = Harness::new();
        let mut task = AccountLogin::new("alice", "pw1", 1, 1)
            .with_upstream_result(ServerErrorCode::SrvNoReady);
        assert_eq!(result_of(harness.run(&mut task, "loginapp-1")), ServerErrorCode::SrvNoReady);
        assert!(harness.store.query_account("alice").unwrap().is_none());
    }

    #[test]
    fn test_login_auto_create_on_not_found() {
        let harness = Harness::with_accounts(AccountsConfig {
            auto_create_on_not_found: true,
            ..AccountsConfig::default()
        });
        assert_eq!(login(&harness, "dave", "pw1", 7).result_code(), ServerErrorCode::Success);
        assert!(harness.store.query_account("dave").unwrap().is_some());
    }

    #[test]
    fn test_login_auto_create_needs_a_vouch() {
        let harness = Harness::with_accounts(AccountsConfig {
            auto_create_on_not_found: false,
            auto_create_on_external_auth: true,
            external_authenticator_enabled: true,
            ..AccountsConfig::default()
        });
        assert_eq!(login(&harness, "erin", "pw1", 7).result_code(), ServerErrorCode::NotFoundAccount);

        let mut vouched = AccountLogin::new("erin", "pw1", 1, 7).vouched();
        assert_eq!(result_of(harness.run(&mut vouched, "loginapp-1")), ServerErrorCode::Success);

        // the authenticator vouches, so a stale local digest does not matter
        let mut vouched_again = AccountLogin::new("erin", "changed-upstream", 2, 8).vouched();
        let reply = harness.run(&mut vouched_again, "loginapp-1").unwrap();
        assert_eq!(reply.result_code(), ServerErrorCode::AccountIsOnline);
    }

    #[test]
    fn test_login_refuses_email_names_for_non_normal_account_type() {
        let harness = Harness::with_accounts(AccountsConfig {
            auto_create_on_not_found: true,
            account_type: AccountType::Smart,
            ..AccountsConfig::default()
        });
        assert_eq!(
            login(&harness, "frank@example.com", "pw1", 1).result_code(),
            ServerErrorCode::CannotUseMail
        );
        assert_eq!(login(&harness, "frank", "pw1", 1).result_code(), ServerErrorCode::Success);
    }
}
