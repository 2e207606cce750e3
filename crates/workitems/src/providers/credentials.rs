//! Credential store boundary
//!
//! The OAuth handshake and token refresh live outside the engine. The
//! engine only needs to enumerate a user's linked accounts, resolve an
//! access token for one of them, and flag a token as needing re-link.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;

use crate::error::ProviderError;
use crate::models::{AccountId, SourceId, UserId};

/// Credentials filename in the workitems config directory
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Bearer token for one linked account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// A (provider, account) pair linked by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub user_id: UserId,
    pub source_id: SourceId,
    pub account_id: AccountId,
    pub access_token: AccessToken,
    /// Provider-specific site or tenant (e.g. a Jira cloud id)
    #[serde(default)]
    pub site: Option<String>,
}

/// Resolves (user, provider, account) to a usable token
pub trait CredentialStore: Send + Sync {
    /// All accounts a user has linked, across providers
    fn linked_accounts(&self, user_id: &UserId) -> Result<Vec<LinkedAccount>>;

    /// Token for one account; fails with a bad-credential error when the
    /// account is missing or flagged for re-link
    fn access_token(
        &self,
        user_id: &UserId,
        source_id: &SourceId,
        account_id: &AccountId,
    ) -> Result<AccessToken, ProviderError>;

    /// Flag an account's token as rejected so the user is asked to re-link
    fn mark_bad(&self, user_id: &UserId, source_id: &SourceId, account_id: &AccountId);
}

type AccountSlot = (UserId, SourceId, AccountId);

/// Credential store over a fixed list of linked accounts
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    accounts: Vec<LinkedAccount>,
    bad: RwLock<HashSet<AccountSlot>>,
}

impl StaticCredentialStore {
    pub fn new(accounts: Vec<LinkedAccount>) -> Self {
        Self {
            accounts,
            bad: RwLock::new(HashSet::new()),
        }
    }

    /// Whether an account has been flagged for re-link
    pub fn is_bad(&self, user_id: &UserId, source_id: &SourceId, account_id: &AccountId) -> bool {
        self.bad.read().unwrap().contains(&(
            user_id.clone(),
            source_id.clone(),
            account_id.clone(),
        ))
    }
}

impl CredentialStore for StaticCredentialStore {
    fn linked_accounts(&self, user_id: &UserId) -> Result<Vec<LinkedAccount>> {
        Ok(self
            .accounts
            .iter()
            .filter(|a| &a.user_id == user_id)
            .cloned()
            .collect())
    }

    fn access_token(
        &self,
        user_id: &UserId,
        source_id: &SourceId,
        account_id: &AccountId,
    ) -> Result<AccessToken, ProviderError> {
        if self.is_bad(user_id, source_id, account_id) {
            return Err(ProviderError::BadCredential(format!(
                "{} account {} needs to be re-linked",
                source_id, account_id
            )));
        }
        self.accounts
            .iter()
            .find(|a| {
                &a.user_id == user_id && &a.source_id == source_id && &a.account_id == account_id
            })
            .map(|a| a.access_token.clone())
            .ok_or_else(|| ProviderError::MissingCredential(format!("{}/{}", source_id, account_id)))
    }

    fn mark_bad(&self, user_id: &UserId, source_id: &SourceId, account_id: &AccountId) {
        info!(
            "[SYNC] Flagging {} account {} of {} for re-link",
            source_id, account_id, user_id
        );
        self.bad
            .write()
            .unwrap()
            .insert((user_id.clone(), source_id.clone(), account_id.clone()));
    }
}

/// On-disk format of `credentials.json`
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    accounts: Vec<LinkedAccount>,
}

/// Loads linked accounts from `credentials.json`
pub struct FileCredentialStore;

impl FileCredentialStore {
    /// Load from the workitems config directory; no file means no accounts
    pub fn load() -> Result<StaticCredentialStore> {
        if !config::config_exists(CREDENTIALS_FILE) {
            return Ok(StaticCredentialStore::default());
        }
        let file: CredentialFile =
            config::load_json(CREDENTIALS_FILE).context("Failed to load linked accounts")?;
        Ok(StaticCredentialStore::new(file.accounts))
    }

    /// Load from a specific JSON file
    pub fn from_file(path: &Path) -> Result<StaticCredentialStore> {
        let file: CredentialFile = config::load_json_file(path)?;
        Ok(StaticCredentialStore::new(file.accounts))
    }

    /// Save linked accounts to the workitems config directory
    pub fn save(accounts: &[LinkedAccount]) -> Result<()> {
        config::save_json(
            CREDENTIALS_FILE,
            &CredentialFile {
                accounts: accounts.to_vec(),
            },
        )
    }
}
