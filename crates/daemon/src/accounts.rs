//! Account authorization and creation
//!
//! Every request presents an account code; validation classifies failures
//! (length, charset, unknown, expired) so callers get a precise reason.
//! The very first account is the master account: zero peer quota, only able
//! to mint further accounts. Its identity is pinned in the kv store rather
//! than inferred from insertion order.

use crate::config::AccountConfig;
use chrono::{Duration, Utc};
use tracing::info;
use wgmint_common::rng::{generate_code, RandomSource, CODE_ALPHABET, CODE_LEN};
use wgmint_common::{Account, Result, Store, ValidationError};

/// kv_store key pinning the distinguished master account.
pub const MASTER_ACCOUNT_KEY: &str = "master_account_id";

pub struct Authorizer {
    store: Store,
    default_peer_limit: i64,
    validity_days: i64,
}

impl Authorizer {
    pub fn new(store: Store, config: &AccountConfig) -> Self {
        Self {
            store,
            default_peer_limit: config.default_peer_limit,
            validity_days: config.validity_days,
        }
    }

    /// Resolve a caller-presented code to its account, or fail with the
    /// check that rejected it. Expiry is compared in UTC on both sides.
    pub fn validate_code(&self, code: &str) -> Result<Account> {
        if code.len() != CODE_LEN {
            return Err(ValidationError::CodeLength.into());
        }
        if !code.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
            return Err(ValidationError::CodeCharset.into());
        }
        let account = self
            .store
            .account_by_code(code)?
            .ok_or(ValidationError::AccountNotFound)?;
        if account.is_expired(Utc::now().timestamp()) {
            return Err(ValidationError::AccountExpired.into());
        }
        Ok(account)
    }

    /// Succeeds only for the pinned master account.
    pub fn require_master(&self, account: &Account) -> Result<()> {
        let master_id = self
            .store
            .kv_get(MASTER_ACCOUNT_KEY)?
            .and_then(|v| v.parse::<i64>().ok());
        if master_id != Some(account.id) {
            return Err(ValidationError::MasterRequired.into());
        }
        Ok(())
    }

    /// First run: create the master account with a zero peer quota and pin
    /// its id. A store with any account already present is left alone.
    pub fn ensure_master(&self, rng: &dyn RandomSource) -> Result<()> {
        if self.store.count_accounts()? > 0 {
            return Ok(());
        }
        let account = self.mint(rng, 0, "master account")?;
        self.store
            .kv_set(MASTER_ACCOUNT_KEY, &account.id.to_string())?;
        info!("created master account {}", account.id);
        Ok(())
    }

    /// Mint a new account, gated on the master code.
    pub fn create_account(
        &self,
        rng: &dyn RandomSource,
        master_code: &str,
        comment: &str,
    ) -> Result<Account> {
        let master = self.validate_code(master_code)?;
        self.require_master(&master)?;
        if comment.len() > 99 {
            return Err(ValidationError::CommentTooLong.into());
        }
        let account = self.mint(rng, self.default_peer_limit, comment)?;
        info!("created account {}", account.id);
        Ok(account)
    }

    fn mint(&self, rng: &dyn RandomSource, peers_max: i64, comment: &str) -> Result<Account> {
        let code = generate_code(rng);
        let now = Utc::now();
        let valid_until = now + Duration::days(self.validity_days);
        self.store.create_account(
            &code,
            peers_max,
            now.timestamp(),
            valid_until.timestamp(),
            comment,
        )
    }
}
