//! Account key and account registration.
//!
//! One account per process. The account key is created once and reused for
//! the lifetime of the account; the account URL (`kid`) is what every later
//! request authenticates against.

use chrono::{DateTime, Utc};
use eyre::{eyre, WrapErr as _};
use serde::{Deserialize, Serialize};

use crate::{api, dir::Directory, error::ApiError, store::Store, trans::Transport};

mod acme_key;

pub(crate) use self::acme_key::AcmeKey;

/// PKCS#8 PEM of the account key.
pub(crate) const ACCOUNT_KEY_FILE: &str = "account.pem";

/// Serialized [`AccountRecord`].
pub(crate) const ACCOUNT_FILE: &str = "account.json";

/// What we remember about the registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account status as last reported by the CA.
    pub status: String,

    /// Contact URIs the account was registered with.
    pub contact: Vec<String>,

    /// The account URL, returned in `Location` on registration. This is the
    /// `kid` every authenticated request signs under.
    pub location: Option<String>,

    /// When the account was created (CA's view if it reported one).
    pub created_at: DateTime<Utc>,
}

impl AccountRecord {
    /// An account is only usable once its URL is known; a record without one
    /// is a leftover from a failed registration and must be re-created.
    pub fn is_usable(&self) -> bool {
        self.location.is_some()
    }

    pub(crate) async fn load(store: &dyn Store) -> eyre::Result<Option<AccountRecord>> {
        match store.read(ACCOUNT_FILE).await? {
            Some(data) => Ok(Some(
                serde_json::from_slice(&data).wrap_err("parsing account record")?,
            )),
            None => Ok(None),
        }
    }

    pub(crate) async fn save(&self, store: &dyn Store) -> eyre::Result<()> {
        store
            .write(ACCOUNT_FILE, &serde_json::to_vec_pretty(self)?)
            .await
    }
}

/// Loads the account key, generating and persisting one on first use.
pub(crate) async fn ensure_account_key(store: &dyn Store) -> eyre::Result<AcmeKey> {
    if let Some(pem) = store.read(ACCOUNT_KEY_FILE).await? {
        let pem = String::from_utf8(pem).wrap_err("account key is not UTF-8")?;
        return AcmeKey::from_pem(&pem).wrap_err("reading account key");
    }

    log::info!("Generating new account key");
    let key = AcmeKey::generate()?;
    store
        .write(ACCOUNT_KEY_FILE, key.to_pem()?.as_bytes())
        .await?;

    Ok(key)
}

/// Makes sure a usable account exists and the transport signs under its URL.
///
/// Idempotent: a usable on-disk record short-circuits without network
/// traffic. Otherwise the account is registered (or re-discovered; the CA
/// answers an existing key with the existing account URL) and the record is
/// committed to the store before anything else may build on it.
pub(crate) async fn ensure_account(
    transport: &mut Transport,
    store: &dyn Store,
    directory: &Directory,
    contact: &[String],
    now: DateTime<Utc>,
) -> eyre::Result<AccountRecord> {
    if let Some(record) = AccountRecord::load(store).await? {
        if let Some(location) = &record.location {
            log::trace!("Using stored account {location}");
            transport.set_key_id(location.clone());
            return Ok(record);
        }
        log::warn!("Stored account has no URL; registering again");
    }

    let payload = api::Account {
        contact: (!contact.is_empty()).then(|| contact.to_vec()),
        terms_of_service_agreed: Some(true),
        ..Default::default()
    };

    // Fine for both new and existing keys: for existing ones the server
    // returns 200 with Location set to the account URL. Some servers answer
    // a re-registration with 409 Conflict instead, Location still set.
    let (kid, api_account) = match transport
        .call_jwk(directory.new_account_url(), &payload)
        .await
    {
        Ok(res) => {
            let kid = res
                .header("location")
                .ok_or_else(|| eyre!("newAccount response missing Location header"))?
                .to_owned();
            (kid, res.json::<api::Account>().unwrap_or_default())
        }
        Err(err) => match find_conflict_location(&err) {
            Some(kid) => (kid, api::Account::default()),
            None => return Err(err),
        },
    };

    log::debug!("Key ID is: {kid}");
    transport.set_key_id(kid.clone());

    let created_at = api_account
        .created_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(now);

    let record = AccountRecord {
        status: api_account.status.unwrap_or_else(|| "valid".to_owned()),
        contact: contact.to_vec(),
        location: Some(kid),
        created_at,
    };
    record.save(store).await?;

    Ok(record)
}

/// Asks the CA whether this key already has an account, without creating one.
///
/// Returns the account URL if so.
pub(crate) async fn probe_existing(
    transport: &Transport,
    directory: &Directory,
) -> eyre::Result<Option<String>> {
    let payload = api::Account {
        only_return_existing: Some(true),
        ..Default::default()
    };

    match transport
        .call_jwk(directory.new_account_url(), &payload)
        .await
    {
        Ok(res) => Ok(res.header("location").map(str::to_owned)),
        Err(err) => {
            for cause in err.chain() {
                if let Some(api) = cause.downcast_ref::<ApiError>() {
                    if api.problem.is_account_does_not_exist() {
                        return Ok(None);
                    }
                }
            }
            Err(err)
        }
    }
}

/// A 409 on `newAccount` means the account exists; the response's `Location`
/// is its URL.
fn find_conflict_location(err: &eyre::Report) -> Option<String> {
    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            if api.status == 409 {
                return api.location.clone();
            }
        }
    }
    None
}
