use std::sync::Arc;

use eyre::WrapErr as _;

use crate::{
    api,
    error::ApiError,
    trans::NoncePool,
    web::{HttpRequest, WebClient},
};

pub(crate) const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub(crate) const LETSENCRYPT_STAGING_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates. The root signing
    /// certificate is not supposed to be in any trust chains.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// The CA's endpoint map, fetched from its well-known directory URL.
///
/// Held in memory only; refetched on process start. Deserialization fails if
/// any of `newNonce`, `newAccount` or `newOrder` is missing, which is fatal —
/// there is no way to talk to such a server.
#[derive(Clone)]
pub struct Directory {
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
}

impl Directory {
    /// Fetch and parse the directory object.
    pub async fn fetch(web: &dyn WebClient, url: DirectoryUrl<'_>) -> eyre::Result<Directory> {
        let res = web.fetch(HttpRequest::get(url.to_url())).await?;
        let res = ApiError::check(res)?;
        let api_directory = res
            .json::<api::Directory>()
            .wrap_err("parsing directory object")?;

        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));

        Ok(Directory {
            nonce_pool,
            api_directory,
        })
    }

    pub(crate) fn nonce_pool(&self) -> Arc<NoncePool> {
        Arc::clone(&self.nonce_pool)
    }

    pub fn new_account_url(&self) -> &str {
        &self.api_directory.new_account
    }

    pub fn new_order_url(&self) -> &str {
        &self.api_directory.new_order
    }
}
