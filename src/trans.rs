use std::sync::Arc;

use base64::prelude::*;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    acc::AcmeKey,
    error::ApiError,
    jws::{FlattenedJsonJws, Jwk, JwsProtectedHeader},
    web::{HttpRequest, HttpResponse, WebClient},
};

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount url
/// 3. `set_key_id()` from the returned `Location` header.
/// 4. `call_kid()` for all calls after that.
#[derive(Clone)]
pub(crate) struct Transport {
    web: Arc<dyn WebClient>,
    nonce_pool: Arc<NoncePool>,
    acme_key: AcmeKey,
}

impl Transport {
    pub fn new(web: Arc<dyn WebClient>, nonce_pool: Arc<NoncePool>, acme_key: AcmeKey) -> Self {
        Transport {
            web,
            nonce_pool,
            acme_key,
        }
    }

    /// Update the key ID once it is known (part of setting up the transport).
    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    /// The key used in the transport.
    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Make call using the full JWK. Only needed for newAccount requests.
    pub async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<HttpResponse>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, None, HeaderVariant::Jwk).await
    }

    /// Make call using the key ID.
    pub async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<HttpResponse>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, None, HeaderVariant::Kid).await
    }

    /// Make call using the key ID, with an `Accept` header.
    ///
    /// Used for certificate download, which asks for
    /// `application/pem-certificate-chain`.
    pub async fn call_kid_accept<T>(
        &self,
        url: &str,
        body: &T,
        accept: &str,
    ) -> eyre::Result<HttpResponse>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, Some(accept), HeaderVariant::Kid)
            .await
    }

    async fn do_call<T>(
        &self,
        url: &str,
        body: &T,
        accept: Option<&str>,
        variant: HeaderVariant,
    ) -> eyre::Result<HttpResponse>
    where
        T: Serialize + ?Sized,
    {
        // The API may invalidate our nonce at any point; a badNonce rejection
        // carries a fresh one on the error response, so a single immediate
        // retry suffices.
        let mut retried_bad_nonce = false;

        loop {
            // Either reuse a nonce from a previous response, or get a new one.
            let nonce = self.nonce_pool.get(self.web.as_ref()).await?;

            let protected = match variant {
                HeaderVariant::Jwk => {
                    JwsProtectedHeader::new_jwk(Jwk::from(&self.acme_key), url, nonce)
                }
                HeaderVariant::Kid => {
                    let kid = self
                        .acme_key
                        .key_id()
                        .ok_or_else(|| eyre::eyre!("account URL not known yet"))?;
                    JwsProtectedHeader::new_kid(kid, url, nonce)
                }
            };

            let envelope = jws_with(protected, &self.acme_key, body)?;

            log::debug!("Call endpoint: {url}");

            let mut request =
                HttpRequest::post(url, "application/jose+json", envelope.into_bytes());
            if let Some(accept) = accept {
                request = request.with_header("accept", accept);
            }

            let response = self.web.fetch(request).await?;

            // Regardless of the request being a success or not, there might
            // be a nonce in the response.
            self.nonce_pool.observe(&response);

            match ApiError::check(response) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if err.problem.is_bad_nonce() && !retried_bad_nonce {
                        log::debug!("Retrying on bad nonce");
                        retried_bad_nonce = true;
                        continue;
                    }

                    return Err(err.into());
                }
            }
        }
    }
}

enum HeaderVariant {
    Jwk,
    Kid,
}

/// Holds the single unused replay nonce, see
/// [RFC 8555 §6.5](https://datatracker.ietf.org/doc/html/rfc8555#section-6.5).
///
/// Every response may carry a fresh `Replay-Nonce`; every request consumes
/// exactly one. The pool never hands out the same value twice.
#[derive(Default, Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    slot: Mutex<Option<String>>,
}

impl NoncePool {
    pub fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            ..Default::default()
        }
    }

    /// Remembers the `Replay-Nonce` of a response, replacing any held value.
    pub fn observe(&self, res: &HttpResponse) {
        if let Some(nonce) = res.header("replay-nonce") {
            log::trace!("Extracting new nonce");
            *self.slot.lock() = Some(nonce.to_owned());
        }
    }

    /// Takes the held nonce, or fetches one from the newNonce resource.
    pub async fn get(&self, web: &dyn WebClient) -> eyre::Result<String> {
        if let Some(nonce) = self.slot.lock().take() {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = web.fetch(HttpRequest::get(&self.nonce_url)).await?;

        res.header("replay-nonce")
            .map(str::to_owned)
            .ok_or_else(|| eyre::eyre!("newNonce response missing Replay-Nonce header"))
    }
}

/// Construct a flattened JSON JWS according to [RFC 7515 §5.1].
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> eyre::Result<String> {
    let protected = {
        let pro_json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(pro_json)
    };

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        if payload_json == "\"\"" {
            // This is the special POST-as-GET case produced by EmptyString
            // and must not be base64url encoded further.
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{protected}.{payload}");
    let signature = BASE64_URL_SAFE_NO_PAD.encode(key.sign(to_sign.as_bytes())?);

    let jws = FlattenedJsonJws::new(protected, payload, signature);

    Ok(serde_json::to_string(&jws)?)
}
