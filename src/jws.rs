//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::acc::AcmeKey;

/// JWS Protected Header scheme as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    /// Algorithm.
    ///
    /// This field MUST NOT contain "none" or a Message Authentication Code (MAC) algorithm (e.g.
    /// one in which the algorithm registry description mentions MAC/HMAC).
    alg: String,

    /// A unique value that enables the verifier of a JWS to recognize when replay has occurred.
    ///
    /// As defined in [RFC 8555 §6.5].
    ///
    /// > The value of the "nonce" header parameter MUST be an octet string, encoded according to
    /// the base64url encoding. If the value of a "nonce" header parameter is not valid according
    /// to this encoding, then the verifier MUST reject the JWS as malformed.
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    nonce: String,

    /// Defined in [RFC 8555 §6.4].
    ///
    /// > The "url" header parameter specifies the URL (RFC 3986) to which this JWS object is
    /// directed. The "url" header parameter MUST be carried in the protected header of the JWS.
    /// The value of the "url" header parameter MUST be a string representing the target URL.
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    url: String,

    /// JSON Web Key.
    ///
    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Key ID.
    ///
    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "RS256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "RS256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

/// Public half of the account key in JWK form, see [RFC 7517].
///
/// [RFC 7517]: https://datatracker.ietf.org/doc/html/rfc7517
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    e: String,
    n: String,
}

impl From<&AcmeKey> for Jwk {
    fn from(key: &AcmeKey) -> Self {
        let (n, e) = key.public_components();

        Jwk {
            alg: "RS256".to_owned(),
            kty: "RSA".to_owned(),
            _use: "sig".to_owned(),
            e: BASE64_URL_SAFE_NO_PAD.encode(e),
            n: BASE64_URL_SAFE_NO_PAD.encode(n),
        }
    }
}

/// Thumbprint form of the JWK, see [RFC 7638 §3.2].
///
/// [RFC 7638 §3.2]: https://datatracker.ietf.org/doc/html/rfc7638#section-3.2
#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    e: String,
    kty: String,
    n: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            e: a.e.clone(),
            kty: a.kty.clone(),
            n: a.n.clone(),
        }
    }
}

/// The RFC 7638 thumbprint of the account key:
/// `b64url(sha256({"e":..,"kty":..,"n":..}))` over the canonical JSON with no
/// whitespace.
pub(crate) fn jwk_thumbprint(key: &AcmeKey) -> eyre::Result<String> {
    let jwk = Jwk::from(key);
    let jwk_thumb = JwkThumb::from(&jwk);
    let json = serde_json::to_string(&jwk_thumb)?;

    Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(json)))
}

/// The key authorization for an `http-01` token, see [RFC 8555 §8.1].
///
/// This is the literal body that must be served at
/// `http://<domain>/.well-known/acme-challenge/<token>`.
///
/// [RFC 8555 §8.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.1
pub(crate) fn key_authorization(token: &str, key: &AcmeKey) -> eyre::Result<String> {
    Ok(format!("{token}.{}", jwk_thumbprint(key)?))
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

impl FlattenedJsonJws {
    pub(crate) fn new(protected: String, payload: String, signature: String) -> Self {
        FlattenedJsonJws {
            protected,
            payload,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::test_key_pem;

    fn test_key() -> AcmeKey {
        AcmeKey::from_pem(test_key_pem()).unwrap()
    }

    #[test]
    fn test_thumbprint_json_is_canonical() {
        let jwk = Jwk {
            alg: "RS256".to_owned(),
            kty: "RSA".to_owned(),
            _use: "sig".to_owned(),
            e: "AQAB".to_owned(),
            n: "xyz".to_owned(),
        };

        let json = serde_json::to_string(&JwkThumb::from(&jwk)).unwrap();

        // Keys in lexicographic order, no whitespace; anything else changes
        // the digest and the CA rejects the challenge response.
        assert_eq!(json, r#"{"e":"AQAB","kty":"RSA","n":"xyz"}"#);
    }

    #[test]
    fn test_thumbprint_is_stable() {
        let a = jwk_thumbprint(&test_key()).unwrap();
        let b = jwk_thumbprint(&test_key()).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 43); // b64url(32 bytes), no padding
        assert!(!a.contains('='));
    }

    #[test]
    fn test_key_authorization_shape() {
        let key = test_key();
        let key_auth = key_authorization("abc", &key).unwrap();

        let (token, thumb) = key_auth.split_once('.').unwrap();
        assert_eq!(token, "abc");
        assert_eq!(thumb, jwk_thumbprint(&key).unwrap());
    }

    #[test]
    fn test_header_has_exactly_one_key_field() {
        let key = test_key();

        let jwk = serde_json::to_value(JwsProtectedHeader::new_jwk(
            Jwk::from(&key),
            "https://ca/acme/new-acct",
            "nonce-1".to_owned(),
        ))
        .unwrap();
        assert!(jwk.get("jwk").is_some());
        assert!(jwk.get("kid").is_none());
        assert_eq!(jwk["alg"], "RS256");

        let kid = serde_json::to_value(JwsProtectedHeader::new_kid(
            "https://ca/acme/acct/1",
            "https://ca/acme/new-order",
            "nonce-2".to_owned(),
        ))
        .unwrap();
        assert!(kid.get("jwk").is_none());
        assert_eq!(kid["kid"], "https://ca/acme/acct/1");
    }

    #[test]
    fn test_b64url_round_trip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = BASE64_URL_SAFE_NO_PAD.encode(&data);

        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(BASE64_URL_SAFE_NO_PAD.decode(&encoded).unwrap(), data);
    }
}
