use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _, LineEnding};
use rsa::{
    pkcs1v15::SigningKey,
    signature::{SignatureEncoding as _, Signer as _},
    traits::PublicKeyParts as _,
    RsaPrivateKey,
};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key size for generated account keys. Let's Encrypt accepts 2048-4096.
const RSA_BITS: usize = 2048;

/// The RSA key the account signs its requests with.
///
/// Created once, persisted as PKCS#8 PEM, and reused for the lifetime of the
/// account; it is never rotated automatically.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    private: RsaPrivateKey,

    /// Set once we contacted the ACME API to figure out the key ID.
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn generate() -> eyre::Result<AcmeKey> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
            .wrap_err("RSA key generation failed")?;
        Ok(Self::from_key(private))
    }

    pub(crate) fn from_pem(pem: &str) -> eyre::Result<AcmeKey> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).wrap_err("Failed to read PEM")?;
        Ok(Self::from_key(private))
    }

    fn from_key(private: RsaPrivateKey) -> AcmeKey {
        AcmeKey {
            private,
            key_id: None,
        }
    }

    pub(crate) fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .wrap_err("private_key_to_pem")
    }

    /// Raw PKCS#1 v1.5 RSA-SHA256 signature over `msg`.
    ///
    /// Fixed-width big-endian, not DER-wrapped. This is the `RS256` form JOSE
    /// expects.
    pub(crate) fn sign(&self, msg: &[u8]) -> eyre::Result<Vec<u8>> {
        let signer = SigningKey::<Sha256>::new(self.private.clone());
        let signature = signer
            .try_sign(msg)
            .map_err(|err| eyre::eyre!("RS256 signing failed: {err}"))?;
        Ok(signature.to_vec())
    }

    /// Public modulus and exponent, big-endian with leading zeros stripped.
    pub(crate) fn public_components(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.private.n().to_bytes_be(),
            self.private.e().to_bytes_be(),
        )
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::test_key_pem;

    #[test]
    fn test_pem_round_trip() {
        let key = AcmeKey::from_pem(test_key_pem()).unwrap();
        let pem = key.to_pem().unwrap();
        let reloaded = AcmeKey::from_pem(&pem).unwrap();

        assert_eq!(key.public_components(), reloaded.public_components());
    }

    #[test]
    fn test_signing_is_deterministic() {
        // PKCS#1 v1.5 signatures carry no randomness; two runs over the same
        // bytes must agree.
        let key = AcmeKey::from_pem(test_key_pem()).unwrap();

        let a = key.sign(b"some bytes").unwrap();
        let b = key.sign(b"some bytes").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), 256); // 2048-bit key
    }

    #[test]
    fn test_public_exponent_has_no_leading_zeros() {
        let key = AcmeKey::from_pem(test_key_pem()).unwrap();
        let (n, e) = key.public_components();

        assert_ne!(n[0], 0);
        assert_eq!(e, vec![0x01, 0x00, 0x01]); // 65537
    }
}
