//! Agent configuration.

use std::time::Duration;

use eyre::{ensure, eyre};
use serde::{Deserialize, Serialize};

use crate::dir::LETSENCRYPT_STAGING_URL;

/// Configuration for a [`Keeper`](crate::Keeper).
///
/// The defaults target the Let's Encrypt staging environment; switch
/// `acme_server_url` to the production directory once the flow works.
///
/// Durations are given in seconds so the struct round-trips through plain
/// JSON config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL of the CA's directory object.
    pub acme_server_url: String,

    /// Contact address for the account, without the `mailto:` scheme.
    pub email: Option<String>,

    /// The domain the certificate is issued for (also the CSR subject CN).
    pub primary_fqdn: String,

    /// Further domains to include as subject alternative names.
    pub alt_fqdns: Vec<String>,

    /// Renew once fewer than this many days of validity remain.
    pub renew_margin_days: i64,

    /// Pause between polls of an authorization or order status.
    pub poll_interval_s: u64,

    /// Give up polling (until a later tick) after this many attempts.
    pub poll_max_attempts: u32,

    /// Minimum pause between two protocol transitions, to stay friendly
    /// with CA rate limits.
    pub inter_step_delay_s: u64,

    /// Per-request HTTP timeout.
    pub http_timeout_s: u64,

    /// Advance exactly one transition per [`tick`](crate::Keeper::tick)
    /// call, ignoring wall-clock pacing. For deterministic tests.
    pub step_mode: bool,

    /// Refuse to do anything while the wall clock is obviously wrong
    /// (before NTP sync on devices without an RTC).
    pub wait_for_timesync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            acme_server_url: LETSENCRYPT_STAGING_URL.to_owned(),
            email: None,
            primary_fqdn: String::new(),
            alt_fqdns: Vec::new(),
            renew_margin_days: 30,
            poll_interval_s: 10,
            poll_max_attempts: 60,
            inter_step_delay_s: 5,
            http_timeout_s: 30,
            step_mode: false,
            wait_for_timesync: true,
        }
    }
}

impl Config {
    /// A config for `primary_fqdn` with everything else defaulted.
    pub fn new(primary_fqdn: impl Into<String>) -> Self {
        Config {
            primary_fqdn: primary_fqdn.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> eyre::Result<()> {
        ensure!(!self.acme_server_url.is_empty(), "acme_server_url not set");
        ensure!(self.renew_margin_days > 0, "renew_margin_days must be > 0");

        if let Some(email) = &self.email {
            ensure!(
                email.contains('@') && !email.contains(char::is_whitespace),
                "email {email:?} is not a plain address"
            );
        }

        // surfaces bad identifiers at configuration time
        self.identifiers()?;

        Ok(())
    }

    /// The validated, lowercased identifier list; the primary comes first.
    pub(crate) fn identifiers(&self) -> eyre::Result<Vec<String>> {
        validate_identifiers(&self.primary_fqdn, &self.alt_fqdns)
    }

    /// Contact URIs for account registration.
    pub(crate) fn contact(&self) -> Vec<String> {
        self.email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect()
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub(crate) fn inter_step_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inter_step_delay_s as i64)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_s)
    }
}

/// Checks and normalises the domain list for an order.
///
/// Domains are lowercased (DNS is case-insensitive, CAs compare lowercase),
/// duplicates collapse keeping first position, and anything that cannot be a
/// hostname (empty, embedded `/`, whitespace) is rejected outright rather
/// than bounced by the CA later.
pub(crate) fn validate_identifiers(primary: &str, alts: &[String]) -> eyre::Result<Vec<String>> {
    let mut identifiers = Vec::with_capacity(1 + alts.len());

    for domain in std::iter::once(primary).chain(alts.iter().map(String::as_str)) {
        if domain.is_empty() {
            return Err(eyre!("empty domain name"));
        }
        if domain.contains('/') || domain.contains(char::is_whitespace) {
            return Err(eyre!("{domain:?} is not a valid domain name"));
        }

        let domain = domain.to_ascii_lowercase();
        if !identifiers.contains(&domain) {
            identifiers.push(domain);
        }
    }

    Ok(identifiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_normalise_and_dedup() {
        let ids = validate_identifiers(
            "Device.Example.COM",
            &[
                "alt.example.com".to_owned(),
                "device.example.com".to_owned(),
            ],
        )
        .unwrap();

        assert_eq!(ids, vec!["device.example.com", "alt.example.com"]);
    }

    #[test]
    fn test_identifiers_reject_garbage() {
        assert!(validate_identifiers("", &[]).is_err());
        assert!(validate_identifiers("example.com/path", &[]).is_err());
        assert!(validate_identifiers("exa mple.com", &[]).is_err());
        assert!(validate_identifiers("ok.example.com", &["has space.com".to_owned()]).is_err());
    }

    #[test]
    fn test_default_config_targets_staging() {
        let config = Config::new("device.example.com");
        assert_eq!(config.acme_server_url, LETSENCRYPT_STAGING_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_email() {
        let mut config = Config::new("device.example.com");
        config.email = Some("not-an-address".to_owned());
        assert!(config.validate().is_err());

        config.email = Some("admin@example.com".to_owned());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_contact_uses_mailto() {
        let mut config = Config::new("device.example.com");
        assert!(config.contact().is_empty());

        config.email = Some("admin@example.com".to_owned());
        assert_eq!(config.contact(), vec!["mailto:admin@example.com"]);
    }
}
