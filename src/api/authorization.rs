use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object.
///
/// Represents a server's authorization for an account to represent an identifier.
///
/// See [RFC 8555 §7.1.4].
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier.
    pub identifier: api::Identifier,

    /// Authorization status.
    pub status: AuthorizationStatus,

    /// The timestamp after which the server will consider this authorization invalid.
    ///
    /// Uses RFC 3339 format.
    ///
    /// This field is required for objects with "valid" in the "status" field.
    pub expires: Option<String>,

    /// The challenges related to the identifier.
    ///
    /// - For pending authorizations, the challenges that the client can fulfill in order to prove
    ///   possession of the identifier.
    /// - For valid authorizations, the challenge that was validated.
    /// - For invalid authorizations, the challenge that was attempted and failed.
    ///
    /// Each array entry is an object with parameters required to validate the challenge. A client
    /// should attempt to fulfill one of these challenges, and a server should consider any one of
    /// the challenges sufficient to make the authorization valid.
    pub challenges: Vec<api::Challenge>,

    /// This field MUST be present and true for authorizations created as a result of a newOrder
    /// request containing a DNS identifier with a value that was a wildcard domain name. For
    /// other authorizations, it MUST be absent.
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// Returns the first `http-01` challenge, if one is present.
    ///
    /// A server may offer several challenges of the same type; the first occurrence wins.
    pub fn http_challenge(&self) -> Option<&api::Challenge> {
        self.challenges.iter().find(|c| c._type == "http-01")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(_type: &str, url: &str) -> api::Challenge {
        api::Challenge {
            _type: _type.to_owned(),
            url: url.to_owned(),
            status: api::ChallengeStatus::Pending,
            validated: None,
            error: None,
            token: "token".to_owned(),
        }
    }

    #[test]
    fn test_http_challenge_picks_first_occurrence() {
        let auth = Authorization {
            identifier: api::Identifier::dns("device.example.com"),
            status: AuthorizationStatus::Pending,
            expires: None,
            challenges: vec![
                challenge("dns-01", "https://ca/chall/1"),
                challenge("http-01", "https://ca/chall/2"),
                challenge("http-01", "https://ca/chall/3"),
            ],
            wildcard: None,
        };

        assert_eq!(auth.http_challenge().unwrap().url, "https://ca/chall/2");
    }

    #[test]
    fn test_http_challenge_absent() {
        let auth = Authorization {
            identifier: api::Identifier::dns("device.example.com"),
            status: AuthorizationStatus::Pending,
            expires: None,
            challenges: vec![challenge("dns-01", "https://ca/chall/1")],
            wildcard: None,
        };

        assert!(auth.http_challenge().is_none());
    }
}
