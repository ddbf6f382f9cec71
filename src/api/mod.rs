//! JSON API payloads.
//!
//! Not intended to be used directly. Provided to aid debugging.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod order;

pub use self::{
    account::Account,
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    finalize::Finalize,
    identifier::Identifier,
    order::{Order, OrderStatus},
};

/// Serializes to `""`.
///
/// Used as the payload of "POST-as-GET" requests, see
/// [RFC 8555 §6.3](https://datatracker.ietf.org/doc/html/rfc8555#section-6.3).
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`.
///
/// Used as the payload when responding to a challenge, see
/// [RFC 8555 §7.5.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.5.1).
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// An RFC 7807 problem document, as returned by ACME servers on errors.
///
/// See [RFC 8555 §6.7](https://datatracker.ietf.org/doc/html/rfc8555#section-6.7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    /// Returns true if problem type is "badNonce".
    ///
    /// The server invalidates nonces at will; such a request is retried with
    /// the nonce carried on the error response itself.
    pub fn is_bad_nonce(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:badNonce" || self._type == "badNonce"
    }

    /// Returns true if problem type is "rateLimited".
    pub fn is_rate_limited(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:rateLimited" || self._type == "rateLimited"
    }

    /// Returns true if problem type is "accountDoesNotExist".
    ///
    /// Returned by `newAccount` when probing with `onlyReturnExisting`.
    pub fn is_account_does_not_exist(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:accountDoesNotExist"
            || self._type == "accountDoesNotExist"
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_empty_string() {
        let x = serde_json::to_string(&EmptyString).unwrap();
        assert_eq!("\"\"", x);
    }

    #[test]
    fn test_api_empty_object() {
        let x = serde_json::to_string(&EmptyObject).unwrap();
        assert_eq!("{}", x);
    }

    #[test]
    fn test_problem_classification() {
        let problem = Problem {
            _type: "urn:ietf:params:acme:error:badNonce".to_owned(),
            ..Default::default()
        };
        assert!(problem.is_bad_nonce());
        assert!(!problem.is_rate_limited());

        let problem = Problem {
            _type: "urn:ietf:params:acme:error:rateLimited".to_owned(),
            ..Default::default()
        };
        assert!(problem.is_rate_limited());
    }
}
