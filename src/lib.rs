//! Unattended provisioning and renewal of TLS certificates from ACME
//! (Automatic Certificate Management Environment) providers such as
//! [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2
//! with the `http-01` challenge type and RSA (RS256) account and certificate keys.
//!
//! # Usage
//!
//! The crate is built around a [`Keeper`]: a state machine that is handed a
//! [`Config`] plus three capabilities and then driven by calling
//! [`Keeper::tick()`] from the host's main loop:
//!
//! - a [`WebClient`] carrying HTTP traffic to the CA ([`ReqwestClient`] is
//!   the batteries-included implementation);
//! - a [`Store`] holding the durable state (account key, account URL, order,
//!   certificate key, certificate) so that a power cycle resumes where the
//!   protocol left off instead of re-driving the CA ([`FsStore`] persists to
//!   a directory, [`MemStore`] is for tests);
//! - a [`ChallengeHost`] that makes challenge responses reachable under
//!   `http://<domain>/.well-known/acme-challenge/<token>` ([`WebrootHost`]
//!   drops files into a web server's document root; anything that can
//!   publish a file can implement it, e.g. an FTP push to a frontend web
//!   server or an in-process HTTP handler).
//!
//! Each `tick` performs at most one protocol transition (registration, order
//! creation, challenge round, finalization, download) and returns `true`
//! exactly when a fresh certificate has been committed to the store.
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused.
//! It might be tempting to lower the polling and inter-step delays in [`Config`], but balance this
//! against the real risk of having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the
//! rate limits are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod cert;
mod config;
mod dir;
mod error;
mod host;
mod jws;
mod keeper;
mod order;
mod store;
mod trans;
mod web;

pub mod api;


pub use crate::{
    cert::{create_rsa_key, Certificate},
    config::Config,
    dir::{Directory, DirectoryUrl},
    error::{ApiError, OrderFailed, PollTimeout, Recovery},
    host::{ChallengeHost, MemHost, WebrootHost},
    keeper::Keeper,
    store::{FsStore, MemStore, Store},
    web::{HttpRequest, HttpResponse, Method, ReqwestClient, WebClient, WebError},
};
