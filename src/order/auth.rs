//! `http-01` challenge handling, see [RFC 8555 §8.3].
//!
//! For every authorization on the order: fetch it, publish the key
//! authorization under the well-known path, tell the CA to go look, and poll
//! until it has. Authorizations are processed one at a time; the CA decides
//! whether it needs any at all (it may remember recent proof of ownership).
//!
//! [RFC 8555 §8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3

use std::time::Duration;

use crate::{
    api,
    error::{OrderFailed, PollTimeout},
    host::ChallengeHost,
    jws::key_authorization,
    order::OrderRecord,
    trans::Transport,
};

/// Where challenge responses must be reachable, relative to the host root.
const WELL_KNOWN: &str = "/.well-known/acme-challenge/";

/// Drives every authorization of `order` to `valid`.
///
/// Fails with [`OrderFailed`] when the CA rejects a proof (the order is dead
/// and must be replaced) and with [`PollTimeout`] when the CA is merely slow
/// (the same step can run again later).
pub(crate) async fn process_authorizations(
    transport: &Transport,
    host: &dyn ChallengeHost,
    order: &OrderRecord,
    poll_interval: Duration,
    poll_max_attempts: u32,
) -> eyre::Result<()> {
    for auth_url in &order.authorizations {
        let auth: api::Authorization = transport
            .call_kid(auth_url, &api::EmptyString)
            .await?
            .json()?;

        let domain = &auth.identifier.value;

        match auth.status {
            api::AuthorizationStatus::Valid => {
                // ownership proven in some previous order
                log::debug!("Authorization for {domain} already valid");
                continue;
            }
            api::AuthorizationStatus::Pending => {}
            status => {
                return Err(
                    OrderFailed(format!("authorization for {domain} is {status:?}")).into(),
                );
            }
        }

        let challenge = auth
            .http_challenge()
            .ok_or_else(|| OrderFailed(format!("no http-01 challenge offered for {domain}")))?;

        let key_auth = key_authorization(&challenge.token, transport.acme_key())?;
        let path = format!("{WELL_KNOWN}{}", challenge.token);

        log::info!("Answering http-01 challenge for {domain}");
        host.publish(&path, key_auth.as_bytes()).await?;

        let outcome = drive_challenge(
            transport,
            &challenge.url,
            auth_url,
            poll_interval,
            poll_max_attempts,
        )
        .await;

        // The response file comes down whichever way validation went.
        if let Err(err) = host.unpublish(&path).await {
            log::warn!("Failed to remove challenge file {path}: {err}");
        }

        outcome?;
        log::info!("Authorization for {domain} is valid");
    }

    Ok(())
}

/// Tells the CA the proof is in place, then polls the authorization until it
/// reaches a terminal state.
async fn drive_challenge(
    transport: &Transport,
    challenge_url: &str,
    auth_url: &str,
    poll_interval: Duration,
    poll_max_attempts: u32,
) -> eyre::Result<()> {
    // POST {} signals the CA to start validating.
    transport.call_kid(challenge_url, &api::EmptyObject).await?;

    for _ in 0..poll_max_attempts {
        let auth: api::Authorization = transport
            .call_kid(auth_url, &api::EmptyString)
            .await?
            .json()?;

        match auth.status {
            api::AuthorizationStatus::Valid => return Ok(()),
            api::AuthorizationStatus::Pending => {}
            api::AuthorizationStatus::Invalid => {
                return Err(OrderFailed(validation_failure_reason(&auth)).into());
            }
            status => {
                return Err(OrderFailed(format!(
                    "authorization for {} is {status:?}",
                    auth.identifier.value
                ))
                .into());
            }
        }

        tokio::time::sleep(poll_interval).await;
    }

    Err(PollTimeout("challenge validation").into())
}

fn validation_failure_reason(auth: &api::Authorization) -> String {
    let error = auth
        .challenges
        .iter()
        .filter_map(|challenge| challenge.error.as_ref())
        .next();

    match error {
        Some(error) => format!("validation failed: {error}"),
        None => "validation failed and no error found".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_prefers_challenge_error() {
        let auth = api::Authorization {
            identifier: api::Identifier::dns("device.example.com"),
            status: api::AuthorizationStatus::Invalid,
            expires: None,
            challenges: vec![api::Challenge {
                _type: "http-01".to_owned(),
                url: "https://ca/chall/1".to_owned(),
                status: api::ChallengeStatus::Invalid,
                validated: None,
                error: Some(api::Problem {
                    _type: "urn:ietf:params:acme:error:unauthorized".to_owned(),
                    detail: Some("served wrong bytes".to_owned()),
                    ..Default::default()
                }),
                token: "tok".to_owned(),
            }],
            wildcard: None,
        };

        let reason = validation_failure_reason(&auth);
        assert!(reason.contains("served wrong bytes"));
    }

    #[test]
    fn test_failure_reason_without_error_object() {
        let auth = api::Authorization {
            identifier: api::Identifier::dns("device.example.com"),
            status: api::AuthorizationStatus::Invalid,
            expires: None,
            challenges: vec![],
            wildcard: None,
        };

        assert_eq!(
            validation_failure_reason(&auth),
            "validation failed and no error found"
        );
    }
}
