//! The driving state machine.
//!
//! A [`Keeper`] is ticked by the host's main loop and advances at most one
//! protocol transition per tick, deriving the current step from what is in
//! the store rather than from in-memory state. That makes power loss a
//! non-event: whatever the record files say is where the flow resumes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use eyre::{eyre, WrapErr as _};
use rsa::RsaPrivateKey;

use crate::{
    acc,
    cert::{self, Certificate, CERTIFICATE_FILE},
    config::Config,
    dir::{Directory, DirectoryUrl},
    error::{classify, Recovery},
    host::ChallengeHost,
    order::{self, OrderRecord, OrderState},
    store::Store,
    trans::Transport,
    web::WebClient,
};

/// Give up on a persistently failing step after this many consecutive
/// retryable errors; the error then reaches the host.
const MAX_STEP_FAILURES: u32 = 5;

/// How often an idle keeper re-examines the certificate's remaining
/// lifetime.
fn renewal_check_interval() -> Duration {
    Duration::hours(1)
}

/// Wall clocks before this moment mean NTP has not run yet.
fn time_valid_floor() -> DateTime<Utc> {
    DateTime::from_timestamp(1_577_836_800, 0).unwrap_or_default() // 2020-01-01
}

/// Keeps one host's certificate current against an ACME CA.
///
/// Construct it once with the capabilities it works through, then call
/// [`tick`](Self::tick) periodically (a few seconds between calls is
/// plenty). `tick` returns `true` exactly when a fresh certificate chain was
/// committed to the store this call.
pub struct Keeper {
    config: Config,
    identifiers: Vec<String>,
    web: Arc<dyn WebClient>,
    store: Box<dyn Store>,
    host: Box<dyn ChallengeHost>,

    // caches over fetched/stored state; all re-derivable
    directory: Option<Directory>,
    transport: Option<Transport>,
    cert_key: Option<RsaPrivateKey>,

    last_step: Option<DateTime<Utc>>,
    last_renewal_check: Option<DateTime<Utc>>,
    renewal_due: bool,
    backoff_until: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl Keeper {
    pub fn new(
        config: Config,
        web: Arc<dyn WebClient>,
        store: Box<dyn Store>,
        host: Box<dyn ChallengeHost>,
    ) -> eyre::Result<Self> {
        config.validate()?;
        let identifiers = config.identifiers()?;

        log::info!("ACME configuration summary:");
        log::info!("\tServer URL: {}", config.acme_server_url);
        log::info!("\tContact: {:?}", config.email);
        log::info!("\tDomains: {identifiers:?}");
        log::info!("\tRenewal margin: {} days", config.renew_margin_days);

        Ok(Keeper {
            config,
            identifiers,
            web,
            store,
            host,
            directory: None,
            transport: None,
            cert_key: None,
            last_step: None,
            last_renewal_check: None,
            renewal_due: false,
            backoff_until: None,
            consecutive_failures: 0,
        })
    }

    /// Advances the machine by at most one transition.
    ///
    /// Returns `true` iff a new certificate was committed to the store
    /// during this call. Transient failures are absorbed (logged, retried on
    /// a later tick); only conditions the host must know about surface as
    /// errors: local I/O failure, a CA speaking garbage, a step failing
    /// persistently.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> eyre::Result<bool> {
        if self.config.wait_for_timesync && now < time_valid_floor() {
            log::debug!("Waiting for time sync (clock says {now})");
            return Ok(false);
        }

        if let Some(until) = self.backoff_until {
            if now < until {
                return Ok(false);
            }
            self.backoff_until = None;
        }

        // Pace remote interactions unless running step-by-step.
        if !self.config.step_mode {
            if let Some(last) = self.last_step {
                if now - last < self.config.inter_step_delay() {
                    return Ok(false);
                }
            }
        }

        match self.advance(now).await {
            Ok(fresh_certificate) => {
                self.consecutive_failures = 0;
                self.last_step = Some(now);
                Ok(fresh_certificate)
            }
            Err(err) => {
                self.last_step = Some(now);

                match classify(&err) {
                    Recovery::Retry => {
                        self.consecutive_failures += 1;
                        if self.consecutive_failures > MAX_STEP_FAILURES {
                            self.consecutive_failures = 0;
                            return Err(err);
                        }
                        log::warn!("Step failed, will retry: {err:#}");
                        Ok(false)
                    }
                    Recovery::Backoff(pause) => {
                        log::warn!("Backing off for {}s: {err:#}", pause.as_secs());
                        let pause =
                            Duration::from_std(pause).unwrap_or_else(|_| renewal_check_interval());
                        self.backoff_until = Some(now + pause);
                        Ok(false)
                    }
                    Recovery::Abandon => {
                        log::warn!("Abandoning order: {err:#}");
                        OrderRecord::delete(self.store.as_ref()).await?;
                        Ok(false)
                    }
                    Recovery::Fatal => Err(err),
                }
            }
        }
    }

    /// Asks the CA whether the stored account key already has an account,
    /// without registering one.
    pub async fn probe_existing_account(&mut self) -> eyre::Result<Option<String>> {
        self.ensure_session().await?;

        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| eyre!("session not initialized"))?;
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| eyre!("session not initialized"))?;

        acc::probe_existing(transport, directory).await
    }

    async fn advance(&mut self, now: DateTime<Utc>) -> eyre::Result<bool> {
        match OrderRecord::load(self.store.as_ref()).await? {
            Some(record) if record.status == OrderState::Invalid => {
                log::warn!("Stored order is invalid; discarding");
                OrderRecord::delete(self.store.as_ref()).await?;
                Ok(false)
            }
            Some(record) if record.is_expired(now) => {
                log::warn!("Stored order expired on {:?}; discarding", record.expires);
                OrderRecord::delete(self.store.as_ref()).await?;
                Ok(false)
            }
            Some(record) if record.status == OrderState::Downloaded => {
                self.idle_or_renew(now, true).await
            }
            Some(mut record) => self.advance_order(now, &mut record).await,
            None => self.idle_or_renew(now, false).await,
        }
    }

    /// No order in flight: sleep on a good certificate, or start (re)newal.
    async fn idle_or_renew(
        &mut self,
        now: DateTime<Utc>,
        have_completed_order: bool,
    ) -> eyre::Result<bool> {
        if let Some(certificate) = self.stored_certificate().await? {
            // Once a good certificate exists its expiry only needs an
            // occasional glance, at boot and then hourly. A renewal already
            // under way keeps moving every tick.
            let recently_checked = self
                .last_renewal_check
                .is_some_and(|last| now - last < renewal_check_interval());
            if recently_checked && !self.renewal_due {
                return Ok(false);
            }

            self.last_renewal_check = Some(now);
            self.renewal_due =
                !certificate.is_usable(&self.identifiers, now, self.config.renew_margin_days);

            if !self.renewal_due {
                log::trace!("Certificate still good");
                return Ok(false);
            }

            log::info!(
                "Certificate expires within {} days; renewing",
                self.config.renew_margin_days
            );
        }

        if have_completed_order {
            OrderRecord::delete(self.store.as_ref()).await?;
        }

        self.ensure_session().await?;

        let had_account = acc::AccountRecord::load(self.store.as_ref())
            .await?
            .is_some_and(|record| record.is_usable());

        let Keeper {
            config,
            identifiers,
            store,
            transport,
            directory,
            ..
        } = self;
        let transport = transport
            .as_mut()
            .ok_or_else(|| eyre!("session not initialized"))?;
        let directory = directory
            .as_ref()
            .ok_or_else(|| eyre!("session not initialized"))?;

        acc::ensure_account(transport, store.as_ref(), directory, &config.contact(), now).await?;

        if !had_account {
            // registration was this tick's transition
            return Ok(false);
        }

        order::new_order(transport, store.as_ref(), directory, identifiers).await?;
        Ok(false)
    }

    /// Pushes the in-flight order one step further along.
    async fn advance_order(
        &mut self,
        now: DateTime<Utc>,
        record: &mut OrderRecord,
    ) -> eyre::Result<bool> {
        self.ensure_session().await?;

        let Keeper {
            config,
            store,
            host,
            transport,
            directory,
            cert_key,
            ..
        } = self;
        let transport = transport
            .as_mut()
            .ok_or_else(|| eyre!("session not initialized"))?;
        let directory = directory
            .as_ref()
            .ok_or_else(|| eyre!("session not initialized"))?;

        // account context (no traffic once the record is on disk)
        acc::ensure_account(transport, store.as_ref(), directory, &config.contact(), now).await?;

        match record.status {
            OrderState::Pending => {
                // after a restart this picks up authorizations that were
                // validated before the cut
                order::refresh(transport, store.as_ref(), record).await?;

                if record.status == OrderState::Pending {
                    order::process_authorizations(
                        transport,
                        host.as_ref(),
                        record,
                        config.poll_interval(),
                        config.poll_max_attempts,
                    )
                    .await?;

                    order::refresh(transport, store.as_ref(), record).await?;
                }

                Ok(false)
            }

            OrderState::Ready => {
                let cert_key = cached_cert_key(cert_key, store.as_ref()).await?;

                order::finalize_order(
                    transport,
                    store.as_ref(),
                    record,
                    cert_key,
                    config.poll_interval(),
                    config.poll_max_attempts,
                )
                .await?;

                Ok(false)
            }

            OrderState::Processing => {
                // crashed between CSR submission and issuance
                for _ in 0..config.poll_max_attempts {
                    order::refresh(transport, store.as_ref(), record).await?;

                    match record.status {
                        OrderState::Processing => {
                            tokio::time::sleep(config.poll_interval()).await
                        }
                        _ => break,
                    }
                }

                match record.status {
                    OrderState::Invalid => Err(crate::error::OrderFailed(
                        "order became invalid during finalization".into(),
                    )
                    .into()),
                    OrderState::Processing => {
                        Err(crate::error::PollTimeout("order finalization").into())
                    }
                    _ => Ok(false),
                }
            }

            OrderState::Valid => {
                let cert_key = cached_cert_key(cert_key, store.as_ref()).await?;

                order::download_certificate(transport, store.as_ref(), record, cert_key, now)
                    .await?;

                Ok(true)
            }

            // both are filtered out before this point
            OrderState::Invalid | OrderState::Downloaded => Ok(false),
        }
    }

    /// Fetches the directory and builds the signing transport, once per
    /// process.
    async fn ensure_session(&mut self) -> eyre::Result<()> {
        if self.transport.is_some() {
            return Ok(());
        }

        let key = acc::ensure_account_key(self.store.as_ref()).await?;
        let directory = Directory::fetch(
            self.web.as_ref(),
            DirectoryUrl::Other(&self.config.acme_server_url),
        )
        .await
        .wrap_err("fetching CA directory")?;

        self.transport = Some(Transport::new(
            Arc::clone(&self.web),
            directory.nonce_pool(),
            key,
        ));
        self.directory = Some(directory);

        Ok(())
    }

    async fn stored_certificate(&self) -> eyre::Result<Option<Certificate>> {
        match self.store.read(CERTIFICATE_FILE).await? {
            Some(data) => {
                let pem = String::from_utf8(data).wrap_err("certificate is not UTF-8")?;
                Ok(Some(Certificate::new(pem)))
            }
            None => Ok(None),
        }
    }
}

/// Loads the certificate key through the keeper's cache slot.
async fn cached_cert_key<'a>(
    slot: &'a mut Option<RsaPrivateKey>,
    store: &dyn Store,
) -> eyre::Result<&'a RsaPrivateKey> {
    match slot {
        Some(key) => Ok(key),
        None => {
            let key = cert::ensure_cert_key(store).await?;
            Ok(slot.insert(key))
        }
    }
}
