//! Order life cycle.
//!
//! An order is the CA-side tracking object for one certificate request. Its
//! durable twin here is the [`OrderRecord`]: committed to the store the
//! moment the order exists, updated after every server round-trip, deleted
//! when the order fails or its certificate has been superseded. A reboot at
//! any point resumes from the record instead of opening a second order.

use chrono::{DateTime, Utc};
use eyre::{eyre, WrapErr as _};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};

use crate::{
    api,
    cert::{create_csr, csr_der_b64, Certificate, CERTIFICATE_FILE},
    dir::Directory,
    error::{OrderFailed, PollTimeout},
    store::Store,
    trans::Transport,
};

mod auth;

pub(crate) use self::auth::process_authorizations;

/// Serialized [`OrderRecord`].
pub(crate) const ORDER_FILE: &str = "order.json";

/// A freshly downloaded certificate must outlive this margin, or the CA
/// handed us something useless.
pub(crate) const VALIDITY_MARGIN_DAYS: i64 = 10;

/// Order state as tracked locally.
///
/// The first five states mirror [RFC 8555 §7.1.6]; `downloaded` is ours,
/// marking that the issued certificate is safely in the store.
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Downloaded,
}

impl OrderState {
    fn from_api(status: api::OrderStatus) -> Self {
        match status {
            api::OrderStatus::Pending => OrderState::Pending,
            api::OrderStatus::Ready => OrderState::Ready,
            api::OrderStatus::Processing => OrderState::Processing,
            api::OrderStatus::Valid => OrderState::Valid,
            api::OrderStatus::Invalid => OrderState::Invalid,
        }
    }

    /// Position on the forward path `pending → ready → processing → valid →
    /// downloaded`. `invalid` is terminal and outside the path.
    fn rank(self) -> u8 {
        match self {
            OrderState::Pending => 0,
            OrderState::Ready => 1,
            OrderState::Processing => 2,
            OrderState::Valid => 3,
            OrderState::Downloaded => 4,
            OrderState::Invalid => u8::MAX,
        }
    }
}

/// Durable view of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// The order URL, from `Location` on creation. Everything else about the
    /// order can be re-fetched through it.
    pub url: String,

    pub status: OrderState,

    /// When the CA forgets this order.
    pub expires: Option<DateTime<Utc>>,

    /// The domains being certified; the primary comes first.
    pub identifiers: Vec<String>,

    /// One authorization URL per identifier.
    pub authorizations: Vec<String>,

    /// URL the CSR is submitted to.
    pub finalize: String,

    /// URL of the issued certificate, once the order is `valid`.
    pub certificate: Option<String>,
}

impl OrderRecord {
    fn from_api(url: String, order: api::Order) -> eyre::Result<OrderRecord> {
        let identifiers = order
            .identifiers
            .iter()
            .filter(|id| id.is_type_dns())
            .map(|id| id.value.to_ascii_lowercase())
            .collect::<Vec<_>>();

        if identifiers.is_empty() {
            return Err(eyre!("order has no dns identifiers"));
        }

        Ok(OrderRecord {
            url,
            status: order
                .status
                .map(OrderState::from_api)
                .unwrap_or(OrderState::Pending),
            expires: parse_timestamp(order.expires.as_deref())?,
            identifiers,
            authorizations: order.authorizations.unwrap_or_default(),
            finalize: order.finalize,
            certificate: order.certificate,
        })
    }

    /// Folds a re-fetched order object into the record.
    ///
    /// The CA has been observed to return identifiers in a different order
    /// than they were requested in; the sets must still agree, anything else
    /// means we are looking at somebody else's order.
    fn update_from(&mut self, order: api::Order) -> eyre::Result<()> {
        let mut incoming = order
            .identifiers
            .iter()
            .map(|id| id.value.to_ascii_lowercase())
            .collect::<Vec<_>>();
        incoming.sort();

        let mut ours = self.identifiers.clone();
        ours.sort();

        if incoming != ours {
            return Err(eyre!(
                "order {} identifiers changed: {incoming:?} != {ours:?}",
                self.url
            ));
        }

        if let Some(status) = order.status {
            self.set_status(OrderState::from_api(status));
        }
        if let Some(authorizations) = order.authorizations {
            self.authorizations = authorizations;
        }
        if !order.finalize.is_empty() {
            self.finalize = order.finalize;
        }
        if order.certificate.is_some() {
            self.certificate = order.certificate;
        }
        if let Some(expires) = parse_timestamp(order.expires.as_deref())? {
            self.expires = Some(expires);
        }

        Ok(())
    }

    /// Applies a status observation, keeping the local state monotone.
    ///
    /// The server never legitimately moves an order backwards; if it appears
    /// to, we trust what we already committed.
    pub(crate) fn set_status(&mut self, status: OrderState) {
        if status == OrderState::Invalid || status.rank() >= self.status.rank() {
            self.status = status;
        } else {
            log::warn!(
                "Ignoring order status regression {:?} -> {status:?}",
                self.status
            );
        }
    }

    /// Whether the CA-side order has lapsed.
    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status != OrderState::Downloaded && self.expires.is_some_and(|expires| expires <= now)
    }

    pub(crate) async fn load(store: &dyn Store) -> eyre::Result<Option<OrderRecord>> {
        match store.read(ORDER_FILE).await? {
            Some(data) => Ok(Some(
                serde_json::from_slice(&data).wrap_err("parsing order record")?,
            )),
            None => Ok(None),
        }
    }

    pub(crate) async fn save(&self, store: &dyn Store) -> eyre::Result<()> {
        store
            .write(ORDER_FILE, &serde_json::to_vec_pretty(self)?)
            .await
    }

    pub(crate) async fn delete(store: &dyn Store) -> eyre::Result<()> {
        store.delete(ORDER_FILE).await
    }
}

fn parse_timestamp(ts: Option<&str>) -> eyre::Result<Option<DateTime<Utc>>> {
    ts.map(|ts| {
        DateTime::parse_from_rfc3339(ts)
            .map(|ts| ts.with_timezone(&Utc))
            .wrap_err_with(|| format!("bad timestamp {ts:?}"))
    })
    .transpose()
}

/// Creates a new order for `identifiers` and commits its record.
///
/// The record hits the store before any challenge traffic happens, so a
/// crash right after this call resumes into the same order.
pub(crate) async fn new_order(
    transport: &Transport,
    store: &dyn Store,
    directory: &Directory,
    identifiers: &[String],
) -> eyre::Result<OrderRecord> {
    let payload = api::Order::from_identifiers(
        identifiers
            .iter()
            .map(|domain| api::Identifier::dns(domain))
            .collect(),
    );

    let res = transport
        .call_kid(directory.new_order_url(), &payload)
        .await?;

    let order_url = res
        .header("location")
        .ok_or_else(|| eyre!("newOrder response missing Location header"))?
        .to_owned();
    let api_order = res.json::<api::Order>()?;

    let record = OrderRecord::from_api(order_url, api_order)?;
    record.save(store).await?;

    log::info!("Created order {} for {:?}", record.url, record.identifiers);
    Ok(record)
}

/// Re-fetches the order (POST-as-GET) and commits the updated record.
pub(crate) async fn refresh(
    transport: &Transport,
    store: &dyn Store,
    record: &mut OrderRecord,
) -> eyre::Result<()> {
    let res = transport.call_kid(&record.url, &api::EmptyString).await?;
    let api_order = res.json::<api::Order>()?;

    record.update_from(api_order)?;
    record.save(store).await
}

/// Submits the CSR and polls the order until the certificate is issued.
pub(crate) async fn finalize_order(
    transport: &Transport,
    store: &dyn Store,
    record: &mut OrderRecord,
    cert_key: &RsaPrivateKey,
    poll_interval: std::time::Duration,
    poll_max_attempts: u32,
) -> eyre::Result<()> {
    let domains = record
        .identifiers
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();

    let csr = create_csr(cert_key, &domains)?;
    let payload = api::Finalize::new(csr_der_b64(&csr)?);

    // An unacceptable CSR comes back as a 4xx problem right here.
    let res = transport.call_kid(&record.finalize, &payload).await?;
    let api_order = res.json::<api::Order>()?;
    record.update_from(api_order)?;
    record.save(store).await?;

    // wait for the status to leave processing:
    // valid -> cert is issued
    // invalid -> the whole order is off
    for _ in 0..poll_max_attempts {
        match record.status {
            OrderState::Valid if record.certificate.is_some() => return Ok(()),
            OrderState::Valid => {
                return Err(eyre!("order is valid but has no certificate URL"));
            }
            OrderState::Invalid => {
                return Err(OrderFailed("order became invalid during finalization".into()).into());
            }
            _ => {}
        }

        tokio::time::sleep(poll_interval).await;
        refresh(transport, store, record).await?;
    }

    Err(PollTimeout("order finalization").into())
}

/// Downloads the issued chain, validates it, and commits it.
///
/// The PEM hits the store before the record flips to `downloaded`, so the
/// record never claims a certificate that is not on disk.
pub(crate) async fn download_certificate(
    transport: &Transport,
    store: &dyn Store,
    record: &mut OrderRecord,
    cert_key: &RsaPrivateKey,
    now: DateTime<Utc>,
) -> eyre::Result<Certificate> {
    let url = record
        .certificate
        .clone()
        .ok_or_else(|| eyre!("order has no certificate URL"))?;

    let res = transport
        .call_kid_accept(&url, &api::EmptyString, "application/pem-certificate-chain")
        .await?;

    match res.content_type() {
        Some("application/pem-certificate-chain") => {}
        other => return Err(eyre!("unexpected certificate content type: {other:?}")),
    }

    let pem = String::from_utf8(res.body).wrap_err("certificate is not UTF-8")?;
    let certificate = Certificate::new(pem);

    // Paranoia before commit: it parses, it is ours, it covers our names,
    // and it is not about to expire.
    if !certificate.matches_key(cert_key)? {
        return Err(eyre!("issued certificate does not match our key"));
    }
    if !certificate.is_usable(&record.identifiers, now, VALIDITY_MARGIN_DAYS) {
        return Err(eyre!(
            "issued certificate does not cover {:?} or expires too soon",
            record.identifiers
        ));
    }

    store
        .write(CERTIFICATE_FILE, certificate.pem().as_bytes())
        .await?;

    record.set_status(OrderState::Downloaded);
    record.save(store).await?;

    log::info!(
        "Certificate for {:?} stored; valid until {}",
        record.identifiers,
        certificate.not_after()?
    );

    Ok(certificate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn api_order(status: api::OrderStatus) -> api::Order {
        api::Order {
            status: Some(status),
            expires: Some("2030-01-09T08:26:43.570360537Z".to_owned()),
            identifiers: vec![api::Identifier::dns("device.example.com")],
            authorizations: Some(vec!["https://ca/acme/authz/1".to_owned()]),
            finalize: "https://ca/acme/finalize/1".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_api_maps_fields() {
        let record =
            OrderRecord::from_api("https://ca/acme/order/1".to_owned(), api_order(api::OrderStatus::Pending))
                .unwrap();

        assert_eq!(record.status, OrderState::Pending);
        assert_eq!(record.identifiers, vec!["device.example.com"]);
        assert_eq!(record.authorizations.len(), 1);
        // fractional seconds parse fine
        assert!(record.expires.is_some());
    }

    #[test]
    fn test_status_is_monotone() {
        let mut record =
            OrderRecord::from_api("https://ca/acme/order/1".to_owned(), api_order(api::OrderStatus::Ready))
                .unwrap();

        // a regression is ignored
        record.set_status(OrderState::Pending);
        assert_eq!(record.status, OrderState::Ready);

        // forward movement applies
        record.set_status(OrderState::Valid);
        assert_eq!(record.status, OrderState::Valid);

        // invalid is terminal and always applies
        record.set_status(OrderState::Invalid);
        assert_eq!(record.status, OrderState::Invalid);
    }

    #[test]
    fn test_update_rejects_identifier_swap() {
        let mut record =
            OrderRecord::from_api("https://ca/acme/order/1".to_owned(), api_order(api::OrderStatus::Pending))
                .unwrap();

        let mut other = api_order(api::OrderStatus::Pending);
        other.identifiers = vec![api::Identifier::dns("attacker.example.com")];

        assert!(record.update_from(other).is_err());
    }

    #[test]
    fn test_update_tolerates_reordered_identifiers() {
        let mut base = api_order(api::OrderStatus::Pending);
        base.identifiers = vec![
            api::Identifier::dns("device.example.com"),
            api::Identifier::dns("alt.example.com"),
        ];
        let mut record = OrderRecord::from_api("https://ca/acme/order/1".to_owned(), base).unwrap();

        let mut reordered = api_order(api::OrderStatus::Ready);
        reordered.identifiers = vec![
            api::Identifier::dns("alt.example.com"),
            api::Identifier::dns("device.example.com"),
        ];

        record.update_from(reordered).unwrap();
        assert_eq!(record.status, OrderState::Ready);
        // our ordering is preserved: primary stays first
        assert_eq!(record.identifiers[0], "device.example.com");
    }

    #[test]
    fn test_expiry_check() {
        let mut record =
            OrderRecord::from_api("https://ca/acme/order/1".to_owned(), api_order(api::OrderStatus::Pending))
                .unwrap();

        let before = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let after = DateTime::parse_from_rfc3339("2030-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(!record.is_expired(before));
        assert!(record.is_expired(after));

        // a downloaded order no longer expires
        record.set_status(OrderState::Downloaded);
        assert!(!record.is_expired(after));
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let store = MemStore::new();

        let record =
            OrderRecord::from_api("https://ca/acme/order/1".to_owned(), api_order(api::OrderStatus::Pending))
                .unwrap();
        record.save(&store).await.unwrap();

        let loaded = OrderRecord::load(&store).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        OrderRecord::delete(&store).await.unwrap();
        assert!(OrderRecord::load(&store).await.unwrap().is_none());
    }
}
