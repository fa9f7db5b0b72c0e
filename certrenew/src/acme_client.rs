use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use instant_acme::{
    Account, AccountCredentials, ChallengeType, ExternalAccountKey, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::KeyPair;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info};
use x509_parser::prelude::Pem;

use jws::{b64, JwsClient, Signer};

mod jws;

/// RFC 5280 CRLReason `cessationOfOperation`.
pub(crate) const REASON_CESSATION_OF_OPERATION: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct Challenge {
    pub r#type: String,
    pub token: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Authorization {
    pub url: String,
    pub identifier: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
}

/// The certificate chain issued for an order.
#[derive(Debug, Clone)]
pub(crate) struct IssuedChain {
    /// Certificate resource URL on the CA.
    pub url: String,
    /// PEM chain, leaf first.
    pub pem: String,
}

/// The subset of an ACME client an issuance run needs.
pub(crate) trait AcmeApi {
    type Order;

    /// Opens a new order for the given DNS names.
    async fn authorize_order(&self, identifiers: &[String]) -> Result<Self::Order>;

    /// Fetches the current state of every authorization of the order.
    async fn authorizations(&self, order: &mut Self::Order) -> Result<Vec<Authorization>>;

    /// The TXT record value for a `dns-01` challenge of the order.
    fn dns01_value(&self, order: &Self::Order, challenge: &Challenge) -> Result<String>;

    /// Tells the CA the challenge is ready to be validated.
    async fn accept_challenge(
        &self,
        order: &mut Self::Order,
        challenge: &Challenge,
    ) -> Result<()>;

    /// Waits until the authorization leaves the pending state.
    async fn wait_authorization(
        &self,
        order: &mut Self::Order,
        authz_url: &str,
    ) -> Result<AuthorizationStatus>;

    /// Waits until the order is ready to be finalized.
    async fn wait_order(&self, order: &mut Self::Order) -> Result<()>;

    /// Submits the CSR and downloads the issued chain.
    async fn finalize_order(
        &self,
        order: &mut Self::Order,
        csr_der: &[u8],
    ) -> Result<IssuedChain>;

    /// Deactivates an authorization that is no longer needed.
    async fn revoke_authorization(&self, authz_url: &str) -> Result<()>;

    /// Deactivates the account. No further calls may be made with it.
    async fn deactivate_account(&self) -> Result<()>;

    /// Revokes a certificate, authenticating with the certificate's own key.
    async fn revoke_certificate(
        &self,
        cert_key: &KeyPair,
        cert_der: &[u8],
        reason: u8,
    ) -> Result<()>;
}

/// External Account Binding credentials.
#[derive(Debug, Clone)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    /// base64url encoded HMAC key
    pub hmac_key: String,
}

impl ExternalAccountBinding {
    pub(crate) fn decode_hmac_key(&self) -> Result<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(self.hmac_key.trim_end_matches('='))
            .context("EAB HMAC key is not valid base64url")
    }
}

/// An order together with the challenges last fetched for it.
pub(crate) struct AcmeOrder {
    order: Order,
    challenges: Vec<instant_acme::Challenge>,
}

/// A freshly registered ACME account, alive for one issuance run.
pub(crate) struct AcmeSession {
    account: Account,
    signer: Signer,
    jws: JwsClient,
}

impl AcmeSession {
    /// Registers a new account with a freshly generated P-256 key.
    pub async fn register(
        acme_url: &str,
        contact: &str,
        eab: Option<&ExternalAccountBinding>,
    ) -> Result<Self> {
        let eab = eab
            .map(|eab| -> Result<_> {
                Ok(ExternalAccountKey::new(
                    eab.key_id.clone(),
                    &eab.decode_hmac_key()?,
                ))
            })
            .transpose()?;
        info!("registering new ACME account at {acme_url}");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            acme_url,
            eab.as_ref(),
        )
        .await
        .context("failed to create new account")?;
        let signer = account_signer(&credentials)?;
        let jws = JwsClient::discover(acme_url).await?;
        info!("registered account {}", account.id());
        Ok(Self {
            account,
            signer,
            jws,
        })
    }
}

/// Builds a signer from the account key. This is a workaround for
/// instant_acme::AccountCredentials not exposing the key.
fn account_signer(credentials: &AccountCredentials) -> Result<Signer> {
    #[derive(Deserialize)]
    struct KeyInfo {
        id: String,
        key_pkcs8: String,
    }
    let info: KeyInfo = serde_json::from_value(serde_json::to_value(credentials)?)
        .context("failed to read account credentials")?;
    let pkcs8 = URL_SAFE_NO_PAD
        .decode(&info.key_pkcs8)
        .context("invalid account key encoding")?;
    Signer::from_pkcs8(&pkcs8, Some(info.id))
}

/// Polling delay doubling from one second up to ten.
struct Backoff {
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }

    async fn wait(&mut self) {
        sleep(self.delay).await;
        self.delay = (self.delay * 2).min(Duration::from_secs(10));
    }
}

fn challenge_type_name(r#type: &ChallengeType) -> &'static str {
    match r#type {
        ChallengeType::Http01 => "http-01",
        ChallengeType::Dns01 => "dns-01",
        ChallengeType::TlsAlpn01 => "tls-alpn-01",
        #[allow(unreachable_patterns)]
        _ => "unknown",
    }
}

impl AcmeApi for AcmeSession {
    type Order = AcmeOrder;

    async fn authorize_order(&self, identifiers: &[String]) -> Result<AcmeOrder> {
        let identifiers = identifiers
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;
        Ok(AcmeOrder {
            order,
            challenges: vec![],
        })
    }

    async fn authorizations(&self, order: &mut AcmeOrder) -> Result<Vec<Authorization>> {
        let urls = order.order.state().authorizations.clone();
        let authorizations = order
            .order
            .authorizations()
            .await
            .context("failed to get authorizations")?;
        if urls.len() != authorizations.len() {
            bail!("authorization count mismatch");
        }
        order.challenges.clear();
        urls.into_iter()
            .zip(authorizations)
            .map(|(url, authz)| {
                #[allow(unreachable_patterns)]
                let identifier = match authz.identifier {
                    Identifier::Dns(name) => name,
                    other => bail!("unsupported identifier: {other:?}"),
                };
                let status = match authz.status {
                    instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
                    instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
                    instant_acme::AuthorizationStatus::Invalid => AuthorizationStatus::Invalid,
                    _ => AuthorizationStatus::Other,
                };
                let challenges = authz
                    .challenges
                    .iter()
                    .map(|c| Challenge {
                        r#type: challenge_type_name(&c.r#type).to_string(),
                        token: c.token.clone(),
                        url: c.url.clone(),
                    })
                    .collect();
                order.challenges.extend(authz.challenges);
                Ok(Authorization {
                    url,
                    identifier,
                    status,
                    challenges,
                })
            })
            .collect()
    }

    fn dns01_value(&self, order: &AcmeOrder, challenge: &Challenge) -> Result<String> {
        let challenge = order
            .challenges
            .iter()
            .find(|c| c.url == challenge.url)
            .with_context(|| format!("challenge {} not found in order", challenge.url))?;
        Ok(order.order.key_authorization(challenge).dns_value())
    }

    async fn accept_challenge(&self, order: &mut AcmeOrder, challenge: &Challenge) -> Result<()> {
        order
            .order
            .set_challenge_ready(&challenge.url)
            .await
            .context("failed to set challenge ready")
    }

    async fn wait_authorization(
        &self,
        order: &mut AcmeOrder,
        authz_url: &str,
    ) -> Result<AuthorizationStatus> {
        let mut backoff = Backoff::new();
        loop {
            let status = self
                .authorizations(order)
                .await?
                .into_iter()
                .find(|authz| authz.url == authz_url)
                .with_context(|| format!("authorization {authz_url} not found in order"))?
                .status;
            if status != AuthorizationStatus::Pending {
                return Ok(status);
            }
            debug!("authorization {authz_url} is pending, waiting {:?}", backoff.delay);
            backoff.wait().await;
        }
    }

    async fn wait_order(&self, order: &mut AcmeOrder) -> Result<()> {
        let order = &mut order.order;
        let mut backoff = Backoff::new();
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Pending | OrderStatus::Processing => {
                    debug!("order is not ready yet, waiting {:?}", backoff.delay);
                    backoff.wait().await;
                }
                OrderStatus::Invalid => bail!("order is invalid: {:?}", order.state().error),
            }
        }
    }

    async fn finalize_order(&self, order: &mut AcmeOrder, csr_der: &[u8]) -> Result<IssuedChain> {
        let order = &mut order.order;
        debug!("order is ready, uploading CSR");
        order
            .finalize(csr_der)
            .await
            .context("failed to finalize order")?;
        let mut backoff = Backoff::new();
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                OrderStatus::Valid => break,
                OrderStatus::Invalid => bail!("order is invalid: {:?}", order.state().error),
                _ => {
                    debug!("order is processing, waiting {:?}", backoff.delay);
                    backoff.wait().await;
                }
            }
        }
        let url = order
            .state()
            .certificate
            .clone()
            .context("valid order has no certificate url")?;
        let pem = extract_certificate(order).await?;
        Ok(IssuedChain { url, pem })
    }

    async fn revoke_authorization(&self, authz_url: &str) -> Result<()> {
        self.jws
            .post(&self.signer, authz_url, &json!({ "status": "deactivated" }))
            .await
    }

    async fn deactivate_account(&self) -> Result<()> {
        self.jws
            .post(
                &self.signer,
                self.account.id(),
                &json!({ "status": "deactivated" }),
            )
            .await
    }

    async fn revoke_certificate(
        &self,
        cert_key: &KeyPair,
        cert_der: &[u8],
        reason: u8,
    ) -> Result<()> {
        let signer = Signer::from_pkcs8(&cert_key.serialize_der(), None)?;
        self.jws
            .post(
                &signer,
                self.jws.revoke_cert_url(),
                &json!({ "certificate": b64(cert_der), "reason": reason }),
            )
            .await
    }
}

async fn extract_certificate(order: &mut Order) -> Result<String> {
    let mut tries = 0;
    let cert_chain_pem = loop {
        tries += 1;
        if tries > 5 {
            bail!("failed to get certificate");
        }
        match order
            .certificate()
            .await
            .context("failed to get certificate")?
        {
            Some(cert_chain_pem) => break cert_chain_pem,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    Ok(cert_chain_pem)
}

/// Splits a PEM chain into DER certificates, in order.
pub(crate) fn read_pem_chain(chain_pem: &str) -> Result<Vec<Vec<u8>>> {
    Pem::iter_from_buffer(chain_pem.as_bytes())
        .map(|pem| {
            let pem = pem.context("Invalid pem")?;
            if pem.label != "CERTIFICATE" {
                bail!("unexpected pem block: {}", pem.label);
            }
            Ok(pem.contents)
        })
        .collect()
}
