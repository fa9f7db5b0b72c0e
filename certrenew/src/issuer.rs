//! Drives one ACME order from creation to teardown.

use anyhow::{anyhow, bail, Context, Error, Result};
use chrono::Utc;
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use x509_parser::prelude::{GeneralName, X509Certificate};

use crate::{
    acme_client::{
        read_pem_chain, AcmeApi, Authorization, AuthorizationStatus,
        REASON_CESSATION_OF_OPERATION,
    },
    challenge_records::{ChallengeRecords, TxtResolver},
    dns01_client::Dns01Api,
};

/// The only validation method supported.
pub(crate) const CHALLENGE_TYPE: &str = "dns-01";

/// The result of a successful issuance run.
pub struct IssuedCertificate {
    /// PKCS#8 PEM private key of the certificate.
    pub key_pem: String,
    /// Certificate resource URL on the CA.
    pub certificate_url: String,
    /// PEM chain as served from `certificate_url`, leaf first.
    pub chain_pem: String,
    /// Non-fatal errors collected along the way.
    pub errors: Vec<Error>,
}

pub(crate) struct Issuer<'a, A, C, R> {
    acme: &'a A,
    records: &'a ChallengeRecords<C, R>,
}

impl<'a, A: AcmeApi, C: Dns01Api, R: TxtResolver> Issuer<'a, A, C, R> {
    pub fn new(acme: &'a A, records: &'a ChallengeRecords<C, R>) -> Self {
        Self { acme, records }
    }

    /// Runs a whole order for `identifiers`, bounded by `deadline`.
    ///
    /// Challenge records are cleaned up before returning, whatever the outcome.
    pub async fn run_order(
        &self,
        deadline: Instant,
        identifiers: &[String],
    ) -> Result<IssuedCertificate> {
        let result = timeout_at(deadline, self.run_order_inner(identifiers))
            .await
            .context("certificate issuance timed out")
            .and_then(|result| result);
        info!("cleaning up challenge records");
        let cleanup = match timeout_at(deadline, self.records.delete_challenge_records()).await {
            Ok(warnings) => warnings,
            Err(_) => {
                error!("challenge record cleanup timed out");
                vec![anyhow!("challenge record cleanup timed out")]
            }
        };
        let mut issued = result?;
        issued.errors.extend(cleanup);
        Ok(issued)
    }

    async fn run_order_inner(&self, identifiers: &[String]) -> Result<IssuedCertificate> {
        if identifiers.is_empty() {
            bail!("at least one domain identifier is required");
        }
        info!("requesting new certificate for {}", identifiers.join(", "));
        let mut errors = vec![];
        let mut order = self
            .acme
            .authorize_order(identifiers)
            .await
            .context("failed to authorize order")?;

        let authorizations = self
            .acme
            .authorizations(&mut order)
            .await
            .context("failed to get authorizations")?;
        let mut fulfilled = vec![];
        for authz in &authorizations {
            debug!("{authz:?}");
            if authz.status != AuthorizationStatus::Pending {
                info!(
                    "authorization for {} is {:?}; skipping",
                    authz.identifier, authz.status
                );
                continue;
            }
            let warnings = self
                .fulfill(&mut order, authz)
                .await
                .with_context(|| format!("failed to fulfill {}", authz.url))?;
            errors.extend(warnings);
            fulfilled.push(authz.url.clone());
            info!("authorized for {}", authz.identifier);
        }

        info!("all challenges are done");
        self.acme
            .wait_order(&mut order)
            .await
            .context("failed waiting for order")?;

        let key = KeyPair::generate().context("failed to generate certificate key")?;
        let csr = make_csr(&key, identifiers)?;
        let chain = self
            .acme
            .finalize_order(&mut order, &csr)
            .await
            .context("failed to finalize order")?;
        info!("cert URL: {}", chain.url);
        debug!("cert chain:\n{}", chain.pem);

        let der_chain = match read_pem_chain(&chain.pem) {
            Ok(der_chain) => {
                if let Err(err) = check_cert(&der_chain, identifiers) {
                    error!("invalid cert: {err:?}");
                    errors.push(err.context("invalid cert"));
                }
                der_chain
            }
            Err(err) => {
                error!("unreadable cert chain: {err:?}");
                errors.push(err.context("invalid cert"));
                vec![]
            }
        };

        errors.extend(
            self.teardown(&fulfilled, &key, der_chain.first().map(Vec::as_slice))
                .await,
        );

        Ok(IssuedCertificate {
            key_pem: key.serialize_pem(),
            certificate_url: chain.url,
            chain_pem: chain.pem,
            errors,
        })
    }

    /// Publishes the challenge record for one authorization and waits for the
    /// CA to validate it.
    async fn fulfill(&self, order: &mut A::Order, authz: &Authorization) -> Result<Vec<Error>> {
        for (i, challenge) in authz.challenges.iter().enumerate() {
            debug!("challenge {i}: {challenge:?}");
        }
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == CHALLENGE_TYPE)
            .with_context(|| {
                format!(
                    "challenge type {CHALLENGE_TYPE:?} wasn't offered for authz {}",
                    authz.url
                )
            })?;
        info!("picked {} for authz {}", challenge.url, authz.url);

        let dns_value = self.acme.dns01_value(order, challenge)?;
        let acme_domain = format!("_acme-challenge.{}", authz.identifier);
        let mut warnings = self
            .records
            .upsert_challenge_record(&acme_domain, &dns_value)
            .await?;

        debug!("setting challenge ready for {}", challenge.url);
        self.acme
            .accept_challenge(order, challenge)
            .await
            .with_context(|| format!("failed to accept {}", challenge.url))?;
        let status = self
            .acme
            .wait_authorization(order, &authz.url)
            .await
            .with_context(|| format!("failed waiting for {}", authz.url))?;
        if status != AuthorizationStatus::Valid {
            bail!("authorization for {} is {status:?}", authz.identifier);
        }

        warnings.extend(self.records.delete_challenge_records().await);
        Ok(warnings)
    }

    /// Best-effort release of everything the run created on the CA.
    async fn teardown(
        &self,
        fulfilled: &[String],
        cert_key: &KeyPair,
        leaf: Option<&[u8]>,
    ) -> Vec<Error> {
        let mut errors = vec![];
        let mut soft = |result: Result<()>, what: String| {
            if let Err(err) = result {
                warn!("{what}: {err:?}");
                errors.push(err.context(what));
            }
        };
        for url in fulfilled {
            soft(
                self.acme.revoke_authorization(url).await,
                format!("failed to revoke authorization {url}"),
            );
        }
        soft(
            self.acme.deactivate_account().await,
            "failed to deactivate account".into(),
        );
        let revoked = match leaf {
            Some(leaf) => {
                self.acme
                    .revoke_certificate(cert_key, leaf, REASON_CESSATION_OF_OPERATION)
                    .await
            }
            None => Err(anyhow!("no certificate to revoke")),
        };
        soft(revoked, "failed to revoke certificate".into());
        errors
    }
}

fn make_csr(key: &KeyPair, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let csr = params
        .serialize_request(key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}

/// Checks the chain is non-empty and well formed, and that the leaf is valid
/// for every identifier.
pub(crate) fn check_cert(der_chain: &[Vec<u8>], identifiers: &[String]) -> Result<()> {
    if der_chain.is_empty() {
        bail!("cert chain is empty");
    }
    for (i, der) in der_chain.iter().enumerate() {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .with_context(|| format!("{i}: failed to parse certificate"))?;
        let days_left =
            (cert.validity().not_after.timestamp() - Utc::now().timestamp()) as f64 / 86400.0;
        info!("{i}: serial: {}", cert.raw_serial_as_string());
        info!("{i}: subject: {}", cert.subject());
        info!("{i}: issuer: {}", cert.issuer());
        info!("{i}: expires in {days_left:.1} day(s)");
        if i > 0 {
            continue;
        }
        for identifier in identifiers {
            verify_hostname(&cert, identifier)?;
        }
    }
    Ok(())
}

/// Checks that `host` is covered by a DNS name in the certificate's SAN.
fn verify_hostname(cert: &X509Certificate, host: &str) -> Result<()> {
    let san = cert
        .tbs_certificate
        .subject_alternative_name()
        .context("failed to parse subject alternative name")?
        .context("certificate has no subject alternative name")?;
    let matched = san.value.general_names.iter().any(|name| match name {
        GeneralName::DNSName(pattern) => hostname_matches(pattern, host),
        _ => false,
    });
    if !matched {
        bail!("certificate is not valid for {host}");
    }
    Ok(())
}

fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        };
    }
    pattern == host
}
