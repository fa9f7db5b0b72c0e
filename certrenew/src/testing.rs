//! In-memory stand-ins for the DNS provider and the CA.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{bail, Context, Result};
use rcgen::{CertificateParams, KeyPair};
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509CertificationRequest};

use crate::{
    acme_client::{AcmeApi, Authorization, AuthorizationStatus, Challenge, IssuedChain},
    challenge_records::TxtResolver,
    dns01_client::{Dns01Api, NewRecord, Record, RecordFilter},
};

#[derive(Debug, Default)]
pub(crate) struct Zone {
    pub records: Vec<Record>,
    pub next_id: u64,
    /// Every mutation made by either double, in order.
    pub journal: Vec<String>,
    pub fail_verify: bool,
    pub fail_list: bool,
    pub fail_create: bool,
    pub fail_remove: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryDns {
    zone: Arc<Mutex<Zone>>,
}

impl MemoryDns {
    pub fn zone(&self) -> MutexGuard<'_, Zone> {
        self.zone.lock().unwrap()
    }

    pub fn journal(&self) -> Vec<String> {
        self.zone().journal.clone()
    }

    pub fn tagged(&self, tag: &str) -> Vec<Record> {
        self.zone()
            .records
            .iter()
            .filter(|r| r.comment.as_deref() == Some(tag))
            .cloned()
            .collect()
    }

    pub fn insert(&self, name: &str, content: &str, tag: Option<&str>) -> String {
        let mut zone = self.zone();
        zone.next_id += 1;
        let id = format!("rec-{}", zone.next_id);
        zone.records.push(Record {
            id: id.clone(),
            name: name.into(),
            content: content.into(),
            r#type: "TXT".into(),
            comment: tag.map(Into::into),
        });
        id
    }
}

impl Dns01Api for MemoryDns {
    async fn verify(&self) -> Result<()> {
        if self.zone().fail_verify {
            bail!("invalid api token");
        }
        Ok(())
    }

    async fn list_records(&self, filter: &RecordFilter<'_>) -> Result<Vec<Record>> {
        let zone = self.zone();
        if zone.fail_list {
            bail!("list failed");
        }
        Ok(zone
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn create_record(&self, record: &NewRecord<'_>) -> Result<String> {
        if self.zone().fail_create {
            bail!("create failed");
        }
        let id = self.insert(record.name, record.content, Some(record.tag));
        let mut zone = self.zone();
        zone.journal.push(format!("dns:create {}", record.name));
        if let Some(created) = zone.records.last_mut() {
            created.r#type = record.r#type.into();
        }
        Ok(id)
    }

    async fn remove_record(&self, record_id: &str) -> Result<()> {
        let mut zone = self.zone();
        if zone.fail_remove {
            bail!("remove failed");
        }
        let Some(pos) = zone.records.iter().position(|r| r.id == record_id) else {
            bail!("record {record_id} not found");
        };
        let record = zone.records.remove(pos);
        zone.journal.push(format!("dns:delete {}", record.name));
        Ok(())
    }
}

/// A CA that validates a challenge only if the expected TXT record is live
/// in the shared zone at the time the challenge is accepted.
pub(crate) struct MockAcme {
    pub dns: MemoryDns,
    /// Challenge types offered on every authorization.
    pub offered: Vec<&'static str>,
    /// Identifiers whose authorization is already valid.
    pub already_valid: Vec<String>,
    /// Names put in the issued certificate instead of the CSR's.
    pub issued_names: Option<Vec<String>>,
    pub empty_chain: bool,
    /// Serve a chain that is not made of certificates.
    pub bad_chain: bool,
    pub fail_order: bool,
    pub fail_teardown: bool,
}

pub(crate) struct MockOrder {
    identifiers: Vec<String>,
    authorizations: Vec<Authorization>,
}

impl MockAcme {
    pub fn new(dns: MemoryDns) -> Self {
        Self {
            dns,
            offered: vec!["http-01", "dns-01"],
            already_valid: vec![],
            issued_names: None,
            empty_chain: false,
            bad_chain: false,
            fail_order: false,
            fail_teardown: false,
        }
    }

    fn log(&self, entry: String) {
        self.dns.zone().journal.push(entry);
    }

    fn teardown_result(&self) -> Result<()> {
        if self.fail_teardown {
            bail!("server error");
        }
        Ok(())
    }
}

fn expected_dns_value(token: &str) -> String {
    format!("dns-value-{token}")
}

pub(crate) fn csr_dns_names(csr_der: &[u8]) -> Result<Vec<String>> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der).context("invalid csr")?;
    let mut names = vec![];
    for ext in csr.requested_extensions().into_iter().flatten() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_string());
                }
            }
        }
    }
    Ok(names)
}

impl AcmeApi for MockAcme {
    type Order = MockOrder;

    async fn authorize_order(&self, identifiers: &[String]) -> Result<MockOrder> {
        if self.fail_order {
            bail!("rateLimited");
        }
        self.log(format!("acme:order {}", identifiers.join(",")));
        let authorizations = identifiers
            .iter()
            .enumerate()
            .map(|(i, identifier)| Authorization {
                url: format!("https://ca.test/authz/{i}"),
                identifier: identifier.clone(),
                status: if self.already_valid.contains(identifier) {
                    AuthorizationStatus::Valid
                } else {
                    AuthorizationStatus::Pending
                },
                challenges: self
                    .offered
                    .iter()
                    .map(|kind| Challenge {
                        r#type: kind.to_string(),
                        token: format!("token-{i}"),
                        url: format!("https://ca.test/chall/{i}/{kind}"),
                    })
                    .collect(),
            })
            .collect();
        Ok(MockOrder {
            identifiers: identifiers.to_vec(),
            authorizations,
        })
    }

    async fn authorizations(&self, order: &mut MockOrder) -> Result<Vec<Authorization>> {
        Ok(order.authorizations.clone())
    }

    fn dns01_value(&self, order: &MockOrder, challenge: &Challenge) -> Result<String> {
        if !order
            .authorizations
            .iter()
            .any(|authz| authz.challenges.iter().any(|c| c.url == challenge.url))
        {
            bail!("unknown challenge");
        }
        Ok(expected_dns_value(&challenge.token))
    }

    async fn accept_challenge(&self, order: &mut MockOrder, challenge: &Challenge) -> Result<()> {
        let authz = order
            .authorizations
            .iter_mut()
            .find(|authz| authz.challenges.iter().any(|c| c.url == challenge.url))
            .context("unknown challenge")?;
        let expected_name = format!("_acme-challenge.{}", authz.identifier);
        let expected_value = expected_dns_value(&challenge.token);
        let visible = self
            .dns
            .zone()
            .records
            .iter()
            .any(|r| r.name == expected_name && r.content == expected_value);
        self.log(format!("acme:accept {}", authz.identifier));
        authz.status = if visible {
            AuthorizationStatus::Valid
        } else {
            AuthorizationStatus::Invalid
        };
        Ok(())
    }

    async fn wait_authorization(
        &self,
        order: &mut MockOrder,
        authz_url: &str,
    ) -> Result<AuthorizationStatus> {
        let authz = order
            .authorizations
            .iter()
            .find(|authz| authz.url == authz_url)
            .context("unknown authorization")?;
        self.log(format!("acme:authorized {} {:?}", authz.identifier, authz.status));
        Ok(authz.status)
    }

    async fn wait_order(&self, order: &mut MockOrder) -> Result<()> {
        if order
            .authorizations
            .iter()
            .any(|authz| authz.status != AuthorizationStatus::Valid)
        {
            bail!("order is invalid");
        }
        Ok(())
    }

    async fn finalize_order(&self, order: &mut MockOrder, csr_der: &[u8]) -> Result<IssuedChain> {
        let requested = csr_dns_names(csr_der)?;
        self.log(format!("acme:finalize {}", requested.join(",")));
        if requested != order.identifiers {
            bail!("csr does not match order identifiers");
        }
        if self.empty_chain {
            return Ok(IssuedChain {
                url: "https://ca.test/cert/1".into(),
                pem: String::new(),
            });
        }
        if self.bad_chain {
            return Ok(IssuedChain {
                url: "https://ca.test/cert/1".into(),
                pem: KeyPair::generate()?.serialize_pem(),
            });
        }
        let names = self.issued_names.clone().unwrap_or(requested);
        let ca_key = KeyPair::generate()?;
        let leaf = CertificateParams::new(names)?.self_signed(&ca_key)?;
        let issuer = CertificateParams::new(vec!["ca.test".to_string()])?.self_signed(&ca_key)?;
        Ok(IssuedChain {
            url: "https://ca.test/cert/1".into(),
            pem: format!("{}{}", leaf.pem(), issuer.pem()),
        })
    }

    async fn revoke_authorization(&self, authz_url: &str) -> Result<()> {
        self.log(format!("acme:revoke-authz {authz_url}"));
        self.teardown_result()
    }

    async fn deactivate_account(&self) -> Result<()> {
        self.log("acme:deactivate".into());
        self.teardown_result()
    }

    async fn revoke_certificate(
        &self,
        _cert_key: &KeyPair,
        cert_der: &[u8],
        reason: u8,
    ) -> Result<()> {
        x509_parser::parse_x509_certificate(cert_der).context("invalid certificate")?;
        self.log(format!("acme:revoke-cert {reason}"));
        self.teardown_result()
    }
}

/// A resolver replaying scripted answers, then reporting "no record".
#[derive(Clone, Default)]
pub(crate) struct ScriptedResolver {
    answers: Arc<Mutex<VecDeque<Result<Option<Vec<String>>>>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl ScriptedResolver {
    pub fn answer(&self, answer: Result<Option<Vec<String>>>) -> &Self {
        self.answers.lock().unwrap().push_back(answer);
        self
    }

    /// Names looked up so far.
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

impl TxtResolver for ScriptedResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Option<Vec<String>>> {
        self.lookups.lock().unwrap().push(name.to_string());
        self.answers.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}
