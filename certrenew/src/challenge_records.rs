//! Publishing and retracting the `_acme-challenge` TXT record.
//!
//! The records created here are recognised by a fixed tag (stored in the
//! provider's record comment) rather than by the id returned on creation, so a
//! record left behind by a crashed run is cleaned up by the next one.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Error, Result};
use hickory_resolver::{error::ResolveErrorKind, AsyncResolver};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::dns01_client::{Dns01Api, NewRecord, RecordFilter};

/// Tag attached to every record this crate creates.
pub(crate) const CHALLENGE_TAG: &str = "acme-challenge";
/// TTL of the challenge record, in seconds.
pub(crate) const CHALLENGE_TTL: u32 = 60;

const CHALLENGE_FILTER: RecordFilter<'static> = RecordFilter {
    r#type: "TXT",
    tag: CHALLENGE_TAG,
};

const FIRST_POLL_DELAY: Duration = Duration::from_millis(250);
const MAX_POLL_TRIES: u8 = 10;

/// How to wait for a freshly created record to become visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    /// Poll the system resolver until the record carries the expected value.
    Resolve,
    /// Sleep for a fixed delay.
    Fixed(Duration),
}

/// Looks up the TXT records of a name.
pub(crate) trait TxtResolver {
    /// Returns the TXT values of `name`, or `None` when the name has no TXT
    /// record yet. Any other failure is an error.
    async fn txt_lookup(&self, name: &str) -> Result<Option<Vec<String>>>;
}

/// Queries the resolvers from the system configuration.
pub(crate) struct SystemResolver;

impl TxtResolver for SystemResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Option<Vec<String>>> {
        // A fresh resolver per lookup: a cached negative answer would
        // otherwise hide the record for the whole SOA negative TTL.
        let resolver =
            AsyncResolver::tokio_from_system_conf().context("failed to create dns resolver")?;
        match resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(Some(
                lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|data| String::from_utf8_lossy(data))
                            .collect()
                    })
                    .collect(),
            )),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(None),
                _ => bail!("failed to lookup dns record {name}: {err}"),
            },
        }
    }
}

/// Creates, lists and deletes the tagged challenge records of one zone.
pub(crate) struct ChallengeRecords<C, R = SystemResolver> {
    client: C,
    propagation: Propagation,
    resolver: R,
}

impl<C: Dns01Api> ChallengeRecords<C> {
    /// Authenticates against the provider and returns a ready manager.
    ///
    /// An authentication failure is returned as an error: without it no
    /// challenge can be published.
    pub async fn connect(client: C, propagation: Propagation) -> Result<Self> {
        info!("verifying dns provider credentials");
        client
            .verify()
            .await
            .context("dns provider authentication failed")?;
        Ok(Self {
            client,
            propagation,
            resolver: SystemResolver,
        })
    }

    #[cfg(test)]
    pub fn with_resolver<R: TxtResolver>(self, resolver: R) -> ChallengeRecords<C, R> {
        ChallengeRecords {
            client: self.client,
            propagation: self.propagation,
            resolver,
        }
    }
}

impl<C: Dns01Api, R: TxtResolver> ChallengeRecords<C, R> {
    /// Returns the ids of all tagged records in the zone.
    ///
    /// A failed query is reported as "no records".
    pub async fn list_challenge_records(&self) -> Vec<String> {
        match self.client.list_records(&CHALLENGE_FILTER).await {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(err) => {
                warn!("failed to list challenge records: {err:?}");
                vec![]
            }
        }
    }

    /// Replaces any tagged record with a TXT record `name` = `token` and waits
    /// until it is visible.
    ///
    /// Returns the warnings produced while removing stale records.
    pub async fn upsert_challenge_record(&self, name: &str, token: &str) -> Result<Vec<Error>> {
        let warnings = self.delete_challenge_records().await;
        debug!("creating dns record {name}");
        let id = self
            .client
            .create_record(&NewRecord {
                r#type: "TXT",
                name,
                content: token,
                ttl: CHALLENGE_TTL,
                tag: CHALLENGE_TAG,
            })
            .await
            .with_context(|| format!("failed to create dns record {name}"))?;
        info!("created dns record {name} ({id})");
        self.wait_for_propagation(name, token).await?;
        Ok(warnings)
    }

    /// Deletes every tagged record, best effort.
    ///
    /// Returns immediately when there is nothing to delete. Failures are
    /// returned as warnings and never abort the caller.
    pub async fn delete_challenge_records(&self) -> Vec<Error> {
        let ids = self.list_challenge_records().await;
        if ids.is_empty() {
            debug!("no challenge records to delete");
            return vec![];
        }
        let mut warnings = vec![];
        let mut deleted = vec![];
        for id in ids {
            debug!("removing dns record {id}");
            match self.client.remove_record(&id).await {
                Ok(()) => deleted.push(id),
                Err(err) => {
                    warn!("failed to remove dns record {id}: {err:?}");
                    warnings.push(err.context(format!("failed to remove dns record {id}")));
                }
            }
        }
        if !deleted.is_empty() {
            if let Err(err) = self.wait_until_gone(&deleted).await {
                warn!("{err:?}");
                warnings.push(err);
            }
        }
        warnings
    }

    async fn wait_until_gone(&self, deleted: &[String]) -> Result<()> {
        let mut delay = FIRST_POLL_DELAY;
        for tries in 1..=MAX_POLL_TRIES {
            let remaining = self
                .list_challenge_records()
                .await
                .into_iter()
                .filter(|id| deleted.contains(id))
                .count();
            if remaining == 0 {
                return Ok(());
            }
            debug!(tries, remaining, "deleted records still listed, waiting {delay:?}");
            sleep(delay).await;
            delay *= 2;
        }
        Err(anyhow!("deleted challenge records are still listed"))
    }

    async fn wait_for_propagation(&self, name: &str, token: &str) -> Result<()> {
        match &self.propagation {
            Propagation::Fixed(delay) => {
                debug!("waiting {delay:?} for {name} to propagate");
                sleep(*delay).await;
                Ok(())
            }
            Propagation::Resolve => self
                .wait_for_txt(name, token)
                .await
                .with_context(|| format!("dns record {name} did not propagate")),
        }
    }

    /// Polls the resolver until `name` has a TXT record equal to `value`.
    async fn wait_for_txt(&self, name: &str, value: &str) -> Result<()> {
        let mut delay = FIRST_POLL_DELAY;
        for tries in 1..=MAX_POLL_TRIES {
            sleep(delay).await;
            let settled = self
                .resolver
                .txt_lookup(name)
                .await?
                .is_some_and(|values| values.iter().any(|txt| txt == value));
            if settled {
                debug!(tries, "dns record {name} is visible");
                return Ok(());
            }
            delay *= 2;
            debug!(tries, domain = name, "challenge not found, waiting {delay:?}");
        }
        bail!("dns record not found")
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }
}
