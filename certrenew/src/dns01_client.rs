use anyhow::Result;
use cloudflare::CloudflareClient;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

mod cloudflare;

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Represents a DNS record
pub(crate) struct Record {
    /// Unique identifier for the record
    pub id: String,
    /// The name of the DNS record (e.g., "_acme-challenge.example.com")
    pub name: String,
    /// The content of the DNS record (e.g., the TXT value for ACME challenges)
    pub content: String,
    /// The type of DNS record (e.g., "TXT" for ACME challenges)
    pub r#type: String,
    /// Free-form comment, used to tag the records this crate owns
    #[serde(default)]
    pub comment: Option<String>,
}

/// A record to be created in the zone.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewRecord<'a> {
    pub r#type: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub ttl: u32,
    pub tag: &'a str,
}

/// Selects records of one type carrying one tag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordFilter<'a> {
    pub r#type: &'a str,
    pub tag: &'a str,
}

impl RecordFilter<'_> {
    pub fn matches(&self, record: &Record) -> bool {
        record.r#type == self.r#type && record.comment.as_deref() == Some(self.tag)
    }
}

#[enum_dispatch]
pub(crate) trait Dns01Api {
    /// Checks that the API credentials are accepted by the provider.
    async fn verify(&self) -> Result<()>;

    /// Lists the records of the zone matching the filter.
    async fn list_records(&self, filter: &RecordFilter<'_>) -> Result<Vec<Record>>;

    /// Creates a record in the zone.
    ///
    /// Returns the ID of the created record.
    async fn create_record(&self, record: &NewRecord<'_>) -> Result<String>;

    /// Remove a DNS record.
    ///
    /// Deletes a DNS record using its unique identifier.
    async fn remove_record(&self, record_id: &str) -> Result<()>;
}

/// A DNS-01 client.
#[derive(Debug)]
#[enum_dispatch(Dns01Api)]
pub enum Dns01Client {
    Cloudflare(CloudflareClient),
}

impl Dns01Client {
    pub fn new_cloudflare(zone_id: String, api_token: String) -> Self {
        Self::Cloudflare(CloudflareClient::new(zone_id, api_token))
    }
}
