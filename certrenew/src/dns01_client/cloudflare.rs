use anyhow::{bail, Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use crate::dns01_client::{NewRecord, Record, RecordFilter};

use super::Dns01Api;

const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug)]
pub struct CloudflareClient {
    zone_id: String,
    api_token: String,
    client: Client,
}

#[derive(Deserialize)]
struct CloudflareResponse<T> {
    result: T,
}

impl CloudflareClient {
    pub fn new(zone_id: String, api_token: String) -> Self {
        Self {
            zone_id,
            api_token,
            client: Client::new(),
        }
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", CLOUDFLARE_API_URL, self.zone_id)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.api_token))
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    if !response.status().is_success() {
        let status = response.status();
        bail!("failed to {what} ({status}): {}", response.text().await?);
    }
    Ok(response)
}

impl Dns01Api for CloudflareClient {
    async fn verify(&self) -> Result<()> {
        let url = format!("{}/user/tokens/verify", CLOUDFLARE_API_URL);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .context("failed to reach cloudflare")?;
        let response = check_status(response, "verify api token").await?;

        #[derive(Deserialize)]
        struct TokenStatus {
            status: String,
        }

        let response: CloudflareResponse<TokenStatus> =
            response.json().await.context("failed to parse response")?;
        if response.result.status != "active" {
            bail!("cloudflare api token is {}", response.result.status);
        }
        Ok(())
    }

    async fn list_records(&self, filter: &RecordFilter<'_>) -> Result<Vec<Record>> {
        let response = self
            .authorized(self.client.get(self.records_url()))
            .query(&[
                ("type", filter.r#type),
                ("comment.exact", filter.tag),
                ("per_page", "100"),
            ])
            .send()
            .await?;
        let response = check_status(response, "get dns records").await?;

        let response: CloudflareResponse<Vec<Record>> =
            response.json().await.context("failed to parse response")?;

        // The comment filter is applied server side, but double check in case it was ignored.
        Ok(response
            .result
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    async fn create_record(&self, record: &NewRecord<'_>) -> Result<String> {
        let response = self
            .authorized(self.client.post(self.records_url()))
            .header("Content-Type", "application/json")
            .json(&json!({
                "type": record.r#type,
                "name": record.name,
                "content": record.content,
                "ttl": record.ttl,
                "comment": record.tag,
            }))
            .send()
            .await?;
        let response = check_status(response, "create dns record").await?;

        #[derive(Deserialize)]
        struct ApiResult {
            id: String,
        }

        let response: CloudflareResponse<ApiResult> =
            response.json().await.context("failed to parse response")?;

        Ok(response.result.id)
    }

    async fn remove_record(&self, record_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.records_url(), record_id);
        let response = self.authorized(self.client.delete(&url)).send().await?;
        check_status(response, "remove dns record").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: &str = "certrenew-live-test";

    fn create_client() -> CloudflareClient {
        CloudflareClient::new(
            std::env::var("CLOUDFLARE_ZONE_ID").expect("CLOUDFLARE_ZONE_ID not set"),
            std::env::var("CLOUDFLARE_API_TOKEN").expect("CLOUDFLARE_API_TOKEN not set"),
        )
    }

    fn random_subdomain() -> String {
        format!(
            "_acme-challenge.{}.{}",
            rand::random::<u64>(),
            std::env::var("TEST_DOMAIN").expect("TEST_DOMAIN not set"),
        )
    }

    fn filter() -> RecordFilter<'static> {
        RecordFilter {
            r#type: "TXT",
            tag: TAG,
        }
    }

    #[tokio::test]
    #[ignore = "needs cloudflare credentials"]
    async fn can_verify_token() {
        create_client().verify().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs cloudflare credentials"]
    async fn can_add_and_remove_txt_record() {
        let client = create_client();
        let subdomain = random_subdomain();
        println!("subdomain: {}", subdomain);
        let record_id = client
            .create_record(&NewRecord {
                r#type: "TXT",
                name: &subdomain,
                content: "1234567890",
                ttl: 60,
                tag: TAG,
            })
            .await
            .unwrap();
        let records = client.list_records(&filter()).await.unwrap();
        let record = records.iter().find(|r| r.id == record_id).unwrap();
        assert_eq!(record.content, "1234567890");
        assert_eq!(record.name, subdomain);
        client.remove_record(&record_id).await.unwrap();
        let records = client.list_records(&filter()).await.unwrap();
        assert!(records.iter().all(|r| r.id != record_id));
    }

    #[test]
    fn filter_requires_type_and_tag() {
        let record = Record {
            id: "1".into(),
            name: "_acme-challenge.example.com".into(),
            content: "x".into(),
            r#type: "TXT".into(),
            comment: Some(TAG.into()),
        };
        assert!(filter().matches(&record));
        let untagged = Record {
            comment: None,
            ..record.clone()
        };
        assert!(!filter().matches(&untagged));
        let caa = Record {
            r#type: "CAA".into(),
            ..record
        };
        assert!(!filter().matches(&caa));
    }
}
