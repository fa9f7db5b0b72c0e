//! Minimal JWS signing for the ACME endpoints `instant-acme` does not cover:
//! deactivating authorizations and accounts, and revoking a certificate with
//! its own key.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use ring::{
    rand::SystemRandom,
    signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

pub(crate) fn b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// An ES256 signer. Requests are identified by `kid` when an account URL is
/// known and by the embedded public key otherwise.
pub(crate) struct Signer {
    key: EcdsaKeyPair,
    key_id: Option<String>,
    rng: SystemRandom,
}

impl Signer {
    pub fn from_pkcs8(pkcs8: &[u8], key_id: Option<String>) -> Result<Self> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
            .map_err(|err| anyhow!("invalid P-256 key: {err}"))?;
        Ok(Self { key, key_id, rng })
    }

    fn jwk(&self) -> Value {
        // Uncompressed point: 0x04 || x || y
        let point = self.key.public_key().as_ref();
        let (x, y) = point[1..].split_at(32);
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": b64(x),
            "y": b64(y),
        })
    }

    pub fn sign(&self, url: &str, nonce: &str, payload: &Value) -> Result<Value> {
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match &self.key_id {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = self.jwk(),
        }
        let protected = b64(protected.to_string().as_bytes());
        let payload = b64(payload.to_string().as_bytes());
        let signature = self
            .key
            .sign(&self.rng, format!("{protected}.{payload}").as_bytes())
            .map_err(|_| anyhow!("failed to sign request"))?;
        Ok(json!({
            "protected": protected,
            "payload": payload,
            "signature": b64(signature.as_ref()),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Directory {
    new_nonce: String,
    revoke_cert: String,
}

/// Posts signed requests to one ACME server.
pub(crate) struct JwsClient {
    client: Client,
    directory: Directory,
}

impl JwsClient {
    pub async fn discover(directory_url: &str) -> Result<Self> {
        let client = Client::new();
        let directory = client
            .get(directory_url)
            .send()
            .await
            .context("failed to fetch acme directory")?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse acme directory")?;
        Ok(Self { client, directory })
    }

    pub fn revoke_cert_url(&self) -> &str {
        &self.directory.revoke_cert
    }

    async fn nonce(&self) -> Result<String> {
        let response = self
            .client
            .head(&self.directory.new_nonce)
            .send()
            .await
            .context("failed to fetch nonce")?;
        let nonce = response
            .headers()
            .get("replay-nonce")
            .context("no replay-nonce in response")?
            .to_str()
            .context("invalid replay-nonce")?;
        Ok(nonce.to_string())
    }

    /// Signs and posts `payload` to `url`, retrying once on a stale nonce.
    pub async fn post(&self, signer: &Signer, url: &str, payload: &Value) -> Result<()> {
        let mut retried = false;
        loop {
            let body = signer.sign(url, &self.nonce().await?, payload)?;
            let response = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .body(body.to_string())
                .send()
                .await
                .with_context(|| format!("failed to post to {url}"))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let text = response.text().await?;
            if status == StatusCode::BAD_REQUEST && text.contains("badNonce") && !retried {
                debug!("bad nonce for {url}, retrying");
                retried = true;
                continue;
            }
            bail!("{url} returned {status}: {text}");
        }
    }
}
