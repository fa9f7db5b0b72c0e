//! Monthly TLS certificate issuance over ACME with DNS-01 validation.
//!
//! Every run registers a fresh ACME account, proves control of the configured
//! domains by publishing `_acme-challenge` TXT records through the DNS
//! provider's API, downloads the issued certificate and then releases
//! everything it created: the challenge records, the authorizations, the
//! account and finally the certificate itself.
//!
//! # Features
//!
//! - DNS-01 challenge support (currently implemented for Cloudflare)
//! - Tagged challenge records, so records left over by a crashed run are
//!   removed by the next one
//! - External Account Binding for CAs that require it
//! - A run deadline covering every network call, cleanup included
//!
//! # Usage
//!
//! ```no_run
//! use certrenew::CertBotConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bot = CertBotConfig::builder()
//!         .acme_url("https://acme-staging-v02.api.letsencrypt.org/directory")
//!         .contact("admin@example.com")
//!         .cf_zone_id("your_cloudflare_zone_id")
//!         .cf_api_token("your_cloudflare_api_token")
//!         .domains(vec!["example.com".to_string()])
//!         .cert_file("/etc/certrenew/cert.pem")
//!         .key_file("/etc/certrenew/key.pem")
//!         .build()
//!         .build_bot()?;
//!
//!     let issued = bot.run_once().await?;
//!     println!("New certificate obtained: {}", issued.certificate_url);
//!     Ok(())
//! }
//! ```

pub use acme_client::ExternalAccountBinding;
pub use bot::{next_run_after, CertBot, CertBotConfig};
pub use dns01_client::Dns01Client;
pub use issuer::IssuedCertificate;

mod acme_client;
mod bot;
mod challenge_records;
mod dns01_client;
mod issuer;

#[cfg(test)]
mod testing;
