use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDateTime, TimeZone};
use fs_err as fs;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{error, info, warn};

use crate::{
    acme_client::{AcmeApi, AcmeSession, ExternalAccountBinding},
    challenge_records::{ChallengeRecords, Propagation, TxtResolver},
    dns01_client::{Dns01Api, Dns01Client},
    issuer::{IssuedCertificate, Issuer},
};

/// Longest single sleep between two wall clock readings.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(3600);
const HOOK_ATTEMPTS: u32 = 5;

#[allow(clippy::duplicated_attributes)]
#[derive(Clone, Debug, bon::Builder)]
#[builder(on(String, into))]
#[builder(on(PathBuf, into))]
pub struct CertBotConfig {
    acme_url: String,
    contact: String,
    eab: Option<ExternalAccountBinding>,
    cf_zone_id: String,
    cf_api_token: String,
    domains: Vec<String>,
    cert_file: PathBuf,
    key_file: PathBuf,
    #[builder(default = Duration::from_secs(600))]
    run_timeout: Duration,
    #[builder(default = Duration::from_secs(30))]
    hook_timeout: Duration,
    /// Poll the resolver for the challenge record instead of sleeping.
    #[builder(default = true)]
    dns_check: bool,
    /// Sleep used when `dns_check` is off.
    #[builder(default = Duration::from_secs(30))]
    propagation_delay: Duration,
    after_setup_script: Option<PathBuf>,
}

impl CertBotConfig {
    pub fn build_bot(&self) -> Result<CertBot> {
        CertBot::build(self.clone())
    }

    fn propagation(&self) -> Propagation {
        if self.dns_check {
            Propagation::Resolve
        } else {
            Propagation::Fixed(self.propagation_delay)
        }
    }
}

pub struct CertBot {
    config: CertBotConfig,
}

impl CertBot {
    /// Build a new `CertBot` from a `CertBotConfig`.
    ///
    /// Fails on configuration errors, before any network activity.
    pub fn build(mut config: CertBotConfig) -> Result<Self> {
        if config.domains.is_empty() {
            bail!("no domains configured");
        }
        if let Some(domain) = config.domains.iter().find(|d| d.trim().is_empty()) {
            bail!("invalid domain: {domain:?}");
        }
        if let Some(eab) = &config.eab {
            if eab.key_id.is_empty() {
                bail!("EAB key id is empty");
            }
            eab.decode_hmac_key()?;
        }
        config.contact = normalize_contact(&config.contact);
        Ok(Self { config })
    }

    /// Run once now, then on the first day of every month.
    ///
    /// Only returns on a fatal error.
    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_once().await?;
            let next = next_run_after(Local::now().naive_local())?;
            info!("next run at {next}");
            sleep_until_local(next).await;
        }
    }

    /// Issue a certificate, store it and run the hook.
    pub async fn run_once(&self) -> Result<IssuedCertificate> {
        let deadline = Instant::now() + self.config.run_timeout;
        let dns01_client = Dns01Client::new_cloudflare(
            self.config.cf_zone_id.clone(),
            self.config.cf_api_token.clone(),
        );
        let records = timeout_at(
            deadline,
            ChallengeRecords::connect(dns01_client, self.config.propagation()),
        )
        .await
        .context("dns provider verification timed out")??;
        let registered = timeout_at(
            deadline,
            AcmeSession::register(
                &self.config.acme_url,
                &self.config.contact,
                self.config.eab.as_ref(),
            ),
        )
        .await
        .context("account registration timed out")
        .and_then(|result| result);
        let acme = match registered {
            Ok(acme) => acme,
            Err(err) => {
                error!("account registration failed: {err:?}");
                match timeout_at(deadline, records.delete_challenge_records()).await {
                    Ok(warnings) => {
                        for warning in &warnings {
                            warn!("cleanup after failed registration: {warning:#}");
                        }
                    }
                    Err(_) => error!("challenge record cleanup timed out"),
                }
                return Err(err);
            }
        };
        self.issue_and_install(&acme, &records, deadline).await
    }

    async fn issue_and_install<A: AcmeApi, C: Dns01Api, R: TxtResolver>(
        &self,
        acme: &A,
        records: &ChallengeRecords<C, R>,
        deadline: Instant,
    ) -> Result<IssuedCertificate> {
        let issued = Issuer::new(acme, records)
            .run_order(deadline, &self.config.domains)
            .await?;
        store_artifacts(&self.config.key_file, &self.config.cert_file, &issued)?;
        info!(
            "certificate written to {}",
            self.config.cert_file.display()
        );
        if issued.errors.is_empty() {
            info!("run completed");
        } else {
            warn!("run completed with {} error(s)", issued.errors.len());
            for err in &issued.errors {
                warn!("{err:#}");
            }
        }
        if let Some(script) = &self.config.after_setup_script {
            run_hook(script, self.config.hook_timeout).await;
        }
        Ok(issued)
    }
}

/// Turns a bare email address into a `mailto:` URI.
pub(crate) fn normalize_contact(contact: &str) -> String {
    let contact = contact.trim();
    if contact.contains(':') {
        contact.to_string()
    } else {
        format!("mailto:{contact}")
    }
}

/// The first day of the month following `now`, at midnight.
pub fn next_run_after(now: NaiveDateTime) -> Result<NaiveDateTime> {
    let (year, month) = match now.month() {
        12 => (now.year() + 1, 1),
        month => (now.year(), month + 1),
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .context("next run date is out of range")
}

async fn sleep_until_local(at: NaiveDateTime) {
    // A midnight skipped by a DST change falls back to the hour after.
    let target = Local
        .from_local_datetime(&at)
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(at + chrono::Duration::hours(1)))
                .earliest()
        });
    let Some(target) = target else {
        warn!("{at} does not exist in local time, running now");
        return;
    };
    loop {
        let remaining = (target - Local::now()).to_std().unwrap_or_default();
        if remaining.is_zero() {
            return;
        }
        sleep(remaining.min(MAX_SLEEP_CHUNK)).await;
    }
}

pub(crate) fn store_artifacts(
    key_file: &Path,
    cert_file: &Path,
    issued: &IssuedCertificate,
) -> Result<()> {
    write_file(key_file, &issued.key_pem, true).context("failed to write key file")?;
    write_file(cert_file, &issued.chain_pem, false).context("failed to write cert file")?;
    Ok(())
}

fn write_file(path: &Path, content: &str, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content)?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = private;
    Ok(())
}

/// Runs the post-issuance hook until it succeeds, at most `HOOK_ATTEMPTS`
/// times within `window`. Returns whether it succeeded.
pub(crate) async fn run_hook(script: &Path, window: Duration) -> bool {
    if !script.exists() {
        warn!("hook {} not found, skipping", script.display());
        return false;
    }
    let attempts = async {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=HOOK_ATTEMPTS {
            info!("running hook {} (attempt {attempt})", script.display());
            let status = tokio::process::Command::new(script)
                .kill_on_drop(true)
                .status()
                .await;
            match status {
                Ok(status) if status.success() => return true,
                Ok(status) => error!("hook failed with status: {status}"),
                Err(err) => error!("failed to run hook: {err:?}"),
            }
            if attempt < HOOK_ATTEMPTS {
                sleep(delay).await;
                delay *= 2;
            }
        }
        false
    };
    match timeout(window, attempts).await {
        Ok(succeeded) => succeeded,
        Err(_) => {
            error!("hook did not succeed within {window:?}");
            false
        }
    }
}
