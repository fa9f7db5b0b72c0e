use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use certrenew::{CertBotConfig, ExternalAccountBinding};
use clap::Parser;
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use toml_edit::ser::to_document;
use tracing::info;

#[derive(Parser)]
enum Command {
    /// Issue a certificate now, then on the first day of every month
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "certrenew.toml")]
        config: PathBuf,
        /// Run only once and exit
        #[arg(long)]
        once: bool,
    },
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Domains to put in the certificate
    domains: Vec<String>,
    /// ACME directory URL
    acme_url: String,
    /// Account contact email
    contact: String,
    /// External Account Binding key ID
    #[serde(default)]
    eab_key_id: String,
    /// External Account Binding HMAC key, base64url encoded
    #[serde(default)]
    eab_hmac_key: String,
    /// Cloudflare zone ID
    cf_zone_id: String,
    /// Cloudflare API token
    cf_api_token: String,
    /// Executable to run after the certificate is written
    #[serde(default)]
    after_setup_script: String,
    /// Path to write the certificate chain to
    cert_file: PathBuf,
    /// Path to write the private key to
    key_file: PathBuf,
    /// Timeout of a whole run in seconds
    #[serde(default = "default_run_timeout")]
    run_timeout: u64,
    /// Time given to the after setup script to succeed, in seconds
    #[serde(default = "default_hook_timeout")]
    hook_timeout: u64,
    /// Poll public DNS for the challenge record instead of sleeping 30 seconds
    #[serde(default = "default_dns_check")]
    dns_check: bool,
}

fn default_run_timeout() -> u64 {
    600
}

fn default_hook_timeout() -> u64 {
    30
}

fn default_dns_check() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: vec!["example.com".into()],
            acme_url: "https://acme-staging-v02.api.letsencrypt.org/directory".into(),
            contact: "admin@example.com".into(),
            eab_key_id: "".into(),
            eab_hmac_key: "".into(),
            cf_zone_id: "".into(),
            cf_api_token: "".into(),
            after_setup_script: "".into(),
            cert_file: "cert.pem".into(),
            key_file: "key.pem".into(),
            run_timeout: default_run_timeout(),
            hook_timeout: default_hook_timeout(),
            dns_check: default_dns_check(),
        }
    }
}

impl Config {
    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = to_document(self)?;

        for (i, (mut key, _value)) in doc.iter_mut().enumerate() {
            let decor = key.leaf_decor_mut();
            let docstring = Self::FIELD_DOCS[i];

            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            decor.set_prefix(comment);
        }
        Ok(doc.to_string())
    }

    fn eab(&self) -> Result<Option<ExternalAccountBinding>> {
        match (self.eab_key_id.is_empty(), self.eab_hmac_key.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => Ok(Some(ExternalAccountBinding {
                key_id: self.eab_key_id.clone(),
                hmac_key: self.eab_hmac_key.clone(),
            })),
            (false, true) => bail!("eab_key_id is set but eab_hmac_key is missing"),
            (true, false) => bail!("eab_hmac_key is set but eab_key_id is missing"),
        }
    }
}

fn parse_config(toml: &str) -> Result<CertBotConfig> {
    let config: Config = toml_edit::de::from_str(toml)?;
    let eab = config.eab()?;
    let after_setup_script =
        (!config.after_setup_script.is_empty()).then(|| PathBuf::from(&config.after_setup_script));
    let bot_config = CertBotConfig::builder()
        .acme_url(config.acme_url)
        .contact(config.contact)
        .maybe_eab(eab)
        .cf_zone_id(config.cf_zone_id)
        .cf_api_token(config.cf_api_token)
        .domains(config.domains)
        .cert_file(config.cert_file)
        .key_file(config.key_file)
        .run_timeout(Duration::from_secs(config.run_timeout))
        .hook_timeout(Duration::from_secs(config.hook_timeout))
        .dns_check(config.dns_check)
        .maybe_after_setup_script(after_setup_script)
        .build();
    Ok(bot_config)
}

fn load_config(config: &Path) -> Result<CertBotConfig> {
    parse_config(&fs::read_to_string(config)?)
}

async fn run(config: &Path, once: bool) -> Result<()> {
    let bot_config = load_config(config).context("Failed to load configuration")?;
    let bot = bot_config.build_bot().context("Failed to build bot")?;
    if once {
        let issued = bot.run_once().await?;
        info!("certificate URL: {}", issued.certificate_url);
    } else {
        bot.run().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let args = Args::parse();
    match args.command {
        Command::Run { config, once } => {
            run(&config, once).await?;
        }
        Command::Cfg { write_to } => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{}", toml_str),
            }
        }
    }
    Ok(())
}
