//! cloudio: CloudIO identity and encryption CLI
//!
//! Identity commands:
//!   init                         - select the first password, creating the identity
//!   passwd                       - rotate to a new password (old key stays recoverable)
//!   history                      - list fingerprints of every key generation
//!   backup [-t N] [-n M]         - split the current key into M hex shares
//!   recover --share <hex> ...    - rebuild the key from shares and set a new password
//!
//! File commands:
//!   seal <file>                  - encrypt a file under the sync root into staging
//!   open <staged> <metadata>     - decrypt a staged file back under the sync root
//!   clean                        - remove staged ciphertexts
//!   config show                  - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudio_core::config::CloudioConfig;
use cloudio_crypto::{
    EntityCrypto, FileMetadata, KdfParams, KeyDerivation, Nonce, RetryPolicy, Share,
    SyncWorkspace,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cloudio",
    version,
    about = "CloudIO end-to-end encrypted sync client",
    long_about = "cloudio: manage the password-derived identity, key backups, and file encryption"
)]
struct Cli {
    /// Path to cloudio.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CLOUDIO_CONFIG",
        default_value = "~/.config/cloudio/cloudio.toml"
    )]
    config: PathBuf,

    /// Account name (overrides identity.username)
    #[arg(long, short = 'u', env = "CLOUDIO_USER")]
    user: Option<String>,

    /// Log format (overrides client.log_format)
    #[arg(long, value_enum, env = "CLOUDIO_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the identity by selecting its first password
    Init,

    /// Replace the current password
    Passwd,

    /// Show the fingerprint of every key generation, newest first
    History,

    /// Split the current key into shares for offline backup
    ///
    /// Any `threshold + 1` of the printed shares recover the key.
    Backup {
        /// Polynomial degree (default: backup.threshold)
        #[arg(long, short = 't')]
        threshold: Option<u8>,
        /// Number of shares to produce (default: backup.shares)
        #[arg(long, short = 'n')]
        shares: Option<u8>,
    },

    /// Recover the key from shares and set a new password
    Recover {
        /// Hex-encoded share (repeat for each share)
        #[arg(long = "share", short = 's', required_unless_present = "shares_file")]
        share: Vec<String>,
        /// File with one hex share per line
        #[arg(long)]
        shares_file: Option<PathBuf>,
    },

    /// Encrypt a file under the sync root into the staging directory
    Seal {
        /// File to encrypt (must live under workspace.root)
        file: PathBuf,
        /// Name nonce of the previous revision, to keep the encrypted name stable
        #[arg(long)]
        name_nonce: Option<String>,
    },

    /// Decrypt a staged file back under the sync root
    Open {
        /// Staged ciphertext (`<hex>.cio`)
        staged: PathBuf,
        /// Metadata JSON written by `seal` (default: `<staged>.json`)
        metadata: Option<PathBuf>,
    },

    /// Remove staged ciphertexts
    Clean,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = CloudioConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let format = cli.log_format.unwrap_or(match config.client.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&config.client.log_level, format);
    tracing::debug!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Init => cmd_init(&config, cli.user.as_deref()),
        Commands::Passwd => cmd_passwd(&config, cli.user.as_deref()),
        Commands::History => cmd_history(&config, cli.user.as_deref()),
        Commands::Backup { threshold, shares } => cmd_backup(
            &config,
            cli.user.as_deref(),
            threshold.unwrap_or(config.backup.threshold),
            shares.unwrap_or(config.backup.shares),
        ),
        Commands::Recover { share, shares_file } => {
            cmd_recover(&config, cli.user.as_deref(), share, shares_file.as_deref())
        }
        Commands::Seal { file, name_nonce } => {
            cmd_seal(&config, cli.user.as_deref(), &file, name_nonce.as_deref())
        }
        Commands::Open { staged, metadata } => {
            cmd_open(&config, cli.user.as_deref(), &staged, metadata.as_deref())
        }
        Commands::Clean => cmd_clean(&config),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

fn open_identity(config: &CloudioConfig, user: Option<&str>) -> Result<KeyDerivation> {
    let username = user.unwrap_or(&config.identity.username);
    if username.is_empty() {
        anyhow::bail!("no username; pass --user or set identity.username in config");
    }
    let params = KdfParams {
        mem_cost_kib: config.crypto.argon2_mem_cost_kib,
        time_cost: config.crypto.argon2_time_cost,
        parallelism: config.crypto.argon2_parallelism,
    };
    let state_dir = expand_tilde(&config.identity.state_dir);
    let identity = KeyDerivation::new(username, &state_dir)
        .with_context(|| format!("opening identity {username:?}"))?
        .with_params(params)
        .with_min_password_len(config.crypto.min_password_len);
    Ok(identity)
}

fn open_workspace(config: &CloudioConfig) -> SyncWorkspace {
    SyncWorkspace::new(
        expand_tilde(&config.workspace.root),
        expand_tilde(&config.workspace.staging_dir),
    )
    .with_cleanup_policy(RetryPolicy {
        attempts: config.workspace.cleanup_attempts,
        initial_backoff: Duration::from_millis(config.workspace.cleanup_backoff_ms),
    })
}

/// Password from `CLOUDIO_PASSWORD` when set (non-interactive use), otherwise
/// prompted on the terminal.
fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var("CLOUDIO_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(pw))
}

fn read_new_password() -> Result<SecretString> {
    if let Ok(pw) = std::env::var("CLOUDIO_NEW_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let first = rpassword::prompt_password("New password: ").context("reading password")?;
    let second = rpassword::prompt_password("Confirm new password: ").context("reading password")?;
    if first != second {
        anyhow::bail!("passwords do not match");
    }
    Ok(SecretString::from(first))
}

fn unlock(identity: &KeyDerivation) -> Result<EntityCrypto> {
    let password = read_password("Password: ")?;
    let key = identity
        .derive_key(&password, true)
        .context("unlocking identity")?;
    Ok(EntityCrypto::new(key))
}

fn metadata_path(staged: &Path) -> PathBuf {
    let mut name = staged.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

// ── `cloudio config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &CloudioConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = config
        .to_toml_string()
        .context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Identity commands ─────────────────────────────────────────────────────────

fn cmd_init(config: &CloudioConfig, user: Option<&str>) -> Result<()> {
    let identity = open_identity(config, user)?;
    let password = read_new_password()?;
    let entity = identity
        .select_first_pw(&password)
        .context("selecting first password")?;
    println!(
        "identity created for {} (key {})",
        identity.username(),
        entity.fingerprint().short_hex()
    );
    Ok(())
}

fn cmd_passwd(config: &CloudioConfig, user: Option<&str>) -> Result<()> {
    let identity = open_identity(config, user)?;
    let old = read_password("Current password: ")?;
    let new = read_new_password()?;
    let entity = identity
        .replace_pw(&old, &new)
        .context("replacing password")?;
    println!(
        "password replaced; {} key generations (current key {})",
        identity.generations()?,
        entity.fingerprint().short_hex()
    );
    Ok(())
}

fn cmd_history(config: &CloudioConfig, user: Option<&str>) -> Result<()> {
    let identity = open_identity(config, user)?;
    let password = read_password("Password: ")?;
    let current = identity
        .derive_key(&password, true)
        .context("unlocking identity")?;
    let keys = identity
        .retrieve_keys(&current)
        .context("walking key history")?;

    let total = keys.len();
    for (i, key) in keys.into_iter().enumerate() {
        let label = if i == 0 { " (current)" } else { "" };
        println!(
            "generation {:>3}  {}{label}",
            total - i,
            EntityCrypto::new(key).fingerprint().short_hex()
        );
    }
    Ok(())
}

fn cmd_backup(config: &CloudioConfig, user: Option<&str>, threshold: u8, shares: u8) -> Result<()> {
    let identity = open_identity(config, user)?;
    let password = read_password("Password: ")?;
    let split = identity
        .backup_key(&password, threshold, shares)
        .context("backing up key")?;

    eprintln!(
        "# {} shares; any {} of them recover the key. Store them apart.",
        split.len(),
        u16::from(threshold) + 1
    );
    for share in &split {
        println!("{}", share.to_hex());
    }
    Ok(())
}

fn cmd_recover(
    config: &CloudioConfig,
    user: Option<&str>,
    mut hex_shares: Vec<String>,
    shares_file: Option<&Path>,
) -> Result<()> {
    if let Some(path) = shares_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading shares: {}", path.display()))?;
        hex_shares.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    let shares = hex_shares
        .iter()
        .enumerate()
        .map(|(i, s)| Share::from_hex(s).with_context(|| format!("decoding share #{}", i + 1)))
        .collect::<Result<Vec<_>>>()?;

    let identity = open_identity(config, user)?;
    let new = read_new_password()?;
    let entity = identity
        .recover_from_shares(&shares, &new)
        .context("recovering from shares")?;
    println!(
        "identity recovered; new password set (key {})",
        entity.fingerprint().short_hex()
    );
    Ok(())
}

// ── File commands ─────────────────────────────────────────────────────────────

fn cmd_seal(
    config: &CloudioConfig,
    user: Option<&str>,
    file: &Path,
    name_nonce: Option<&str>,
) -> Result<()> {
    let workspace = open_workspace(config);
    let file = std::path::absolute(file)
        .with_context(|| format!("resolving {}", file.display()))?;
    let name_nonce = match name_nonce {
        Some(hex) => Nonce::from_hex(hex).context("parsing --name-nonce")?,
        None => Nonce::random(),
    };

    let entity = unlock(&open_identity(config, user)?)?;
    let (staged, metadata) = entity
        .encrypt_file(&workspace, &file, &name_nonce, &Nonce::random())
        .with_context(|| format!("encrypting {}", file.display()))?;

    let meta_path = metadata_path(&staged);
    let json = serde_json::to_vec_pretty(&metadata).context("serializing metadata")?;
    std::fs::write(&meta_path, json)
        .with_context(|| format!("writing metadata: {}", meta_path.display()))?;

    println!("staged:     {}", staged.display());
    println!("metadata:   {}", meta_path.display());
    println!("name nonce: {}", metadata.name_nonce.to_hex());
    Ok(())
}

fn cmd_open(
    config: &CloudioConfig,
    user: Option<&str>,
    staged: &Path,
    metadata: Option<&Path>,
) -> Result<()> {
    let workspace = open_workspace(config);
    let meta_path = metadata
        .map(Path::to_path_buf)
        .unwrap_or_else(|| metadata_path(staged));
    let raw = std::fs::read(&meta_path)
        .with_context(|| format!("reading metadata: {}", meta_path.display()))?;
    let metadata = FileMetadata::from_json(&raw)
        .with_context(|| format!("parsing metadata: {}", meta_path.display()))?;

    let entity = unlock(&open_identity(config, user)?)?;
    let target = entity
        .decrypt_file(&workspace, staged, &metadata)
        .with_context(|| format!("decrypting {}", staged.display()))?;
    println!("restored: {}", target.display());
    Ok(())
}

fn cmd_clean(config: &CloudioConfig) -> Result<()> {
    let workspace = open_workspace(config);
    let removed = workspace
        .clear_staging()
        .context("clearing staging directory")?;
    println!("removed {removed} staged file(s) from {}", workspace.staging().display());
    Ok(())
}
