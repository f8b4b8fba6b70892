//! PKI File Transfer CLI - Main Entry Point
//!
//! Thin front-end over the library: parses arguments, loads configuration,
//! installs logging and renders transfer progress.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                         Commands                                    ││
//! │  │  ┌──────┐  ┌──────────┐  ┌────────┐  ┌────────┐  ┌──────────┐      ││
//! │  │  │  ca  │  │ validate │  │ server │  │ upload │  │ download │      ││
//! │  │  └──────┘  └──────────┘  └────────┘  └────────┘  └──────────┘      ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    PKI Layer (openssl, rcgen)                       ││
//! │  │  - Root CA keystore            - Leaf issuance, CRLs                ││
//! │  │  - Certification paths         - Chain validation                   ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    TLS Layer (rustls)                               ││
//! │  │  - Client certificate auth     - Trust decision fallback            ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                    │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Network Layer (tokio)                            ││
//! │  │  - Async TCP streams           - Task per connection / transfer     ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use pki_file_transfer::ca::CertificateAuthority;
use pki_file_transfer::certpath::PathEncoding;
use pki_file_transfer::client::{
    Client, ClientConfig, TransferEvent, TransferObserver, TransferOutcome,
};
use pki_file_transfer::config::AppConfig;
use pki_file_transfer::protocol::{transfer_url, Action};
use pki_file_transfer::provision::{provision_client, provision_server, ProvisionedIdentity};
use pki_file_transfer::server::{Server, ServerConfig};
use pki_file_transfer::tls::{ClientTlsConfig, PeerIdentity, ServerTlsConfig, TrustDecision};
use pki_file_transfer::validator::ChainValidator;

/// PKI File Transfer CLI
///
/// Runs a private certificate authority and transfers files over mutual TLS
/// using the identities it issues.
#[derive(Parser)]
#[command(name = "pft")]
#[command(version = "0.1.0")]
#[command(about = "Mutual-TLS file transfer backed by a private CA", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate authority commands
    Ca {
        /// Directory holding the CA keystore
        #[arg(long, default_value = "certs/ca")]
        ca_dir: PathBuf,

        #[command(subcommand)]
        action: CaCommands,
    },

    /// Validate an exported certification path
    Validate {
        /// Encoded path file
        path: PathBuf,

        /// Path encoding: pkcs7, pkipath or pem
        #[arg(short, long, default_value = "pkcs7")]
        encoding: PathEncoding,

        /// Trust anchor files (PEM bundles or DER)
        #[arg(short, long, required = true)]
        trust: Vec<PathBuf>,

        /// Revocation lists; none disables revocation checking
        #[arg(long)]
        crl: Vec<PathBuf>,
    },

    /// Start the file server
    Server,

    /// Check that the server accepts a TLS connection
    Probe,

    /// Upload a file to the server
    Upload {
        /// Local file to upload
        file: PathBuf,

        /// Remote filename (defaults to local filename)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Download a file from the server
    Download {
        /// Remote filename to download
        remote: String,

        /// Directory to save into
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },
}

#[derive(Subcommand)]
enum CaCommands {
    /// Create the root CA, or load it when it already exists
    Init,

    /// Issue a server identity
    ProvisionServer {
        /// Host name the certificate is issued for
        host: String,

        /// Output directory
        #[arg(short, long, default_value = "certs/server")]
        out: PathBuf,
    },

    /// Issue a client identity
    ProvisionClient {
        /// Host name the certificate is issued for
        host: String,

        /// Output directory
        #[arg(short, long, default_value = "certs/client")]
        out: PathBuf,
    },

    /// Issue a revocation list
    Crl {
        /// Serial numbers to revoke
        #[arg(short, long)]
        revoke: Vec<u64>,

        /// Output file
        #[arg(short, long, default_value = "certs/ca/ca.crl")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Ca { ca_dir, action } => handle_ca_command(&config, &ca_dir, action),
        Commands::Validate {
            path,
            encoding,
            trust,
            crl,
        } => run_validate(&path, encoding, &trust, &crl),
        Commands::Server => run_server(&config).await,
        Commands::Probe => run_probe(&config).await,
        Commands::Upload { file, name } => {
            let remote_name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "uploaded_file".to_string())
            });
            run_upload(&config, &file, &remote_name).await
        }
        Commands::Download { remote, dest } => run_download(&config, &remote, &dest).await,
    }
}

fn handle_ca_command(config: &AppConfig, ca_dir: &Path, action: CaCommands) -> Result<()> {
    let ca = CertificateAuthority::open(config.ca.clone(), &config.ca.keystore_password, ca_dir)
        .with_context(|| format!("Failed to open CA in {:?}", ca_dir))?;

    match action {
        CaCommands::Init => {
            info!("✅ Root CA ready: {}", ca.root_subject());
            info!("   Keystore: {:?}", ca.keystore_path());
            Ok(())
        }
        CaCommands::ProvisionServer { host, out } => {
            info!("🔐 Provisioning server identity for {}...", host);
            let identity = provision_server(&ca, &host, &out)?;
            print_identity(&identity);
            Ok(())
        }
        CaCommands::ProvisionClient { host, out } => {
            info!("🔐 Provisioning client identity for {}...", host);
            let identity = provision_client(&ca, &host, &out, ca_dir)?;
            print_identity(&identity);
            Ok(())
        }
        CaCommands::Crl { revoke, out } => {
            let crl = ca.issue_crl(&revoke)?;
            CertificateAuthority::export_crl(&crl, &out)?;
            info!("✅ Revocation list with {} serial(s) written to {:?}", revoke.len(), out);
            Ok(())
        }
    }
}

fn print_identity(identity: &ProvisionedIdentity) {
    info!("✅ Identity provisioned for {}", identity.host_name);
    info!("   Keystore:    {:?}", identity.keystore);
    info!("   Certificate: {:?}", identity.certificate);
    info!("   Root:        {:?}", identity.root_certificate);
    info!("   Path:        {:?}", identity.path);
    if let Some(ca_keystore) = &identity.ca_keystore {
        info!("   CA store:    {:?}", ca_keystore);
    }
}

fn run_validate(
    path: &Path,
    encoding: PathEncoding,
    trust: &[PathBuf],
    crls: &[PathBuf],
) -> Result<()> {
    let validator = ChainValidator::from_files(trust, crls)?;
    if !validator.revocation_enabled() {
        info!("No revocation lists given, revocation checking disabled");
    }

    let key = validator.validate_file(path, encoding)?;
    info!("✅ Path {:?} is valid ({} encoding)", path, encoding);
    info!("   Public key: {} bits", key.bits());
    Ok(())
}

async fn run_server(config: &AppConfig) -> Result<()> {
    info!("🚀 Starting file server...");

    let tls_config = ServerTlsConfig::from_settings(&config.server, &config.ca.identity_password)?;
    let server = Server::new(ServerConfig::from_settings(&config.server, tls_config));
    server.run().await
}

fn create_client(config: &AppConfig) -> Result<Client> {
    let url = Url::parse(&config.client.server_url)
        .with_context(|| format!("Invalid server url: {}", config.client.server_url))?;
    let host = url
        .host_str()
        .with_context(|| format!("Server url has no host: {}", url))?;

    let tls_config = ClientTlsConfig::from_settings(
        &config.client,
        &config.ca.identity_password,
        host,
        Arc::new(ConsolePrompt::stdin()),
    )?;

    Ok(Client::new(ClientConfig::from_settings(
        &config.client,
        tls_config,
    )))
}

async fn run_probe(config: &AppConfig) -> Result<()> {
    let client = create_client(config)?;
    let url = transfer_url(&config.client.server_url, Action::Download, "probe");
    client.probe(&url).await?;
    info!("✅ Server at {} is reachable", config.client.server_url);
    Ok(())
}

async fn run_upload(config: &AppConfig, file: &Path, remote_name: &str) -> Result<()> {
    let client = create_client(config)?;
    let url = transfer_url(&config.client.server_url, Action::Upload, remote_name);

    info!("📤 Uploading {:?} as {}", file, remote_name);
    let outcome = client
        .upload(&url, file, ProgressObserver::new())
        .wait()
        .await;
    report(outcome)
}

async fn run_download(config: &AppConfig, remote: &str, dest: &Path) -> Result<()> {
    let client = create_client(config)?;
    let url = transfer_url(&config.client.server_url, Action::Download, remote);

    info!("📥 Downloading {} into {:?}", remote, dest);
    let outcome = client
        .download(&url, dest, ProgressObserver::new())
        .wait()
        .await;
    report(outcome)
}

fn report(outcome: TransferOutcome) -> Result<()> {
    match outcome {
        TransferOutcome::Completed { bytes, path } => {
            info!("✅ {} bytes transferred ({:?})", bytes, path);
            Ok(())
        }
        other => anyhow::bail!("{}", other),
    }
}

/// Asks on the terminal whether to trust a certificate that failed verification.
struct ConsolePrompt {
    input: Box<dyn Fn() -> Box<dyn BufRead> + Send + Sync>,
}

impl ConsolePrompt {
    fn stdin() -> Self {
        Self {
            input: Box::new(|| Box::new(io::stdin().lock()) as Box<dyn BufRead>),
        }
    }
}

impl TrustDecision for ConsolePrompt {
    fn accept(&self, peer: &PeerIdentity) -> bool {
        warn!("⚠️  Server certificate failed verification: {}", peer.reason);
        eprintln!("Subject:     {}", peer.subject);
        eprintln!("Fingerprint: {}", peer.fingerprint);
        eprint!("Trust this certificate? [y/N] ");
        let _ = io::stderr().flush();

        // Called from the handshake on a runtime worker; hand the worker off while waiting
        let answer = tokio::task::block_in_place(|| {
            let mut answer = String::new();
            (self.input)().read_line(&mut answer).map(|_| answer)
        });
        match answer {
            Ok(answer) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Renders transfer events as a progress bar.
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        Self {
            bar: create_progress_bar(0),
        }
    }
}

impl TransferObserver for ProgressObserver {
    fn on_event(&self, event: TransferEvent) {
        match event {
            TransferEvent::Started { total, .. } => self.bar.set_length(total),
            TransferEvent::Progress { transferred, .. } => self.bar.set_position(transferred),
            TransferEvent::Finished(outcome) if outcome.is_success() => {
                self.bar.finish_with_message("done")
            }
            TransferEvent::Finished(_) => self.bar.abandon(),
        }
    }
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}
