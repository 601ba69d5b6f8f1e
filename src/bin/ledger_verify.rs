//! Ledger Verification Tool
//!
//! Offline checks for signed exports and for a tenant's hash chain.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;

use consent_ledger::audit::AuditLedger;
use consent_ledger::crypto::key_management::load_public_key;
use consent_ledger::crypto::PublicKeyRing;
use consent_ledger::database::Database;

#[derive(Parser)]
#[command(name = "ledger-verify")]
#[command(about = "Verify signed ledger exports and tenant hash chains")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an export against its detached signature
    Signature {
        /// Exported data file
        data: PathBuf,

        /// Signature file (base64)
        signature: PathBuf,

        /// Public key file (base64)
        #[arg(default_value = "keys/audit_public.key")]
        public_key: PathBuf,

        /// Directory of retired public keys to try as well
        #[arg(long)]
        retired_dir: Option<PathBuf>,
    },

    /// Replay tenant chains from the database
    Chain {
        /// Tenant identifier; every tenant when omitted
        #[arg(short, long)]
        tenant: Option<String>,

        /// Database URL
        #[arg(long, default_value = "sqlite://consent-ledger.db")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let ok = match cli.command {
        Commands::Signature {
            data,
            signature,
            public_key,
            retired_dir,
        } => verify_signature_files(&data, &signature, &public_key, retired_dir.as_deref())?,
        Commands::Chain { tenant, database_url } => verify_chains(tenant.as_deref(), &database_url).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn verify_signature_files(
    data_path: &Path,
    signature_path: &Path,
    public_key_path: &Path,
    retired_dir: Option<&Path>,
) -> Result<bool> {
    let data = fs::read(data_path).with_context(|| format!("Failed to read {}", data_path.display()))?;
    let signature = fs::read_to_string(signature_path)
        .with_context(|| format!("Failed to read {}", signature_path.display()))?;

    let ring = match retired_dir {
        Some(dir) => PublicKeyRing::load(public_key_path, Some(dir))?,
        None => PublicKeyRing::new(load_public_key(public_key_path)?),
    };

    match ring.verify(&data, &signature)? {
        Some(label) => {
            println!("✓ Signature valid (key: {})", label);
            Ok(true)
        }
        None => {
            error!("Signature does not match any of {} trusted keys", ring.len());
            println!("✗ Signature invalid");
            Ok(false)
        }
    }
}

async fn verify_chains(tenant: Option<&str>, database_url: &str) -> Result<bool> {
    let database = Database::new(database_url).await?;
    let ledger = AuditLedger::new(database);

    let tenants = match tenant {
        Some(tenant) => vec![tenant.to_string()],
        None => ledger.tenants().await?,
    };
    if tenants.is_empty() {
        return Err(anyhow!("Ledger has no entries"));
    }

    let mut all_ok = true;
    for tenant in &tenants {
        all_ok &= verify_tenant_chain(&ledger, tenant).await?;
    }
    Ok(all_ok)
}

async fn verify_tenant_chain(ledger: &AuditLedger, tenant: &str) -> Result<bool> {
    let report = ledger.verify_tenant(tenant).await?;

    if report.entry_count == 0 {
        return Err(anyhow!("Tenant {} has no ledger entries", tenant));
    }

    if report.valid {
        println!("✓ {}: chain intact, {} entries", tenant, report.entry_count);
        println!("  Head hash: {}", report.head_hash);
        Ok(true)
    } else {
        println!(
            "✗ {}: chain broken at entry {} ({})",
            tenant,
            report.broken_at.unwrap_or_default(),
            report.broken_entry_id.unwrap_or_default()
        );
        if let Some(reason) = report.error {
            println!("  {}", reason);
        }
        Ok(false)
    }
}
