//! Export Key Tool
//!
//! Generates the Ed25519 keypair that signs ledger exports.

use clap::Parser;
use std::path::PathBuf;

use consent_ledger::crypto::generate_keypair_files;
use consent_ledger::crypto::key_management::{PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};

#[derive(Parser)]
#[command(name = "ledger-keys")]
#[command(about = "Generate the export signing keypair")]
#[command(version)]
struct Cli {
    /// Directory the keypair is written to
    #[arg(short, long, default_value = "keys")]
    dir: PathBuf,

    /// Move the current public key here before overwriting it, so exports
    /// signed with it stay verifiable
    #[arg(short, long)]
    retire_into: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let manager = generate_keypair_files(&cli.dir, cli.retire_into.as_deref())?;

    println!("Private key: {}", cli.dir.join(PRIVATE_KEY_FILE).display());
    println!("Public key:  {}", cli.dir.join(PUBLIC_KEY_FILE).display());
    println!("Public key (base64): {}", manager.public_key_base64());
    Ok(())
}
