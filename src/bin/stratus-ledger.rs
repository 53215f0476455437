//! Prints the resources recorded in a stratus ledger directory.
//!
//! Secrets (the generated private key and password) are masked unless
//! `--show-secrets` is passed.

use std::io::Write as _;

use camino::Utf8PathBuf;
use clap::Parser;
use stratus::{FileLedgerStore, Ledger, LedgerKey};

const MASK: &str = "<redacted>";

#[derive(Debug, Parser)]
#[command(
    name = "stratus-ledger",
    about = "Show the resources a stratus ledger will release on teardown"
)]
struct Cli {
    /// Instance working directory holding the ledger files.
    #[arg(long, env = "STRATUS_LEDGER_DIR")]
    dir: Utf8PathBuf,
    /// Print the generated private key and password.
    #[arg(long)]
    show_secrets: bool,
}

const fn is_secret(key: LedgerKey) -> bool {
    matches!(key, LedgerKey::SshKeyFile | LedgerKey::VmCredentials)
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let ledger = Ledger::new(FileLedgerStore::open(&cli.dir).map_err(|err| err.to_string())?);
    let mut stdout = std::io::stdout().lock();
    for key in LedgerKey::ALL {
        let entries = ledger.entries(key).map_err(|err| err.to_string())?;
        if entries.is_empty() {
            continue;
        }
        writeln!(stdout, "{}:", key.as_str()).map_err(|err| err.to_string())?;
        if is_secret(key) && !cli.show_secrets {
            writeln!(stdout, "  {MASK}").map_err(|err| err.to_string())?;
            continue;
        }
        for entry in entries {
            writeln!(stdout, "  {entry}").map_err(|err| err.to_string())?;
        }
    }
    Ok(())
}
