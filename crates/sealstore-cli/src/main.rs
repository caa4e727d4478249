//! sealstore: manage a password-protected secret store from the shell.
//!
//! Secrets are read from stdin (`set`) and written to stdout (`get`) so
//! they stay off the command line and out of shell history.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sealstore::Store;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(
    name = "sealstore",
    version,
    about = "Password-protected on-disk secret store",
    long_about = "sealstore: store, retrieve, and rotate encrypted secrets in a directory tree"
)]
struct Cli {
    /// Store directory (created on first use)
    #[arg(long, short = 's', env = "SEALSTORE_DIR")]
    store: PathBuf,

    /// Store password; prompted for interactively when unset
    #[arg(long, env = "SEALSTORE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a secret read from stdin
    Set {
        /// Store-relative path, e.g. prod/db/password
        path: String,
    },

    /// Write a secret to stdout
    Get {
        path: String,
    },

    /// Remove a secret
    Rm {
        path: String,
    },

    /// List all secret paths
    Ls,

    /// Install a new encryption key and re-encrypt every secret
    Rotate {
        /// Return immediately instead of waiting for re-encryption to
        /// finish (an interrupted sweep resumes on the next open)
        #[arg(long)]
        no_wait: bool,
    },

    /// Change the store password
    Passwd,

    /// Show store diagnostics
    Info,

    /// Check the store's structural invariants
    Validate,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut password = match &cli.password {
        Some(password) => Zeroizing::new(password.clone().into_bytes()),
        None => prompt_password("store password: ")?,
    };
    let store = Store::open(&cli.store, &mut password)
        .with_context(|| format!("opening store {}", cli.store.display()))?;

    match cli.command {
        Commands::Set { path } => {
            let mut data = Zeroizing::new(Vec::new());
            std::io::stdin()
                .read_to_end(&mut data)
                .context("reading secret from stdin")?;
            store.save(&path, &data)?;
        }
        Commands::Get { path } => {
            let data = Zeroizing::new(store.load(&path)?);
            std::io::stdout()
                .write_all(&data)
                .context("writing secret to stdout")?;
        }
        Commands::Rm { path } => store.delete(&path)?,
        Commands::Ls => {
            for path in store.list()? {
                println!("{path}");
            }
        }
        Commands::Rotate { no_wait } => {
            store.rotate()?;
            if !no_wait {
                wait_for_sweep(&store)?;
            }
        }
        Commands::Passwd => {
            let mut new_password = prompt_password("new password: ")?;
            let again = prompt_password("repeat new password: ")?;
            if *new_password != *again {
                bail!("passwords do not match");
            }
            store.passwd(&mut new_password)?;
            eprintln!("password changed; other processes must reopen the store");
        }
        Commands::Info => {
            let info = store.info()?;
            println!("directory:    {}", info.directory.display());
            println!("secrets:      {}", info.secret_count);
            println!("current key:  {}", info.current_key_index);
            println!("live keys:    {} {:?}", info.key_count, info.key_indices);
        }
        Commands::Validate => {
            store.validate()?;
            println!("ok");
        }
    }

    store.close();
    Ok(())
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

/// Block until the re-encryption sweep has settled on a single live key,
/// so the process does not exit with the sweep half done.
fn wait_for_sweep(store: &Store) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        if store.info()?.key_count == 1 {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    eprintln!("re-encryption still running; it will resume at the next open");
    Ok(())
}
