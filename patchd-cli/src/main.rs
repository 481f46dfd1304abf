use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use patchd_cli::config::ServeArgs;
use patchd_cli::server;
use patchd_core::manifest::{self, ManifestOptions, INITIAL_VERSION};
use patchd_core::reconcile::{self, ClientFileSet};

#[derive(Parser)]
#[command(name = "patchd", version, about = "patchd: release manifests, integrity checks and file distribution")]
struct Cli {
    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, global = true, env = "PATCHD_LOG", default_value = "info")]
    log_level: String,
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PATCHD_LOG_JSON")]
    log_json: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Serve a file root over HTTP
    Serve(ServeArgs),
    /// Scan a directory and print its manifest
    Manifest {
        dir: PathBuf,
        #[arg(long, default_value = INITIAL_VERSION)]
        version: String,
        /// Also persist it as <dir>/manifest.json
        #[arg(long, default_value_t = false)]
        write: bool,
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Check a local directory against a manifest file
    Verify {
        manifest: PathBuf,
        root: PathBuf,
        /// Also list local files the manifest does not know
        #[arg(long, default_value_t = false)]
        extras: bool,
        #[arg(long)]
        exclude: Vec<String>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to command output; logs go to stderr
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);
    match cli.cmd {
        Cmd::Serve(args) => {
            let cfg = args.resolve()?;
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            rt.block_on(server::run(cfg))?;
        }
        Cmd::Manifest { dir, version, write, exclude } => {
            print_manifest(&dir, &version, write, ManifestOptions { exclude })?
        }
        Cmd::Verify { manifest, root, extras, exclude } => {
            let ok = verify(&manifest, &root, extras, ManifestOptions { exclude })?;
            if !ok {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn print_manifest(dir: &Path, version: &str, write: bool, opts: ManifestOptions) -> Result<()> {
    let m = manifest::generate_with(version, dir, &opts)?;
    if write {
        manifest::save(&m, dir)?;
        eprintln!("wrote {}", manifest::manifest_path(dir).display());
    }
    println!("{}", serde_json::to_string_pretty(&m)?);
    Ok(())
}

/// Hash the local files the same way the server does, then reconcile.
fn verify(manifest_path: &Path, root: &Path, show_extras: bool, opts: ManifestOptions) -> Result<bool> {
    let mani = manifest::read_from(manifest_path)?;
    let local = manifest::generate_with("local", root, &opts)?;
    let client: ClientFileSet =
        local.files.into_iter().map(|f| (f.file_name, f.hash)).collect::<HashMap<_, _>>();

    let res = reconcile::reconcile(&mani, &client);
    eprintln!(
        "Files: {} in manifest, {} local; mismatched={}, missing={}",
        mani.files.len(),
        client.len(),
        res.mismatches.len(),
        res.missing.len()
    );
    for f in &res.mismatches {
        println!("MISMATCH {}", f);
    }
    for f in &res.missing {
        println!("MISSING {}", f);
    }
    if show_extras {
        for f in reconcile::extras(&mani, &client) {
            println!("EXTRA {}", f);
        }
    }
    println!("{}", if res.valid { "OK" } else { "BAD" });
    Ok(res.valid)
}
