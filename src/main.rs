use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use upgrader::cancel::{CancelToken, Deadline};
use upgrader::delta::{self, DeltaLimits, DEFAULT_BLOCK_KIB};
use upgrader::integrity;
use upgrader::pool::DEFAULT_WORKERS;
use upgrader::{apply, archive, generate, ApplyConfig, GenerateConfig};

#[derive(Parser)]
#[command(
    name = "upgrader",
    about = "Generate and apply minimum-sized binary update packages between directory snapshots"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an update package from the diff between two snapshots
    Generate {
        /// Base (currently released) snapshot directory
        #[arg(long)]
        base: PathBuf,
        /// Target (new release) snapshot directory
        #[arg(long)]
        target: PathBuf,
        /// Output directory for the update package
        #[arg(long, short)]
        output: PathBuf,
        /// Version identifier of the target release
        #[arg(long)]
        version: String,
        /// Free-text description stored in the manifest
        #[arg(long, default_value = "")]
        description: String,
        /// Worker pool size
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        /// Also diff files with well-known binary extensions
        #[arg(long)]
        include_binary: bool,
    },
    /// Create a binary patch between two files
    CreatePatch {
        old: PathBuf,
        new: PathBuf,
        patch: PathBuf,
        /// Delta block size in KiB
        #[arg(long, default_value_t = DEFAULT_BLOCK_KIB)]
        block_size: u32,
    },
    /// Apply a binary patch to a file
    ApplyPatch {
        old: PathBuf,
        patch: PathBuf,
        new: PathBuf,
        /// Expected block size in KiB; must match the one recorded in the patch
        #[arg(long)]
        block_size: Option<u32>,
    },
    /// Pack files and directories into a tar.gz archive (plus .md5 sidecar)
    Compress {
        output: PathBuf,
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Extract a tar.gz archive into a directory
    Decompress { archive: PathBuf, dir: PathBuf },
    /// Verify an update archive and apply it to a deployment
    Upgrade {
        /// Update archive (tar.gz with an .md5 sidecar)
        #[arg(long)]
        input: PathBuf,
        /// Deployment directory to upgrade
        #[arg(long)]
        output: PathBuf,
        /// Digest file; defaults to <input>.md5
        #[arg(long)]
        digest: Option<PathBuf>,
        /// Worker pool size
        #[arg(long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            base,
            target,
            output,
            version,
            description,
            workers,
            include_binary,
        } => {
            println!("Generating update package...");
            println!("  Base: {}", base.display());
            println!("  Target: {}", target.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let mut cfg = GenerateConfig::new(base, target, output, version);
            cfg.description = description;
            cfg.workers = workers;
            cfg.include_binary = include_binary;
            let summary = generate(cfg).await?;
            let elapsed = start.elapsed();

            println!("\nUpdate package generated successfully!");
            println!("  Files added: {}", summary.added);
            println!("  Files modified: {}", summary.modified);
            println!("  Files deleted: {}", summary.deleted);
            println!("  Manifest: {}", summary.manifest_path.display());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::CreatePatch {
            old,
            new,
            patch,
            block_size,
        } => {
            create_patch_file(&old, &new, &patch, block_size)?;
        }
        Commands::ApplyPatch {
            old,
            patch,
            new,
            block_size,
        } => {
            apply_patch_file(&old, &patch, &new, block_size)?;
        }
        Commands::Compress { output, sources } => {
            archive::create_tar_gz(&sources, &output)?;
            let digest = archive::write_digest_file(&output)?;
            println!("Created archive: {}", output.display());
            println!("  Digest: {}", digest.display());
        }
        Commands::Decompress { archive: path, dir } => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            archive::extract_tar_gz(&path, &dir, &CancelToken::new())?;
            println!("Extracted {} to {}", path.display(), dir.display());
        }
        Commands::Upgrade {
            input,
            output,
            digest,
            workers,
        } => {
            println!("Applying update...");
            println!("  Archive: {}", input.display());
            println!("  Deployment: {}", output.display());

            let start = Instant::now();
            let mut cfg = ApplyConfig::new(output, input);
            cfg.digest_file = digest;
            cfg.workers = workers;
            let summary = apply(cfg).await?;
            let elapsed = start.elapsed();

            println!("\nUpgrade applied successfully!");
            println!("  Version: {}", summary.version);
            println!("  Files added: {}", summary.added);
            println!("  Files modified: {}", summary.modified);
            println!("  Files deleted: {}", summary.deleted);
            println!("  Files carried over: {}", summary.carried_over);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}

fn create_patch_file(old: &Path, new: &Path, patch: &Path, block_kib: u32) -> anyhow::Result<()> {
    for input in [old, new] {
        if !integrity::file_exists(input) {
            bail!("input file does not exist: {}", input.display());
        }
    }

    let old_bytes = integrity::file_bytes(old)?;
    let new_bytes = integrity::file_bytes(new)?;
    let deadline = Deadline::after(DeltaLimits::default().encode_budget);
    let blob = delta::encode(&old_bytes, &new_bytes, block_kib, &deadline, &CancelToken::new())?;

    if let Some(parent) = patch.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(patch, &blob)
        .with_context(|| format!("Failed to write {}", patch.display()))?;

    let shown = patch.canonicalize().unwrap_or_else(|_| patch.to_path_buf());
    println!("Patch file created: {}", shown.display());
    println!("  Size: {} bytes ({} KiB blocks)", blob.len(), block_kib);
    Ok(())
}

fn apply_patch_file(
    old: &Path,
    patch: &Path,
    new: &Path,
    block_kib: Option<u32>,
) -> anyhow::Result<()> {
    for input in [old, patch] {
        if !integrity::file_exists(input) {
            bail!("input file does not exist: {}", input.display());
        }
    }
    if new.exists() {
        bail!("output file already exists: {}", new.display());
    }

    let old_bytes = integrity::file_bytes(old)?;
    let patch_bytes = integrity::file_bytes(patch)?;

    let recorded = delta::embedded_block_kib(&patch_bytes)?;
    if let Some(requested) = block_kib {
        if requested != recorded {
            bail!("patch was encoded with {recorded} KiB blocks, not {requested}");
        }
    }

    let deadline = Deadline::after(DeltaLimits::default().decode_budget);
    let rebuilt = delta::decode(&old_bytes, &patch_bytes, &deadline, &CancelToken::new())?;

    if let Some(parent) = new.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if let Err(e) = std::fs::write(new, &rebuilt) {
        // Do not leave a partially written output behind.
        let _ = std::fs::remove_file(new);
        return Err(e).with_context(|| format!("Failed to write {}", new.display()));
    }

    let shown = new.canonicalize().unwrap_or_else(|_| new.to_path_buf());
    println!("New file created: {}", shown.display());
    println!("  Size: {} bytes", rebuilt.len());
    Ok(())
}
