//! ovapack CLI - Turn QCOW2 disk images into OVA archives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use ovapack_core::ova::{ensure_output_absent, image_basename};
use ovapack_core::ovf::BYTES_PER_GIB;
use ovapack_core::{convert_image, image_info, ConvertOptions, ConvertPhase, DigestAlgorithm};
use tracing_subscriber::EnvFilter;

/// Package a QCOW2 disk image as an OVA archive.
#[derive(Parser)]
#[command(name = "ovapack")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a QCOW2 image into an OVA archive.
    Convert {
        /// Input QCOW2 image.
        #[arg(short, long)]
        input: PathBuf,

        /// Output OVA path. Defaults to the image name with .ova extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for temporary files.
        #[arg(long)]
        tmpdir: Option<PathBuf>,

        /// Manifest digest algorithm.
        #[arg(long, value_enum, default_value = "sha1")]
        digest: DigestArg,

        /// Path to the qemu-img binary.
        #[arg(long, default_value = "qemu-img")]
        qemu_img: PathBuf,

        /// Path to the tar binary.
        #[arg(long, default_value = "tar")]
        tar: PathBuf,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a QCOW2 image.
    Info {
        /// Path to the QCOW2 image.
        image: PathBuf,
    },
}

/// Manifest digest argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum DigestArg {
    /// SHA-1 (OVF 1.x).
    Sha1,
    /// SHA-256 (OVF 2.0).
    Sha256,
}

impl From<DigestArg> for DigestAlgorithm {
    fn from(arg: DigestArg) -> Self {
        match arg {
            DigestArg::Sha1 => DigestAlgorithm::Sha1,
            DigestArg::Sha256 => DigestAlgorithm::Sha256,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            input,
            output,
            tmpdir,
            digest,
            qemu_img,
            tar,
            quiet,
        } => {
            let options = ConvertOptions {
                temp_root: tmpdir,
                digest: digest.into(),
                qemu_img,
                tar,
            };
            run_convert(&input, output.as_deref(), &options, quiet)?;
        }
        Commands::Info { image } => {
            show_info(&image)?;
        }
    }

    Ok(())
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    if let Err(e) = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init()
    {
        eprintln!("failed to initialize logging: {}", e);
    }
}

/// Pick the archive path and refuse an existing one before the image is opened.
fn resolve_output(input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(format!("{}.ova", image_basename(input)?)),
    };
    ensure_output_absent(&output_path)?;
    Ok(output_path)
}

fn run_convert(
    input: &Path,
    output: Option<&Path>,
    options: &ConvertOptions,
    quiet: bool,
) -> Result<()> {
    let output_path = resolve_output(input, output)?;

    if !quiet {
        println!("QCOW2 to OVA");
        println!("------------");
        println!("Input:     {}", input.display());
        println!("Output:    {}", output_path.display());
        println!();
    }

    let spinner = if quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    };

    let callback: Option<ovapack_core::ProgressCallback> = spinner.clone().map(|pb| {
        Box::new(move |phase: ConvertPhase| pb.set_message(phase.to_string()))
            as ovapack_core::ProgressCallback
    });

    let result = convert_image(input, &output_path, options, callback);

    if let Some(pb) = spinner {
        match &result {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(_) => pb.abandon_with_message("Failed"),
        }
    }

    let summary =
        result.with_context(|| format!("failed to create '{}'", output_path.display()))?;

    if !quiet {
        println!();
        println!("Created {}", summary.output.display());
        println!(
            "  Virtual size: {} ({} GiB capacity)",
            format_bytes(summary.logical_size),
            summary.logical_size / BYTES_PER_GIB
        );
        for name in [&summary.names.descriptor, &summary.names.disk] {
            if let Some(entry) = summary.manifest.get(name) {
                println!("  {}", entry);
            }
        }
    }

    Ok(())
}

fn show_info(image: &Path) -> Result<()> {
    let info = image_info(image)
        .with_context(|| format!("cannot read QCOW2 image '{}'", image.display()))?;
    let header = &info.header;

    println!("Image Information");
    println!("=================");
    println!();
    println!("Version:       {}", header.version);
    println!("Virtual size:  {} ({} bytes)", format_bytes(header.size), header.size);
    println!("File size:     {}", format_bytes(info.physical_size));
    match header.cluster_size() {
        Some(size) => println!("Cluster size:  {}", format_bytes(size)),
        None => println!("Cluster size:  invalid ({} bits)", header.cluster_bits),
    }
    println!("Backing file:  {}", if header.has_backing_file() { "yes" } else { "no" });
    println!("Encrypted:     {}", if header.is_encrypted() { "yes" } else { "no" });
    println!("Snapshots:     {}", header.nb_snapshots);
    println!();
    println!("OVA members:");
    println!("  {} (capacity {} GiB)", info.names.descriptor, info.capacity_gb);
    println!("  {}", info.names.disk);
    println!("  {}", info.names.manifest);

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
