mod cli;

use vodpack::{config, Job, OutputFormat, Packager};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vodpack=debug,vodpack_media=debug".to_string()
        } else {
            "vodpack=info,vodpack_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Package { job, out, size_only } => {
            package(&job, out.as_deref(), size_only, cli.config.as_deref())
        }
        Commands::Init { job, out } => init(&job, &out, cli.config.as_deref()),
        Commands::ValidateConfig => validate_config(cli.config.as_deref()),
    }
}

fn package(job_path: &Path, out: Option<&Path>, size_only: bool, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let job = Job::load(job_path)?;
    let request = job.request(&config)?;
    let mut packager = Packager::new(config, job.reader())?;

    if size_only {
        let size = packager.size_only(&request)?;
        println!("{}: {} bytes", request.format, size);
        return Ok(());
    }

    let out = out.context("--out is required unless --size-only is given")?;
    let segment = packager.run(&request)?;
    std::fs::write(out, &segment.data).with_context(|| format!("Failed to write {:?}", out))?;
    println!("{}: {} bytes written to {}", segment.format, segment.len(), out.display());

    Ok(())
}

fn init(job_path: &Path, out: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let job = Job::load(job_path)?;
    let mut request = job.request(&config)?;
    request.format = match request.format {
        OutputFormat::WebmCluster | OutputFormat::WebmInit => OutputFormat::WebmInit,
        _ => OutputFormat::Mp4Init,
    };

    let mut packager = Packager::new(config, job.reader())?;
    let segment = packager.run(&request)?;
    std::fs::write(out, &segment.data).with_context(|| format!("Failed to write {:?}", out))?;
    println!("{}: {} bytes written to {}", segment.format, segment.len(), out.display());

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => println!("Validating config: {:?}", p),
        None => println!("No config file specified, using search paths"),
    }

    let config = config::load_config_or_default(path)?;
    println!("✓ Configuration is valid");
    println!(
        "  Cache: {} x {} bytes, alignment {}",
        config.cache.slot_count, config.cache.buffer_size, config.cache.alignment
    );
    println!(
        "  Output: reuse buffers {}, single NAL per frame {}, write buffer {} bytes",
        config.output.reuse_buffers, config.output.single_nalu_per_frame, config.output.write_buffer_size
    );
    println!(
        "  Encryption: {}{}",
        config.encryption.scheme,
        if config.encryption.clear_lead { " (clear lead)" } else { "" }
    );

    Ok(())
}
