//! scdemux CLI
//!
//! Checkpointed orchestrator for single-cell genotype demultiplexing.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scdemux::{plan_chunks, reference, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "scdemux")]
#[command(about = "Demultiplex pooled single-cell data by genotype", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of concurrent external processes
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Print the region sharding layout without running anything
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run_command(cli.config, cli.threads),
        Some(Commands::Plan) => plan_command(cli.config, cli.threads),
        Some(Commands::Validate) => validate_command(cli.config),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    }
}

fn load_config(config_path: &PathBuf, threads: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    if let Some(threads) = threads {
        config.processing.threads = threads;
    }
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, threads: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, threads)?;
    let summary = run_pipeline(&config)?;
    println!("{}", summary);
    Ok(())
}

fn plan_command(config_path: PathBuf, threads: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, threads)?;

    let fai = PathBuf::from(format!("{}.fai", config.reference.fasta.display()));
    let sequences = reference::read_fai(&fai)?;
    let total: u64 = sequences.iter().map(|s| s.length).sum();

    println!("=== Reference ===");
    println!("Sequences: {}", sequences.len());
    println!("Total length: {} bases", total);

    let extraction = plan_chunks(&sequences, 2 * config.processing.threads, 0);
    println!("\n=== Read extraction ({} chunks) ===", extraction.len());
    for chunk in &extraction {
        println!(
            "chunk {:>3}: {:>12} bases, {} intervals",
            chunk.index,
            chunk.weight(),
            chunk.intervals.len()
        );
    }

    if config.guided_variants() {
        println!("\n=== Variant calling ===");
        println!(
            "guided mode: no sharding, intersecting {}",
            config
                .variants
                .supplied_set()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    } else {
        let calling = plan_chunks(
            &sequences,
            config.processing.threads,
            config.variants.min_sequence_length,
        );
        println!("\n=== Variant calling ({} chunks) ===", calling.len());
        for chunk in &calling {
            println!(
                "chunk {:>3}: {:>12} bases, {} intervals",
                chunk.index,
                chunk.weight(),
                chunk.intervals.len()
            );
        }
    }

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# scdemux pipeline configuration

# === INPUT ===
input:
  # Coordinate-sorted alignment with cell barcode (CB) and UMI (UB) tags
  alignment: /data/possorted_genome_bam.bam

  # Cell barcode list, one barcode per line
  barcodes: /data/barcodes.tsv

  # Skip extraction/realignment/sorting and call variants on the input
  # alignment directly. Only sensible with a supplied variant set.
  skip_remap: false

# === REFERENCE ===
reference:
  # Must be the same reference the supplied variant sets were called against
  fasta: /refs/genome.fa

# === OUTPUT ===
output:
  # Working directory; re-running against it resumes from checkpoints
  dir: /work/demux

# === PROCESSING ===
processing:
  # Maximum concurrently running external processes (default: CPU count)
  threads: 8

  # Sleep between child-process polls, in milliseconds
  poll_interval_ms: 500

  # Keep per-chunk intermediates instead of deleting them after merge
  keep_intermediates: false

# === VARIANTS ===
variants:
  # Known/common variant VCF; enables guided mode (no de novo calling)
  # common_variants: /refs/common_variants.vcf

  # Known per-donor genotype VCF; guided mode plus genotype-aware clustering
  # known_genotypes: /refs/donors.vcf
  # known_genotypes_sample_names: [donor_a, donor_b]

  # Minimum ref/alt-supporting coverage for a usable locus
  min_ref: 4
  min_alt: 4

  # Positions at or above this depth are skipped (collapsed repeats)
  max_depth: 100000

  # Sequences shorter than this are excluded from variant-calling shards
  min_sequence_length: 250000

# === CLUSTERING ===
clustering:
  # Number of donors pooled in the sample
  clusters: 4

  # Donor ploidy, 1 or 2
  ploidy: 2

  # Clustering restarts; raise well above 100 for more than ~12 clusters
  restarts: 100

# === TOOLS ===
# Every external tool can be renamed or pointed at a full path.
# tools:
#   aligner: /opt/minimap2/minimap2
#   samtools: samtools
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["scdemux"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_overrides() {
        let cli = Cli::try_parse_from(["scdemux", "-c", "other.yaml", "-t", "16"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        assert_eq!(cli.threads, Some(16));
    }

    #[test]
    fn test_cli_parse_plan() {
        let cli = Cli::try_parse_from(["scdemux", "plan", "-c", "test.json"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_generated_config_parses_and_validates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.clustering.clusters, 4);
    }
}
