//! Configuration for the demultiplexing pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input data configuration
    pub input: InputConfig,

    /// Reference genome configuration
    pub reference: ReferenceConfig,

    /// Output working directory
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Variant calling configuration
    #[serde(default)]
    pub variants: VariantConfig,

    /// Clustering configuration
    pub clustering: ClusteringConfig,

    /// External tool names/paths
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Input data configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Coordinate-sorted alignment file with cell barcode and UMI tags
    pub alignment: PathBuf,

    /// Cell barcode list, one barcode per line
    pub barcodes: PathBuf,

    /// Skip read extraction, realignment and sorting; call variants
    /// directly on the input alignment. Only sensible together with a
    /// supplied variant set.
    #[serde(default)]
    pub skip_remap: bool,
}

/// Reference genome configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// Reference FASTA; a `.fai` index is created next to it if missing
    pub fasta: PathBuf,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Working directory for all intermediate and final artifacts
    pub dir: PathBuf,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum number of concurrently running external processes
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Sleep between child-process polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Keep per-chunk intermediates instead of deleting them after merge
    #[serde(default)]
    pub keep_intermediates: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            keep_intermediates: false,
        }
    }
}

/// Variant calling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    /// Known/common variant VCF; its presence selects guided mode unless
    /// `force_de_novo` is set
    #[serde(default)]
    pub common_variants: Option<PathBuf>,

    /// Known per-donor genotype VCF; implies guided mode and is forwarded
    /// to the clustering engine. Mutually exclusive with `common_variants`.
    #[serde(default)]
    pub known_genotypes: Option<PathBuf>,

    /// Which samples of the known-genotype VCF correspond to the donors
    #[serde(default)]
    pub known_genotypes_sample_names: Option<Vec<String>>,

    /// Call variants de novo even when a common-variant set is supplied;
    /// the set is then intersected with the de novo calls instead of
    /// replacing them
    #[serde(default)]
    pub force_de_novo: bool,

    /// Minimum reference-supporting coverage for a usable locus
    #[serde(default = "default_min_ref")]
    pub min_ref: u32,

    /// Minimum alternate-supporting coverage for a usable locus
    #[serde(default = "default_min_alt")]
    pub min_alt: u32,

    /// Positions at or above this depth are skipped (collapsed repeats)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Sequences shorter than this are excluded from variant-calling shards
    #[serde(default = "default_min_sequence_length")]
    pub min_sequence_length: u64,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            common_variants: None,
            known_genotypes: None,
            known_genotypes_sample_names: None,
            force_de_novo: false,
            min_ref: default_min_ref(),
            min_alt: default_min_alt(),
            max_depth: default_max_depth(),
            min_sequence_length: default_min_sequence_length(),
        }
    }
}

impl VariantConfig {
    /// The supplied variant set, if any. Known genotypes take precedence.
    pub fn supplied_set(&self) -> Option<&PathBuf> {
        self.known_genotypes
            .as_ref()
            .or(self.common_variants.as_ref())
    }

    /// Combined coverage threshold for guided-mode depth filtering.
    pub fn min_coverage(&self) -> u32 {
        self.min_ref + self.min_alt
    }
}

/// Clustering configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Number of genotype clusters (donors) to separate
    pub clusters: usize,

    /// Donor ploidy, 1 or 2
    #[serde(default = "default_ploidy")]
    pub ploidy: u32,

    /// Clustering restarts; raise well above the default for many clusters
    #[serde(default = "default_restarts")]
    pub restarts: usize,

    /// Maximum loci per cell considered by the clustering engine
    #[serde(default = "default_max_loci")]
    pub max_loci: usize,
}

/// Names (or full paths) of the external tools each stage invokes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-region read extractor producing barcode/UMI-tagged FASTQ
    #[serde(default = "default_extractor")]
    pub extractor: String,

    /// Sequence aligner (minimap2-compatible argument surface)
    #[serde(default = "default_aligner")]
    pub aligner: String,

    /// samtools (view/sort/depth/index/faidx)
    #[serde(default = "default_samtools")]
    pub samtools: String,

    /// Variant caller (freebayes-compatible argument surface)
    #[serde(default = "default_variant_caller")]
    pub variant_caller: String,

    /// bcftools (concat/sort)
    #[serde(default = "default_bcftools")]
    pub bcftools: String,

    /// bedtools (merge/intersect)
    #[serde(default = "default_bedtools")]
    pub bedtools: String,

    /// bgzip compressor
    #[serde(default = "default_bgzip")]
    pub bgzip: String,

    /// tabix indexer
    #[serde(default = "default_tabix")]
    pub tabix: String,

    /// Allele counter producing ref/alt sparse matrices (vartrix-compatible)
    #[serde(default = "default_allele_counter")]
    pub allele_counter: String,

    /// Genotype clustering engine
    #[serde(default = "default_cluster")]
    pub cluster: String,

    /// Doublet classifier
    #[serde(default = "default_doublet_classifier")]
    pub doublet_classifier: String,

    /// Genotype-consensus / ambient-RNA solver
    #[serde(default = "default_consensus")]
    pub consensus: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            extractor: default_extractor(),
            aligner: default_aligner(),
            samtools: default_samtools(),
            variant_caller: default_variant_caller(),
            bcftools: default_bcftools(),
            bedtools: default_bedtools(),
            bgzip: default_bgzip(),
            tabix: default_tabix(),
            allele_counter: default_allele_counter(),
            cluster: default_cluster(),
            doublet_classifier: default_doublet_classifier(),
            consensus: default_consensus(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON, so it is also the fallback.
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Whether variant calling runs in guided mode (supplied set reused
    /// directly) rather than de novo.
    pub fn guided_variants(&self) -> bool {
        self.variants.supplied_set().is_some() && !self.variants.force_de_novo
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.processing.threads == 0 {
            anyhow::bail!("processing.threads must be > 0");
        }
        if self.processing.poll_interval_ms == 0 {
            anyhow::bail!("processing.poll_interval_ms must be > 0");
        }
        if self.clustering.clusters == 0 {
            anyhow::bail!("clustering.clusters must be > 0");
        }
        if self.clustering.ploidy != 1 && self.clustering.ploidy != 2 {
            anyhow::bail!("clustering.ploidy must be 1 or 2");
        }
        if self.variants.common_variants.is_some() && self.variants.known_genotypes.is_some() {
            anyhow::bail!("cannot set both variants.common_variants and variants.known_genotypes");
        }
        if let Some(names) = &self.variants.known_genotypes_sample_names {
            if self.variants.known_genotypes.is_none() {
                anyhow::bail!(
                    "variants.known_genotypes_sample_names requires variants.known_genotypes"
                );
            }
            if names.len() != self.clustering.clusters {
                anyhow::bail!(
                    "variants.known_genotypes_sample_names must list exactly {} samples",
                    self.clustering.clusters
                );
            }
        }
        if self.variants.min_coverage() == 0 {
            anyhow::bail!("variants.min_ref + variants.min_alt must be > 0");
        }
        if self.input.skip_remap && self.variants.supplied_set().is_none() {
            anyhow::bail!(
                "input.skip_remap without a supplied variant set produces poor-quality calls; \
                 set variants.common_variants or variants.known_genotypes"
            );
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_min_ref() -> u32 {
    4
}
fn default_min_alt() -> u32 {
    4
}
fn default_max_depth() -> u32 {
    100_000
}
fn default_min_sequence_length() -> u64 {
    250_000
}
fn default_ploidy() -> u32 {
    2
}
fn default_restarts() -> usize {
    100
}
fn default_max_loci() -> usize {
    2048
}
fn default_extractor() -> String {
    "renamer".to_string()
}
fn default_aligner() -> String {
    "minimap2".to_string()
}
fn default_samtools() -> String {
    "samtools".to_string()
}
fn default_variant_caller() -> String {
    "freebayes".to_string()
}
fn default_bcftools() -> String {
    "bcftools".to_string()
}
fn default_bedtools() -> String {
    "bedtools".to_string()
}
fn default_bgzip() -> String {
    "bgzip".to_string()
}
fn default_tabix() -> String {
    "tabix".to_string()
}
fn default_allele_counter() -> String {
    "vartrix".to_string()
}
fn default_cluster() -> String {
    "souporcell".to_string()
}
fn default_doublet_classifier() -> String {
    "troublet".to_string()
}
fn default_consensus() -> String {
    "consensus".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
input:
  alignment: /data/possorted_genome_bam.bam
  barcodes: /data/barcodes.tsv
reference:
  fasta: /refs/genome.fa
output:
  dir: /work/demux
clustering:
  clusters: 4
"#
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert!(config.processing.threads >= 1);
        assert_eq!(config.processing.poll_interval_ms, 500);
        assert_eq!(config.variants.min_coverage(), 8);
        assert_eq!(config.variants.min_sequence_length, 250_000);
        assert_eq!(config.clustering.ploidy, 2);
        assert_eq!(config.tools.samtools, "samtools");
        assert!(!config.guided_variants());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_guided_mode_selection() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.variants.common_variants = Some(PathBuf::from("/refs/common.vcf"));
        assert!(config.guided_variants());

        config.variants.force_de_novo = true;
        assert!(!config.guided_variants());
    }

    #[test]
    fn test_known_genotypes_take_precedence() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.variants.known_genotypes = Some(PathBuf::from("/refs/donors.vcf"));
        assert_eq!(
            config.variants.supplied_set(),
            Some(&PathBuf::from("/refs/donors.vcf"))
        );
    }

    #[test]
    fn test_validate_rejects_both_variant_sources() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.variants.common_variants = Some(PathBuf::from("/refs/common.vcf"));
        config.variants.known_genotypes = Some(PathBuf::from("/refs/donors.vcf"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sample_names_require_known_genotypes() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.variants.known_genotypes_sample_names = Some(vec!["a".into(), "b".into()]);
        assert!(config.validate().is_err());

        config.variants.known_genotypes = Some(PathBuf::from("/refs/donors.vcf"));
        // Wrong cardinality: clusters is 4.
        assert!(config.validate().is_err());

        config.variants.known_genotypes_sample_names =
            Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blind_skip_remap() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.input.skip_remap = true;
        assert!(config.validate().is_err());

        config.variants.common_variants = Some(PathBuf::from("/refs/common.vcf"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ploidy() {
        let mut config = Config::from_yaml(minimal_yaml()).unwrap();
        config.clustering.ploidy = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "input": {"alignment": "/d/a.bam", "barcodes": "/d/b.tsv"},
            "reference": {"fasta": "/r/g.fa"},
            "output": {"dir": "/w"},
            "clustering": {"clusters": 2}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.clustering.clusters, 2);
    }
}
