//! Stage producers: command construction and per-stage merge logic.
//!
//! Every external collaborator is consumed through its command-line/file
//! contract only. Fan-out stages submit one job per chunk to the worker
//! pool; linear stages use spawn-and-wait or a stdout pipe between two
//! children (aligner into `samtools view`, `samtools depth` into the
//! in-process coverage filter).

use crate::exec::{run_checked, JobSpec};
use crate::pipeline::{Pipeline, RunContext};
use crate::planner::{plan_chunks, Chunk};
use crate::reference::{read_fai, SequenceInfo};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

impl Pipeline<'_> {
    /// Shard the input alignment into per-chunk FASTQs with barcodes and
    /// UMIs carried in the read names.
    pub(super) fn shard(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        self.ensure_alignment_index(&ctx.alignment)?;
        let sequences = self.reference_sequences()?;

        // Twice the slot count keeps every slot busy even when chunk
        // runtimes are uneven.
        let target = 2 * self.config.processing.threads;
        let chunks = plan_chunks(&sequences, target, 0);
        if chunks.is_empty() {
            bail!("reference index lists no sequences to shard");
        }
        tracing::info!("sharding reads into {} chunks", chunks.len());

        let mut fastqs = Vec::with_capacity(chunks.len());
        let mut jobs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let fastq = ctx.path(&format!("shard_{}.fq", chunk.index));
            let mut args = vec![
                "--bam".to_string(),
                ctx.alignment.display().to_string(),
                "--barcodes".to_string(),
                self.config.input.barcodes.display().to_string(),
                "--out".to_string(),
                fastq.display().to_string(),
            ];
            push_regions(&mut args, chunk);
            jobs.push(JobSpec::new(&self.config.tools.extractor, args).at_index(chunk.index));
            fastqs.push(fastq);
        }

        self.pool.run(jobs)?;
        Ok(fastqs)
    }

    /// Align all shard FASTQs against the reference, converting the SAM
    /// stream to BAM on the fly.
    pub(super) fn align(&self, ctx: &RunContext, fastqs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let tools = &self.config.tools;
        let fasta = &self.config.reference.fasta;
        let index = ctx.path("aligner_index.mmi");

        tracing::info!("building aligner index");
        run_checked(
            JobSpec::new(
                &tools.aligner,
                vec![
                    "-x".into(),
                    "splice".into(),
                    "-k".into(),
                    "21".into(),
                    "-w".into(),
                    "11".into(),
                    "-d".into(),
                    index.display().to_string(),
                    fasta.display().to_string(),
                ],
            )
            .stderr_to(ctx.path("aligner_index.err")),
        )?;

        let unsorted = ctx.path("aligned_unsorted.bam");
        let align_err = ctx.path("align.err");
        tracing::info!("aligning {} shard files", fastqs.len());
        self.run_aligner_pipe(&index, fastqs, &unsorted, &align_err)?;

        let mut intermediates: Vec<PathBuf> = fastqs.to_vec();
        intermediates.push(index);
        self.remove_intermediates(&intermediates);

        Ok(vec![unsorted])
    }

    /// Aligner stdout feeds `samtools view -b` directly; no SAM text ever
    /// touches the disk.
    fn run_aligner_pipe(
        &self,
        index: &Path,
        fastqs: &[PathBuf],
        out_bam: &Path,
        err_path: &Path,
    ) -> Result<()> {
        let tools = &self.config.tools;
        let err_file = File::create(err_path)
            .with_context(|| format!("failed to create error sink {}", err_path.display()))?;

        let mut aligner = Command::new(&tools.aligner);
        aligner
            .args([
                "-ax",
                "splice",
                "-t",
                &self.config.processing.threads.to_string(),
                "-G50k",
                "-k",
                "21",
                "-w",
                "11",
                "--sr",
                "-A2",
                "-B8",
                "-O12,32",
                "-E2,1",
                "-r200",
                "-p.5",
                "-N20",
                "-f1000,5000",
                "-y",
                "-n2",
                "-m20",
                "-s40",
                "-g2000",
                "-2K50m",
                "--secondary=no",
            ])
            .arg(index)
            .args(fastqs)
            .stdout(Stdio::piped())
            .stderr(Stdio::from(err_file.try_clone()?));

        let mut aligner_child = aligner
            .spawn()
            .with_context(|| format!("failed to launch `{}`", tools.aligner))?;

        let view_result = (|| -> Result<ExitStatus> {
            let aligner_stdout = aligner_child
                .stdout
                .take()
                .context("aligner stdout was not captured")?;

            let mut view = Command::new(&tools.samtools);
            view.args(["view", "-b", "-@", "3", "-o"])
                .arg(out_bam)
                .arg("-")
                .stdin(Stdio::from(aligner_stdout))
                .stderr(Stdio::from(err_file));

            let mut view_child = view
                .spawn()
                .with_context(|| format!("failed to launch `{}` view", tools.samtools))?;
            view_child
                .wait()
                .context("failed to wait for samtools view")
        })();

        let view_status = match view_result {
            Ok(status) => status,
            Err(err) => {
                // The consumer never came up; the aligner must not outlive
                // this call.
                let _ = aligner_child.kill();
                let _ = aligner_child.wait();
                return Err(err);
            }
        };
        let aligner_status = aligner_child.wait()?;
        if !aligner_status.success() {
            bail!(
                "aligner exited with {} (stderr: {})",
                aligner_status,
                err_path.display()
            );
        }
        if !view_status.success() {
            bail!(
                "samtools view exited with {} (stderr: {})",
                view_status,
                err_path.display()
            );
        }
        Ok(())
    }

    /// Coordinate-sort the aligned BAM and index it in the same pass.
    pub(super) fn sort(&self, ctx: &RunContext, unsorted: &Path) -> Result<Vec<PathBuf>> {
        let sorted = ctx.path("aligned_sorted.bam");
        run_checked(
            JobSpec::new(
                &self.config.tools.samtools,
                vec![
                    "sort".into(),
                    "-@".into(),
                    self.config.processing.threads.to_string(),
                    "--write-index".into(),
                    "-o".into(),
                    sorted.display().to_string(),
                    unsorted.display().to_string(),
                ],
            )
            .stderr_to(ctx.path("sort.err")),
        )?;

        self.remove_intermediates(&[unsorted.to_path_buf()]);
        Ok(vec![sorted])
    }

    /// Produce the final variant set, guided or de novo.
    pub(super) fn call_variants(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        match self.config.variants.supplied_set() {
            Some(supplied) if self.config.guided_variants() => self.guided_variants(ctx, supplied),
            _ => self.de_novo_variants(ctx),
        }
    }

    /// Guided mode: no fan-out. Scan genome-wide depth, keep positions with
    /// usable coverage, and intersect the supplied set with them.
    fn guided_variants(&self, ctx: &RunContext, supplied: &Path) -> Result<Vec<PathBuf>> {
        let tools = &self.config.tools;
        tracing::info!("guided variant mode: intersecting {}", supplied.display());

        let depth_bed = ctx.path("depth.bed");
        let kept = self.scan_depth(&ctx.alignment, &depth_bed)?;
        tracing::info!("depth scan kept {} positions", kept);

        let merged_bed = ctx.path("depth_merged.bed");
        run_checked(
            JobSpec::new(
                &tools.bedtools,
                vec![
                    "merge".into(),
                    "-i".into(),
                    depth_bed.display().to_string(),
                ],
            )
            .stdout_to(merged_bed.clone())
            .stderr_to(ctx.path("bedtools_merge.err")),
        )?;

        let body = ctx.path("variants_covered_body.vcf");
        run_checked(
            JobSpec::new(
                &tools.bedtools,
                vec![
                    "intersect".into(),
                    "-wa".into(),
                    "-a".into(),
                    supplied.display().to_string(),
                    "-b".into(),
                    merged_bed.display().to_string(),
                ],
            )
            .stdout_to(body.clone())
            .stderr_to(ctx.path("bedtools_intersect.err")),
        )?;

        // bedtools drops the VCF header; restore it from the supplied set.
        let covered = ctx.path("variants_covered.vcf");
        splice_vcf_header(supplied, &body, &covered)?;

        self.remove_intermediates(&[depth_bed, merged_bed, body]);
        Ok(vec![covered])
    }

    /// Stream `samtools depth` through the in-process coverage filter.
    fn scan_depth(&self, alignment: &Path, out_bed: &Path) -> Result<u64> {
        let tools = &self.config.tools;
        let mut depth = Command::new(&tools.samtools)
            .arg("depth")
            .arg(alignment)
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch `{}` depth", tools.samtools))?;

        let filtered = (|| -> Result<u64> {
            let stdout = depth
                .stdout
                .take()
                .context("samtools depth stdout was not captured")?;
            let mut writer = BufWriter::new(File::create(out_bed).with_context(|| {
                format!("failed to create depth table {}", out_bed.display())
            })?);
            let kept = covered_positions(
                BufReader::new(stdout),
                &mut writer,
                self.config.variants.min_coverage(),
                self.config.variants.max_depth,
            )?;
            writer.flush()?;
            Ok(kept)
        })();

        let kept = match filtered {
            Ok(kept) => kept,
            Err(err) => {
                // Stop the producer instead of leaving it to die on a broken
                // pipe unreaped.
                let _ = depth.kill();
                let _ = depth.wait();
                return Err(err);
            }
        };

        let status = depth.wait()?;
        if !status.success() {
            bail!("samtools depth exited with {}", status);
        }
        Ok(kept)
    }

    /// De novo mode: shard the genome, call per chunk, recombine in queue
    /// order, sort, optionally intersect, compress and index.
    fn de_novo_variants(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        let tools = &self.config.tools;
        let variants = &self.config.variants;
        let sequences = self.reference_sequences()?;

        let chunks = plan_chunks(
            &sequences,
            self.config.processing.threads,
            variants.min_sequence_length,
        );
        if chunks.is_empty() {
            bail!(
                "no reference sequence reaches variants.min_sequence_length = {}",
                variants.min_sequence_length
            );
        }
        tracing::info!("calling variants over {} chunks", chunks.len());

        let mut chunk_vcfs = Vec::with_capacity(chunks.len());
        let mut chunk_errs = Vec::with_capacity(chunks.len());
        let mut jobs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vcf = ctx.path(&format!("variants_chunk_{}.vcf", chunk.index));
            let err = ctx.path(&format!("variants_chunk_{}.err", chunk.index));
            let mut args = vec![
                "-f".to_string(),
                self.config.reference.fasta.display().to_string(),
                "-iXu".to_string(),
                "-C".to_string(),
                "2".to_string(),
                "-q".to_string(),
                "20".to_string(),
                "-n".to_string(),
                "3".to_string(),
                "-E".to_string(),
                "1".to_string(),
                "-m".to_string(),
                "30".to_string(),
                "--min-coverage".to_string(),
                variants.min_coverage().to_string(),
                "--pooled-continuous".to_string(),
                "--skip-coverage".to_string(),
                variants.max_depth.to_string(),
            ];
            push_regions(&mut args, chunk);
            args.push(ctx.alignment.display().to_string());

            jobs.push(
                JobSpec::new(&tools.variant_caller, args)
                    .stdout_to(vcf.clone())
                    .stderr_to(err.clone())
                    .at_index(chunk.index),
            );
            chunk_vcfs.push(vcf);
            chunk_errs.push(err);
        }

        self.pool.run(jobs)?;

        // Recombine in queue order; completion order is meaningless here.
        tracing::info!("merging {} per-chunk call sets", chunk_vcfs.len());
        let merged = ctx.path("variants_merged.vcf");
        let mut concat_args = vec!["concat".to_string()];
        concat_args.extend(chunk_vcfs.iter().map(|p| p.display().to_string()));
        run_checked(
            JobSpec::new(&tools.bcftools, concat_args)
                .stdout_to(merged.clone())
                .stderr_to(ctx.path("bcftools_concat.err")),
        )?;

        let sorted = ctx.path("variants_sorted.vcf");
        run_checked(
            JobSpec::new(
                &tools.bcftools,
                vec!["sort".into(), merged.display().to_string()],
            )
            .stdout_to(sorted.clone())
            .stderr_to(ctx.path("bcftools_sort.err")),
        )?;

        if let Some(common) = &variants.common_variants {
            tracing::info!("restricting calls to {}", common.display());
            let restricted = ctx.path("variants_restricted.vcf");
            run_checked(
                JobSpec::new(
                    &tools.bedtools,
                    vec![
                        "intersect".into(),
                        "-wa".into(),
                        "-a".into(),
                        sorted.display().to_string(),
                        "-b".into(),
                        common.display().to_string(),
                    ],
                )
                .stdout_to(restricted.clone())
                .stderr_to(ctx.path("bedtools_intersect.err")),
            )?;
            std::fs::rename(&restricted, &sorted).with_context(|| {
                format!("failed to replace {} with restricted set", sorted.display())
            })?;
        }

        run_checked(JobSpec::new(
            &tools.bgzip,
            vec!["-f".into(), sorted.display().to_string()],
        ))?;
        let compressed = PathBuf::from(format!("{}.gz", sorted.display()));
        run_checked(JobSpec::new(
            &tools.tabix,
            vec!["-p".into(), "vcf".into(), compressed.display().to_string()],
        ))?;

        let mut intermediates = chunk_vcfs;
        intermediates.append(&mut chunk_errs);
        intermediates.push(merged);
        self.remove_intermediates(&intermediates);

        Ok(vec![compressed])
    }

    /// Count reference- and alternate-supporting reads per barcode and
    /// variant.
    pub(super) fn extract_allele_matrix(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        let variant_set = ctx
            .variant_set
            .as_ref()
            .context("allele extraction requires the variant set")?;
        let ref_matrix = ctx.path("ref.mtx");
        let alt_matrix = ctx.path("alt.mtx");

        run_checked(
            JobSpec::new(
                &self.config.tools.allele_counter,
                vec![
                    "--umi".into(),
                    "--mapq".into(),
                    "30".into(),
                    "-b".into(),
                    ctx.alignment.display().to_string(),
                    "-c".into(),
                    self.config.input.barcodes.display().to_string(),
                    "--scoring-method".into(),
                    "coverage".into(),
                    "--threads".into(),
                    self.config.processing.threads.to_string(),
                    "--ref-matrix".into(),
                    ref_matrix.display().to_string(),
                    "--out-matrix".into(),
                    alt_matrix.display().to_string(),
                    "-v".into(),
                    variant_set.display().to_string(),
                    "--fasta".into(),
                    self.config.reference.fasta.display().to_string(),
                ],
            )
            .stdout_to(ctx.path("alleles.out"))
            .stderr_to(ctx.path("alleles.err")),
        )?;

        Ok(vec![ref_matrix, alt_matrix])
    }

    /// Cluster cells by genotype.
    pub(super) fn cluster(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        let clustering = &self.config.clustering;
        let ref_matrix = ctx.ref_matrix.as_ref().context("missing ref matrix")?;
        let alt_matrix = ctx.alt_matrix.as_ref().context("missing alt matrix")?;
        let assignments = ctx.path("clusters_tmp.tsv");

        let mut args = vec![
            "-k".to_string(),
            clustering.clusters.to_string(),
            "-a".to_string(),
            alt_matrix.display().to_string(),
            "-r".to_string(),
            ref_matrix.display().to_string(),
            "-b".to_string(),
            self.config.input.barcodes.display().to_string(),
            "--restarts".to_string(),
            clustering.restarts.to_string(),
            "--max_loci".to_string(),
            clustering.max_loci.to_string(),
            "--min_ref".to_string(),
            self.config.variants.min_ref.to_string(),
            "--min_alt".to_string(),
            self.config.variants.min_alt.to_string(),
            "--threads".to_string(),
            self.config.processing.threads.to_string(),
        ];
        if self.config.variants.known_genotypes.is_some() {
            let variant_set = ctx
                .variant_set
                .as_ref()
                .context("known-genotype clustering requires the variant set")?;
            args.push("--known_genotypes".to_string());
            args.push(variant_set.display().to_string());
            if let Some(names) = &self.config.variants.known_genotypes_sample_names {
                args.push("--known_genotypes_sample_names".to_string());
                args.extend(names.iter().cloned());
            }
        }

        run_checked(
            JobSpec::new(&self.config.tools.cluster, args)
                .stdout_to(assignments.clone())
                .stderr_to(ctx.path("cluster.err")),
        )?;

        Ok(vec![assignments])
    }

    /// Annotate cluster assignments with doublet/singlet calls.
    pub(super) fn classify_doublets(
        &self,
        ctx: &RunContext,
        clusters: &Path,
    ) -> Result<Vec<PathBuf>> {
        let ref_matrix = ctx.ref_matrix.as_ref().context("missing ref matrix")?;
        let alt_matrix = ctx.alt_matrix.as_ref().context("missing alt matrix")?;
        let assignments = ctx.path("clusters.tsv");

        run_checked(
            JobSpec::new(
                &self.config.tools.doublet_classifier,
                vec![
                    "--alts".into(),
                    alt_matrix.display().to_string(),
                    "--refs".into(),
                    ref_matrix.display().to_string(),
                    "--clusters".into(),
                    clusters.display().to_string(),
                ],
            )
            .stdout_to(assignments.clone())
            .stderr_to(ctx.path("doublets.err")),
        )?;

        Ok(vec![assignments])
    }

    /// Co-infer per-cluster genotypes and the ambient-RNA fraction.
    pub(super) fn consensus(&self, ctx: &RunContext, assignments: &Path) -> Result<Vec<PathBuf>> {
        let ref_matrix = ctx.ref_matrix.as_ref().context("missing ref matrix")?;
        let alt_matrix = ctx.alt_matrix.as_ref().context("missing alt matrix")?;
        let variant_set = ctx
            .variant_set
            .as_ref()
            .context("consensus requires the variant set")?;
        let genotypes = ctx.path("cluster_genotypes.vcf");
        let ambient = ctx.path("ambient_rna.txt");

        run_checked(
            JobSpec::new(
                &self.config.tools.consensus,
                vec![
                    "-c".into(),
                    assignments.display().to_string(),
                    "-a".into(),
                    alt_matrix.display().to_string(),
                    "-r".into(),
                    ref_matrix.display().to_string(),
                    "-p".into(),
                    self.config.clustering.ploidy.to_string(),
                    "--output_dir".into(),
                    ctx.dir.display().to_string(),
                    "--soup_out".into(),
                    ambient.display().to_string(),
                    "--vcf_out".into(),
                    genotypes.display().to_string(),
                    "--vcf".into(),
                    variant_set.display().to_string(),
                ],
            )
            .stderr_to(ctx.path("consensus.err")),
        )?;

        Ok(vec![genotypes, ambient])
    }

    /// Ordered reference sequences, creating the FASTA index if needed.
    fn reference_sequences(&self) -> Result<Vec<SequenceInfo>> {
        let fasta = &self.config.reference.fasta;
        let fai = fai_path(fasta);
        if !fai.is_file() {
            tracing::info!("FASTA index not found, creating");
            run_checked(JobSpec::new(
                &self.config.tools.samtools,
                vec!["faidx".into(), fasta.display().to_string()],
            ))?;
        }
        read_fai(&fai)
    }

    /// Index the input alignment if no index sits next to it.
    fn ensure_alignment_index(&self, alignment: &Path) -> Result<()> {
        let bai = PathBuf::from(format!("{}.bai", alignment.display()));
        if bai.is_file() {
            return Ok(());
        }
        tracing::info!("alignment index not found, creating");
        run_checked(JobSpec::new(
            &self.config.tools.samtools,
            vec!["index".into(), alignment.display().to_string()],
        ))
    }
}

/// Append one `--region name:start-end` pair per interval.
fn push_regions(args: &mut Vec<String>, chunk: &Chunk) {
    for interval in &chunk.intervals {
        args.push("--region".to_string());
        args.push(interval.region_arg());
    }
}

/// `.fai` sits next to the FASTA: `genome.fa` -> `genome.fa.fai`.
fn fai_path(fasta: &Path) -> PathBuf {
    PathBuf::from(format!("{}.fai", fasta.display()))
}

/// Filter a `samtools depth` stream (`sequence<TAB>position<TAB>depth`) to
/// positions with `min_cov <= depth < max_depth`, written as single-position
/// BED records. Returns the number of positions kept.
pub(crate) fn covered_positions<R: BufRead, W: Write>(
    input: R,
    out: &mut W,
    min_cov: u32,
    max_depth: u32,
) -> Result<u64> {
    let mut kept = 0u64;
    for line in input.lines() {
        let line = line.context("failed to read depth stream")?;
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let sequence = fields.next().context("depth record missing sequence")?;
        let position: u64 = fields
            .next()
            .context("depth record missing position")?
            .parse()
            .context("invalid position in depth record")?;
        let depth: u32 = fields
            .next()
            .context("depth record missing depth")?
            .parse()
            .context("invalid depth in depth record")?;
        if depth >= min_cov && depth < max_depth {
            writeln!(out, "{}\t{}\t{}\t{}", sequence, position, position + 1, depth)?;
            kept += 1;
        }
    }
    Ok(kept)
}

/// Copy the `#` header lines of `header_src`, then the whole body file.
/// bedtools emits record lines only, so intersect output needs its header
/// restored before downstream tools will accept it.
pub(crate) fn splice_vcf_header(header_src: &Path, body: &Path, out: &Path) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(out).with_context(|| format!("failed to create {}", out.display()))?,
    );

    let header = File::open(header_src)
        .with_context(|| format!("failed to open {}", header_src.display()))?;
    for line in BufReader::new(header).lines() {
        let line = line?;
        if !line.starts_with('#') {
            break;
        }
        writeln!(writer, "{}", line)?;
    }

    let mut body = File::open(body)
        .with_context(|| format!("failed to open {}", body.display()))?;
    std::io::copy(&mut body, &mut writer)
        .with_context(|| format!("failed to write {}", out.display()))?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fake_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn config_with_tools(dir: &Path, samtools: &str, aligner: &str) -> Config {
        let yaml = format!(
            r#"
input:
  alignment: {dir}/input.bam
  barcodes: {dir}/barcodes.tsv
reference:
  fasta: {dir}/ref.fa
output:
  dir: {dir}
processing:
  threads: 1
  poll_interval_ms: 10
clustering:
  clusters: 2
tools:
  samtools: {samtools}
  aligner: {aligner}
"#,
            dir = dir.display(),
            samtools = samtools,
            aligner = aligner,
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_scan_depth_kills_child_on_malformed_stream() {
        let dir = TempDir::new().unwrap();
        // Emits one malformed depth record, then tries to outlive the call.
        let script = format!(
            "#!/bin/sh\nprintf 'chr1\\tbad\\t42\\n'\nsleep 1\ntouch {}/depth_alive\n",
            dir.path().display()
        );
        let fake = fake_tool(dir.path(), "fake_samtools", &script);
        let config = config_with_tools(dir.path(), &fake.display().to_string(), "unused");
        let pipeline = Pipeline::new(&config);

        let err = pipeline
            .scan_depth(Path::new("unused.bam"), &dir.path().join("depth.bed"))
            .unwrap_err();
        assert!(err.to_string().contains("depth record"), "got: {:#}", err);

        // A killed child never reaches its touch; a leaked one does.
        std::thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("depth_alive").exists());
    }

    #[test]
    fn test_aligner_killed_when_view_fails_to_launch() {
        let dir = TempDir::new().unwrap();
        let script = format!(
            "#!/bin/sh\nsleep 1\ntouch {}/aligner_alive\n",
            dir.path().display()
        );
        let fake = fake_tool(dir.path(), "fake_aligner", &script);
        let config =
            config_with_tools(dir.path(), "scdemux-test-missing", &fake.display().to_string());
        let pipeline = Pipeline::new(&config);

        let err = pipeline
            .run_aligner_pipe(
                &dir.path().join("index.mmi"),
                &[dir.path().join("shard_0.fq")],
                &dir.path().join("out.bam"),
                &dir.path().join("align.err"),
            )
            .unwrap_err();
        assert!(
            err.to_string().contains("scdemux-test-missing"),
            "got: {:#}",
            err
        );

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!dir.path().join("aligner_alive").exists());
    }

    #[test]
    fn test_covered_positions_threshold() {
        // min_ref + min_alt = 8: depth 7 is excluded, 8 kept.
        let depth_table = "chr1\t100\t7\nchr1\t101\t8\nchr1\t102\t35\nchr2\t5\t120000\n";
        let mut out = Vec::new();
        let kept = covered_positions(depth_table.as_bytes(), &mut out, 8, 100_000).unwrap();
        assert_eq!(kept, 2);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "chr1\t101\t102\t8\nchr1\t102\t103\t35\n");
    }

    #[test]
    fn test_covered_positions_excludes_extreme_depth() {
        let depth_table = "chr1\t10\t99999\nchr1\t11\t100000\n";
        let mut out = Vec::new();
        let kept = covered_positions(depth_table.as_bytes(), &mut out, 8, 100_000).unwrap();
        assert_eq!(kept, 1);
        assert!(String::from_utf8(out).unwrap().contains("\t99999\n"));
    }

    #[test]
    fn test_covered_positions_rejects_garbage() {
        let mut out = Vec::new();
        assert!(covered_positions("chr1\tten\t42\n".as_bytes(), &mut out, 8, 100_000).is_err());
    }

    #[test]
    fn test_splice_vcf_header() {
        let dir = TempDir::new().unwrap();
        let supplied = dir.path().join("common.vcf");
        let body = dir.path().join("body.vcf");
        let out = dir.path().join("covered.vcf");

        std::fs::write(
            &supplied,
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\nchr1\t1\t.\tA\tT\n",
        )
        .unwrap();
        std::fs::write(&body, "chr1\t101\t.\tG\tC\nchr2\t7\t.\tT\tA\n").unwrap();

        splice_vcf_header(&supplied, &body, &out).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            text,
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\nchr1\t101\t.\tG\tC\nchr2\t7\t.\tT\tA\n"
        );
    }

    #[test]
    fn test_fai_path() {
        assert_eq!(
            fai_path(Path::new("/refs/genome.fa")),
            PathBuf::from("/refs/genome.fa.fai")
        );
    }

    #[test]
    fn test_push_regions() {
        let chunk = Chunk {
            index: 0,
            intervals: vec![
                crate::planner::Interval::new("chr1", 0, 500),
                crate::planner::Interval::new("chr2", 100, 900),
            ],
        };
        let mut args = Vec::new();
        push_regions(&mut args, &chunk);
        assert_eq!(
            args,
            vec!["--region", "chr1:0-500", "--region", "chr2:100-900"]
        );
    }
}
