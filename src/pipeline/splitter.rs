use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;

use crate::corpus::{pair_lines, read_lines, split_corpus, PairingStats};
use crate::progress::ConsoleProgress;
use crate::tsv::{sha256_file, write_pairs};

use super::config::SplitSettings;

#[derive(Clone, Debug, Serialize)]
pub struct SplitManifest {
    pub seed: u64,
    pub source_file: String,
    pub target_file: String,
    pub columns: [String; 2],
    pub source_lines: usize,
    pub target_lines: usize,
    pub pool_size: usize,
    pub dropped_empty: usize,
    pub dropped_missing: usize,
    pub discarded: usize,
    pub partitions: Vec<PartitionSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PartitionSummary {
    pub role: String,
    pub file: String,
    pub rows: usize,
    pub sha256: String,
}

pub struct CorpusSplitter {
    cfg: SplitSettings,
    progress: ConsoleProgress,
}

impl CorpusSplitter {
    pub fn new(cfg: SplitSettings, progress: ConsoleProgress) -> Self {
        Self { cfg, progress }
    }

    pub fn run(&self) -> anyhow::Result<SplitManifest> {
        let cfg = &self.cfg;
        self.progress.info(format!(
            "Read corpus: {} + {}",
            cfg.source_file.display(),
            cfg.target_file.display()
        ));
        let source = read_lines(&cfg.source_file)?;
        let target = read_lines(&cfg.target_file)?;

        let (pool, stats) = pair_lines(source, target, cfg.allow_unaligned)
            .with_context(|| {
                format!(
                    "pair {} with {}",
                    cfg.source_file.display(),
                    cfg.target_file.display()
                )
            })?;
        self.log_pairing(&stats);

        let plan = cfg.plan;
        self.progress.info(format!(
            "Split: train={} valid={} test={} seed={}",
            plan.train_size, plan.valid_size, plan.test_size, plan.seed
        ));
        let partitions = split_corpus(&pool, &plan)?;
        let written: usize = partitions.iter().map(|p| p.records.len()).sum();
        let discarded = pool.len() - written;
        if discarded > 0 {
            self.progress
                .info(format!("Unused records (not written): {discarded}"));
        }

        std::fs::create_dir_all(&cfg.output_dir)
            .with_context(|| format!("create output dir: {}", cfg.output_dir.display()))?;
        let header = [cfg.source_lang.as_str(), cfg.target_lang.as_str()];
        let mut summaries = Vec::with_capacity(partitions.len());
        for part in &partitions {
            let path = cfg.output_dir.join(part.role.file_name());
            write_pairs(&path, header, &part.records)
                .with_context(|| format!("write {} partition", part.role))?;
            let sha256 = sha256_file(&path)?;
            self.progress.info(format!(
                "Wrote {}: {} rows sha256={}",
                path.display(),
                part.records.len(),
                &sha256[..12]
            ));
            summaries.push(PartitionSummary {
                role: part.role.name().to_string(),
                file: path.display().to_string(),
                rows: part.records.len(),
                sha256,
            });
        }

        let manifest = SplitManifest {
            seed: plan.seed,
            source_file: cfg.source_file.display().to_string(),
            target_file: cfg.target_file.display().to_string(),
            columns: [cfg.source_lang.clone(), cfg.target_lang.clone()],
            source_lines: stats.source_lines,
            target_lines: stats.target_lines,
            pool_size: pool.len(),
            dropped_empty: stats.dropped_empty,
            dropped_missing: stats.dropped_missing,
            discarded,
            partitions: summaries,
        };
        if let Some(path) = self.manifest_path() {
            let text = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
            std::fs::write(&path, text + "\n")
                .with_context(|| format!("write manifest: {}", path.display()))?;
            self.progress.info(format!("Wrote {}", path.display()));
        }
        Ok(manifest)
    }

    fn manifest_path(&self) -> Option<PathBuf> {
        self.cfg
            .manifest
            .as_ref()
            .map(|name| self.cfg.output_dir.join(name))
    }

    fn log_pairing(&self, stats: &PairingStats) {
        self.progress.info(format!(
            "Lines: {} source, {} target; kept {} pairs",
            stats.source_lines, stats.target_lines, stats.kept
        ));
        if stats.dropped_empty > 0 {
            self.progress
                .info(format!("Dropped (empty side): {}", stats.dropped_empty));
        }
        if stats.dropped_missing > 0 {
            self.progress.warn(format!(
                "Dropped (missing line, unaligned input): {}",
                stats.dropped_missing
            ));
        }
    }
}
