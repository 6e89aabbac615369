use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::progress::ConsoleProgress;
use crate::textutil::preview;
use crate::translate::{translate_all, TranslationEngine};
use crate::tsv::TsvTable;

use super::config::TranslateSettings;

#[cfg(feature = "native")]
use crate::models::native::{NativeModelConfig, NativeTranslator};
#[cfg(feature = "native")]
use llama_cpp_2::llama_backend::LlamaBackend;
#[cfg(feature = "native")]
use once_cell::sync::OnceCell;

#[cfg(feature = "native")]
static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

#[derive(Clone, Debug, Default)]
pub struct TranslateReport {
    pub done: Vec<(PathBuf, usize)>,
    pub failed: Vec<(PathBuf, String)>,
}

pub struct BatchTranslator {
    cfg: TranslateSettings,
    progress: ConsoleProgress,
}

impl BatchTranslator {
    pub fn new(cfg: TranslateSettings, progress: ConsoleProgress) -> Self {
        Self { cfg, progress }
    }

    /// Loads the configured model once and translates every configured file.
    #[cfg(feature = "native")]
    pub fn run(&self) -> anyhow::Result<TranslateReport> {
        let mut engine = self.load_engine()?;
        self.run_with(&mut engine)
    }

    #[cfg(feature = "native")]
    fn load_engine(&self) -> anyhow::Result<NativeTranslator> {
        let backend = self.cfg.resolve_backend()?;
        self.progress.info(format!(
            "Load model: {} ({})",
            backend.name,
            backend.model_path.display()
        ));
        let llama = LLAMA_BACKEND
            .get_or_try_init(LlamaBackend::init)
            .context("init llama backend")?;
        NativeTranslator::load(
            llama,
            NativeModelConfig {
                name: backend.name.clone(),
                model_path: backend.model_path.clone(),
                template_hint: backend.template_hint.clone(),
                ctx_size: backend.ctx_size,
                threads: backend.threads.unwrap_or(self.cfg.threads),
                gpu_layers: backend.gpu_layers.unwrap_or(self.cfg.gpu_layers),
                batch_size: backend.batch_size,
                offload_kqv: backend.offload_kqv,
                max_beams: self.cfg.decode.num_beams,
                prompt: self.cfg.prompt.clone(),
                source_lang: self.cfg.source_lang.clone(),
                target_lang: self.cfg.target_lang.clone(),
            },
        )
    }

    /// Files are processed in order. The first failure aborts unless `keep_going` is set.
    pub fn run_with<E: TranslationEngine + ?Sized>(
        &self,
        engine: &mut E,
    ) -> anyhow::Result<TranslateReport> {
        let d = &self.cfg.decode;
        self.progress.info(format!(
            "Translate {} -> {} with {} (batch_size={} num_beams={} truncation={})",
            self.cfg.source_lang,
            self.cfg.target_lang,
            engine.name(),
            d.batch_size,
            d.num_beams,
            d.truncation
        ));

        let mut report = TranslateReport::default();
        for path in &self.cfg.files {
            match self.translate_file(engine, path) {
                Ok(rows) => report.done.push((path.clone(), rows)),
                Err(err) if self.cfg.keep_going => {
                    self.progress
                        .warn(format!("{} failed: {err:#}", path.display()));
                    report.failed.push((path.clone(), format!("{err:#}")));
                }
                Err(err) => return Err(err),
            }
        }

        if !report.failed.is_empty() {
            return Err(anyhow!(
                "{} of {} files failed: {}",
                report.failed.len(),
                self.cfg.files.len(),
                report
                    .failed
                    .iter()
                    .map(|(p, _)| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        Ok(report)
    }

    /// Adds the translation column to one partition file, rewriting it in place.
    pub fn translate_file<E: TranslationEngine + ?Sized>(
        &self,
        engine: &mut E,
        path: &Path,
    ) -> anyhow::Result<usize> {
        self.progress.info(format!("Read: {}", path.display()));
        let mut table = TsvTable::read(path)?;
        let sources = table
            .column(&self.cfg.source_column)
            .with_context(|| format!("source column in {}", path.display()))?;

        let label = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("translate")
            .to_string();
        let translations = translate_all(engine, &sources, &self.cfg.decode, &self.progress, &label)
            .with_context(|| format!("translate {}", path.display()))?;
        if let (Some(src), Some(mt)) = (sources.first(), translations.first()) {
            self.progress
                .info(format!("  {} => {}", preview(src, 60), preview(mt, 60)));
        }

        let rows = table.len();
        table.set_column(&self.cfg.output_column, translations)?;
        table.write_replacing(path)?;
        self.progress.info(format!(
            "Wrote {}: {rows} rows (+{})",
            path.display(),
            self.cfg.output_column
        ));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::corpus::SentencePair;
    use crate::pipeline::config::TranslateOverrides;
    use crate::translate::testing::FakeEngine;
    use crate::tsv::write_pairs;

    fn settings(dir: &Path, files: &[&str], keep_going: bool, batch_size: usize) -> TranslateSettings {
        let mut cfg = TranslateSettings::resolve(
            AppConfig::default(),
            dir.join("corpus-mt-prep.toml"),
            TranslateOverrides {
                files: files.iter().map(|f| dir.join(f)).collect(),
                batch_size: Some(batch_size),
                ..TranslateOverrides::default()
            },
        )
        .expect("settings");
        cfg.keep_going = keep_going;
        cfg
    }

    fn write_partition(dir: &Path, name: &str, rows: &[(&str, &str)]) {
        let records: Vec<SentencePair> = rows.iter().map(|(en, da)| SentencePair::new(*en, *da)).collect();
        write_pairs(&dir.join(name), ["en", "da"], &records).expect("write partition");
    }

    #[test]
    fn appends_translations_in_row_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_partition(
            dir.path(),
            "valid.tsv",
            &[("good day", "god dag"), ("thanks", "tak"), ("the house", "huset")],
        );
        let cfg = settings(dir.path(), &["valid.tsv"], false, 2);
        let mut engine = FakeEngine::default();
        let report = BatchTranslator::new(cfg, ConsoleProgress::quiet())
            .run_with(&mut engine)
            .expect("translate");

        assert_eq!(report.done, vec![(dir.path().join("valid.tsv"), 3)]);
        assert_eq!(engine.batches, vec![2, 1]);
        let text = std::fs::read_to_string(dir.path().join("valid.tsv")).expect("read");
        assert_eq!(
            text,
            "en\tda\ten_mt\ngood day\tgod dag\tdog gad\nthanks\ttak\tkat\nthe house\thuset\ttesuh\n"
        );
    }

    #[test]
    fn rerun_replaces_the_translation_column() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_partition(dir.path(), "test.tsv", &[("yes", "ja")]);
        let translator = BatchTranslator::new(
            settings(dir.path(), &["test.tsv"], false, 32),
            ConsoleProgress::quiet(),
        );
        translator.run_with(&mut FakeEngine::default()).expect("first");
        translator.run_with(&mut FakeEngine::default()).expect("second");
        let table = TsvTable::read(&dir.path().join("test.tsv")).expect("read");
        assert_eq!(table.headers, vec!["en", "da", "en_mt"]);
        assert_eq!(table.rows, vec![vec!["yes", "ja", "aj"]]);
    }

    #[test]
    fn over_length_row_is_truncated_not_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let long = "ord ".repeat(400);
        write_partition(dir.path(), "train.tsv", &[("words", long.trim())]);
        let mut engine = FakeEngine {
            max_input_chars: Some(16),
            ..FakeEngine::default()
        };
        BatchTranslator::new(
            settings(dir.path(), &["train.tsv"], false, 32),
            ConsoleProgress::quiet(),
        )
        .run_with(&mut engine)
        .expect("translate");
        let table = TsvTable::read(&dir.path().join("train.tsv")).expect("read");
        assert_eq!(table.len(), 1);
        assert_eq!(table.column("en_mt").expect("col"), vec!["dro dro dro dro"]);
    }

    #[test]
    fn failure_aborts_and_leaves_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_partition(dir.path(), "train.tsv", &[("a", "boom")]);
        write_partition(dir.path(), "valid.tsv", &[("b", "fint")]);
        let before = std::fs::read(dir.path().join("train.tsv")).expect("read");

        let mut engine = FakeEngine {
            fail_on: Some("boom".into()),
            ..FakeEngine::default()
        };
        let err = BatchTranslator::new(
            settings(dir.path(), &["train.tsv", "valid.tsv"], false, 32),
            ConsoleProgress::quiet(),
        )
        .run_with(&mut engine)
        .unwrap_err();
        assert!(format!("{err:#}").contains("out of memory"), "{err:#}");
        assert_eq!(std::fs::read(dir.path().join("train.tsv")).expect("read"), before);
        let valid = TsvTable::read(&dir.path().join("valid.tsv")).expect("read");
        assert_eq!(valid.headers, vec!["en", "da"]);
    }

    #[test]
    fn keep_going_finishes_the_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_partition(dir.path(), "valid.tsv", &[("b", "fint")]);
        let mut engine = FakeEngine::default();
        let err = BatchTranslator::new(
            settings(dir.path(), &["missing.tsv", "valid.tsv"], true, 32),
            ConsoleProgress::quiet(),
        )
        .run_with(&mut engine)
        .unwrap_err();
        assert!(err.to_string().contains("1 of 2 files failed"), "{err}");
        let valid = TsvTable::read(&dir.path().join("valid.tsv")).expect("read");
        assert_eq!(valid.column("en_mt").expect("col"), vec!["tnif"]);
    }

    #[test]
    fn missing_source_column_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("x.tsv"), "en\tde\nhi\thallo\n").expect("write");
        let err = BatchTranslator::new(
            settings(dir.path(), &["x.tsv"], false, 32),
            ConsoleProgress::quiet(),
        )
        .run_with(&mut FakeEngine::default())
        .unwrap_err();
        assert!(format!("{err:#}").contains("column not found: da"), "{err:#}");
    }
}
