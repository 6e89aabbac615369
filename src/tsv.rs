//! Tab-separated files with a header row.
//!
//! Quoting is minimal: a field is quoted only when it holds a tab, a quote or a line
//! break, so ordinary sentences round-trip byte-for-byte and embedded delimiters
//! survive instead of shifting columns.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};

use crate::corpus::SentencePair;

fn writer_builder() -> csv::WriterBuilder {
    let mut b = csv::WriterBuilder::new();
    b.delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .quote_style(csv::QuoteStyle::Necessary);
    b
}

fn reader_builder() -> csv::ReaderBuilder {
    let mut b = csv::ReaderBuilder::new();
    b.delimiter(b'\t').has_headers(true).flexible(false);
    b
}

/// Writes a two-column partition file.
pub fn write_pairs(path: &Path, header: [&str; 2], records: &[SentencePair]) -> anyhow::Result<()> {
    let mut w = writer_builder()
        .from_path(path)
        .with_context(|| format!("create tsv: {}", path.display()))?;
    w.write_record(header)
        .with_context(|| format!("write header: {}", path.display()))?;
    for r in records {
        w.write_record([r.source_text.as_str(), r.target_text.as_str()])
            .with_context(|| format!("write row: {}", path.display()))?;
    }
    w.flush().with_context(|| format!("flush tsv: {}", path.display()))?;
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TsvTable {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let mut r = reader_builder()
            .from_path(path)
            .with_context(|| format!("open tsv: {}", path.display()))?;
        let headers: Vec<String> = r
            .headers()
            .with_context(|| format!("read header: {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for (idx, rec) in r.records().enumerate() {
            let rec = rec.with_context(|| format!("read row {}: {}", idx + 1, path.display()))?;
            rows.push(rec.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let idx = self.column_index(name).ok_or_else(|| {
            anyhow!(
                "column not found: {name} (have: {})",
                self.headers.join(", ")
            )
        })?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Appends `name`, or overwrites it in place when the column already exists.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) -> anyhow::Result<()> {
        if values.len() != self.rows.len() {
            return Err(anyhow!(
                "column {name}: {} values for {} rows",
                values.len(),
                self.rows.len()
            ));
        }
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.headers.push(name.to_string());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let mut w = writer_builder()
            .from_path(path)
            .with_context(|| format!("create tsv: {}", path.display()))?;
        w.write_record(&self.headers)
            .with_context(|| format!("write header: {}", path.display()))?;
        for row in &self.rows {
            w.write_record(row)
                .with_context(|| format!("write row: {}", path.display()))?;
        }
        w.flush().with_context(|| format!("flush tsv: {}", path.display()))?;
        Ok(())
    }

    /// Writes next to `path` and renames over it, so readers never see a half-written file.
    pub fn write_replacing(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = sibling_tmp_path(path);
        if let Err(err) = self.write(&tmp) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(anyhow!(err)
                .context(format!("replace {} with {}", path.display(), tmp.display())));
        }
        Ok(())
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("table.tsv");
    path.with_file_name(format!(".{name}.tmp"))
}

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = std::fs::File::open(path).with_context(|| format!("open: {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher).with_context(|| format!("hash: {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
