use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "corpus-mt-prep.toml";
pub const CONFIG_ENV_VAR: &str = "CORPUS_MT_PREP_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub split: SplitSection,
    #[serde(default)]
    pub translate: TranslateSection,
    #[serde(default)]
    pub models: ModelsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct SplitSection {
    /// First column of every partition file (one sentence per line).
    #[serde(default)]
    pub source_file: Option<PathBuf>,
    #[serde(default)]
    pub source_lang: Option<String>,
    /// Second column, line-aligned with `source_file`.
    #[serde(default)]
    pub target_file: Option<PathBuf>,
    #[serde(default)]
    pub target_lang: Option<String>,

    #[serde(default)]
    pub train_size: Option<usize>,
    #[serde(default)]
    pub valid_size: Option<usize>,
    #[serde(default)]
    pub test_size: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub manifest: Option<String>,

    /// Drop positions present in only one input instead of failing.
    #[serde(default)]
    pub allow_unaligned: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TranslateSection {
    #[serde(default)]
    pub files: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub source_column: Option<String>,
    #[serde(default)]
    pub output_column: Option<String>,
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub target_lang: Option<String>,

    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub num_beams: Option<usize>,
    #[serde(default)]
    pub truncation: Option<bool>,
    #[serde(default)]
    pub max_input_tokens: Option<usize>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub length_penalty: Option<f32>,

    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,

    /// Continue with the next file after a failure; the run still fails at the end.
    #[serde(default)]
    pub keep_going: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ModelsSection {
    #[serde(default)]
    pub backends: HashMap<String, ModelBackend>,

    /// Preferred directory to locate model files when backend paths are relative.
    /// Can be absolute or relative to the config file directory.
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ModelBackend {
    pub path: PathBuf,
    #[serde(default)]
    pub template_hint: Option<String>,
    #[serde(default)]
    pub ctx_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default)]
    pub gpu_layers: Option<i32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub offload_kqv: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct ResolvedBackend {
    pub name: String,
    pub model_path: PathBuf,
    pub template_hint: Option<String>,
    pub ctx_size: u32,
    pub threads: Option<i32>,
    pub gpu_layers: Option<i32>,
    pub batch_size: Option<u32>,
    pub offload_kqv: Option<bool>,
}

impl ResolvedBackend {
    /// Backend pointing straight at a model file, bypassing the config table.
    pub fn from_model_path(name: &str, model_path: PathBuf, ctx_size: u32) -> Self {
        Self {
            name: name.to_string(),
            model_path,
            template_hint: None,
            ctx_size,
            threads: None,
            gpu_layers: None,
            batch_size: None,
            offload_kqv: None,
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text).with_context(|| format!("parse config toml: {}", path.display()))
}

pub fn parse_config(text: &str) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(text)?;
    Ok(cfg)
}

/// Explicit path, then `$CORPUS_MT_PREP_CONFIG`, then an upward search. Returns the
/// parsed file (or defaults when none exists) and the path relative values resolve against.
pub fn locate_and_load(explicit: Option<PathBuf>) -> anyhow::Result<(AppConfig, PathBuf)> {
    let cfg_file = explicit
        .clone()
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
        .or_else(|| find_default_config(DEFAULT_CONFIG_FILENAME));

    if let Some(p) = explicit.as_ref() {
        if !p.exists() {
            return Err(anyhow!("config not found: {}", p.display()));
        }
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match cfg_file {
        Some(p) if p.exists() => {
            let cfg = load_config(&p)?;
            Ok((cfg, p))
        }
        _ => Ok((AppConfig::default(), cwd.join(DEFAULT_CONFIG_FILENAME))),
    }
}

pub fn resolve_backend(
    cfg: &AppConfig,
    config_path: &Path,
    name: &str,
    default_ctx: u32,
) -> anyhow::Result<ResolvedBackend> {
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let mut search_dirs: Vec<PathBuf> = Vec::new();
    if let Some(md) = cfg.models.model_dir.as_ref() {
        let mut p = md.clone();
        if p.is_relative() {
            p = config_dir.join(&p);
        }
        search_dirs.push(p);
    }
    if let Ok(cwd) = std::env::current_dir() {
        search_dirs.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            search_dirs.push(dir.to_path_buf());
        }
    }
    search_dirs.push(config_dir.to_path_buf());

    let mut seen_dirs: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
    search_dirs.retain(|d| d.is_dir() && seen_dirs.insert(d.clone()));

    let b = cfg
        .models
        .backends
        .get(name)
        .ok_or_else(|| anyhow!("backend not configured: {} (config={})", name, config_path.display()))?;

    let mut path = b.path.clone();
    if path.is_relative() {
        path = search_dirs
            .iter()
            .map(|dir| dir.join(&b.path))
            .find(|cand| cand.exists())
            .ok_or_else(|| {
                anyhow!(
                    "backend {} model not found: {} (searched: {}) (config={})",
                    name,
                    b.path.display(),
                    search_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                    config_path.display()
                )
            })?;
    } else if !path.exists() {
        return Err(anyhow!(
            "backend {} model not found: {} (config={})",
            name,
            path.display(),
            config_path.display()
        ));
    }

    let template_hint = b
        .template_hint
        .as_deref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(ResolvedBackend {
        name: name.to_string(),
        model_path: path,
        template_hint,
        ctx_size: b.ctx_size.unwrap_or(default_ctx),
        threads: b.threads,
        gpu_layers: b.gpu_layers,
        batch_size: b.batch_size,
        offload_kqv: b.offload_kqv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_sections() {
        let cfg = parse_config(
            r#"
[split]
seed = 7
train_size = 10

[translate]
num_beams = 2
files = ["a.tsv", "b.tsv"]

[models.backends.opus]
path = "opus.gguf"
ctx_size = 1024
"#,
        )
        .expect("parse");
        assert_eq!(cfg.split.seed, Some(7));
        assert_eq!(cfg.split.train_size, Some(10));
        assert_eq!(cfg.split.valid_size, None);
        assert_eq!(cfg.translate.num_beams, Some(2));
        assert_eq!(cfg.translate.files.as_ref().map(Vec::len), Some(2));
        assert_eq!(cfg.models.backends["opus"].ctx_size, Some(1024));
    }

    #[test]
    fn rejects_unknown_value_types() {
        assert!(parse_config("[split]\nseed = \"abc\"\n").is_err());
    }

    #[test]
    fn resolves_relative_backend_against_model_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).expect("mkdir");
        std::fs::write(models.join("m.gguf"), b"gguf").expect("write model");
        let cfg = parse_config(
            "[models]\nmodel_dir = \"models\"\n[models.backends.m]\npath = \"m.gguf\"\n",
        )
        .expect("parse");
        let cfg_path = dir.path().join(DEFAULT_CONFIG_FILENAME);

        let b = resolve_backend(&cfg, &cfg_path, "m", 512).expect("resolve");
        assert_eq!(b.model_path, models.join("m.gguf"));
        assert_eq!(b.ctx_size, 512);

        let err = resolve_backend(&cfg, &cfg_path, "missing", 512).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn finds_file_in_parent_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("x.toml"), "").expect("write");
        assert_eq!(
            find_file_upwards(&nested, "x.toml", 4),
            Some(dir.path().join("x.toml"))
        );
        assert_eq!(find_file_upwards(&nested, "x.toml", 1), None);
    }
}
