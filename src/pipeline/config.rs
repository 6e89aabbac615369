use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::{
    locate_and_load, resolve_backend, AppConfig, ResolvedBackend, DEFAULT_CONFIG_FILENAME,
};
use crate::corpus::{PartitionRole, SplitPlan};
use crate::pipeline::prompts::{
    load_prompt, DEFAULT_PROMPTS_DIR, DEFAULT_TRANSLATE_PROMPT, DEFAULT_TRANSLATE_PROMPT_TEXT,
};
use crate::translate::DecodeOptions;

pub const DEFAULT_SOURCE_FILE: &str = "europarl-v7.da-en.en";
pub const DEFAULT_TARGET_FILE: &str = "europarl-v7.da-en.da";
pub const DEFAULT_MANIFEST: &str = "split-manifest.json";
pub const DEFAULT_BACKEND: &str = "mt_da_en";
pub const DEFAULT_BACKEND_CTX: u32 = 1024;

/// Relative paths in the config file are taken from the config file's directory.
fn anchor(config_path: &Path, p: PathBuf) -> PathBuf {
    if p.is_relative() {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(p)
    } else {
        p
    }
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Clone, Debug, Default)]
pub struct SplitOverrides {
    pub source_file: Option<PathBuf>,
    pub target_file: Option<PathBuf>,
    pub seed: Option<u64>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct SplitSettings {
    pub source_file: PathBuf,
    pub source_lang: String,
    pub target_file: PathBuf,
    pub target_lang: String,
    pub plan: SplitPlan,
    pub output_dir: PathBuf,
    /// `None` skips writing the manifest.
    pub manifest: Option<String>,
    pub allow_unaligned: bool,
}

impl SplitSettings {
    pub fn load(config: Option<PathBuf>, overrides: SplitOverrides) -> anyhow::Result<Self> {
        let (file_cfg, cfg_path) = locate_and_load(config)?;
        Self::resolve(&file_cfg, &cfg_path, overrides)
    }

    pub fn resolve(
        file_cfg: &AppConfig,
        config_path: &Path,
        overrides: SplitOverrides,
    ) -> anyhow::Result<Self> {
        let s = &file_cfg.split;
        let defaults = SplitPlan::default();
        let plan = SplitPlan {
            train_size: s.train_size.unwrap_or(defaults.train_size),
            valid_size: s.valid_size.unwrap_or(defaults.valid_size),
            test_size: s.test_size.unwrap_or(defaults.test_size),
            seed: overrides.seed.or(s.seed).unwrap_or(defaults.seed),
        };
        if plan.train_size == 0 || plan.valid_size == 0 || plan.test_size == 0 {
            return Err(anyhow!(
                "partition sizes must be positive (train={}, valid={}, test={})",
                plan.train_size,
                plan.valid_size,
                plan.test_size
            ));
        }
        if plan.total().is_none() {
            return Err(anyhow!(
                "partition sizes too large (train={}, valid={}, test={})",
                plan.train_size,
                plan.valid_size,
                plan.test_size
            ));
        }

        let source_file = overrides.source_file.unwrap_or_else(|| {
            anchor(
                config_path,
                s.source_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_FILE)),
            )
        });
        let target_file = overrides.target_file.unwrap_or_else(|| {
            anchor(
                config_path,
                s.target_file
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_TARGET_FILE)),
            )
        });
        let output_dir = overrides.output_dir.unwrap_or_else(|| {
            anchor(
                config_path,
                s.output_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            )
        });

        let source_lang = non_empty(s.source_lang.as_ref()).unwrap_or_else(|| "en".to_string());
        let target_lang = non_empty(s.target_lang.as_ref()).unwrap_or_else(|| "da".to_string());
        if source_lang == target_lang {
            return Err(anyhow!("source_lang and target_lang are both {source_lang}"));
        }

        let manifest = match s.manifest.as_deref().map(str::trim) {
            Some("") => None,
            Some(name) => Some(name.to_string()),
            None => Some(DEFAULT_MANIFEST.to_string()),
        };

        Ok(Self {
            source_file,
            source_lang,
            target_file,
            target_lang,
            plan,
            output_dir,
            manifest,
            allow_unaligned: s.allow_unaligned.unwrap_or(false),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct TranslateOverrides {
    pub files: Vec<PathBuf>,
    pub backend: Option<String>,
    pub model: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub num_beams: Option<usize>,
    pub threads: Option<i32>,
    pub gpu_layers: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct TranslateSettings {
    pub config_path: PathBuf,
    pub files: Vec<PathBuf>,
    pub source_column: String,
    pub output_column: String,
    pub source_lang: String,
    pub target_lang: String,
    pub decode: DecodeOptions,
    pub keep_going: bool,
    pub prompt: String,

    pub backend_name: String,
    pub model_override: Option<PathBuf>,
    pub threads: i32,
    pub gpu_layers: i32,

    file_cfg: AppConfig,
}

impl TranslateSettings {
    pub fn load(config: Option<PathBuf>, overrides: TranslateOverrides) -> anyhow::Result<Self> {
        let (file_cfg, cfg_path) = locate_and_load(config)?;
        Self::resolve(file_cfg, cfg_path, overrides)
    }

    pub fn resolve(
        file_cfg: AppConfig,
        config_path: PathBuf,
        overrides: TranslateOverrides,
    ) -> anyhow::Result<Self> {
        let t = &file_cfg.translate;

        let files = if !overrides.files.is_empty() {
            overrides.files
        } else if let Some(list) = t.files.clone().filter(|l| !l.is_empty()) {
            list.into_iter().map(|p| anchor(&config_path, p)).collect()
        } else {
            let out_dir = anchor(
                &config_path,
                file_cfg
                    .split
                    .output_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".")),
            );
            PartitionRole::ALL
                .iter()
                .map(|r| out_dir.join(r.file_name()))
                .collect()
        };

        let defaults = DecodeOptions::default();
        let decode = DecodeOptions {
            batch_size: overrides
                .batch_size
                .or(t.batch_size)
                .unwrap_or(defaults.batch_size),
            num_beams: overrides
                .num_beams
                .or(t.num_beams)
                .unwrap_or(defaults.num_beams),
            truncation: t.truncation.unwrap_or(defaults.truncation),
            max_input_tokens: t.max_input_tokens.unwrap_or(defaults.max_input_tokens),
            max_new_tokens: t.max_new_tokens.unwrap_or(defaults.max_new_tokens),
            length_penalty: t.length_penalty.unwrap_or(defaults.length_penalty),
        };
        if decode.batch_size == 0 || decode.num_beams == 0 {
            return Err(anyhow!(
                "batch_size and num_beams must be positive (batch_size={}, num_beams={})",
                decode.batch_size,
                decode.num_beams
            ));
        }
        if decode.max_input_tokens == 0 || decode.max_new_tokens == 0 {
            return Err(anyhow!("max_input_tokens and max_new_tokens must be positive"));
        }

        let source_column = non_empty(t.source_column.as_ref())
            .or_else(|| non_empty(file_cfg.split.target_lang.as_ref()))
            .unwrap_or_else(|| "da".to_string());
        let target_code =
            non_empty(file_cfg.split.source_lang.as_ref()).unwrap_or_else(|| "en".to_string());
        let source_lang = non_empty(t.source_lang.as_ref())
            .unwrap_or_else(|| language_name(&source_column).to_string());
        let target_lang = non_empty(t.target_lang.as_ref())
            .unwrap_or_else(|| language_name(&target_code).to_string());
        let output_column = non_empty(t.output_column.as_ref())
            .unwrap_or_else(|| format!("{target_code}_mt"));
        if output_column == source_column {
            return Err(anyhow!(
                "output_column {output_column} would overwrite the source column"
            ));
        }

        let prompt = load_prompt(&config_path, t.prompt.as_deref()).context("load prompt")?;
        let backend_name = overrides
            .backend
            .or_else(|| non_empty(t.backend.as_ref()))
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let keep_going = t.keep_going.unwrap_or(false);
        let threads = overrides.threads.or(t.threads).unwrap_or(-1);
        let gpu_layers = overrides.gpu_layers.or(t.gpu_layers).unwrap_or(-1);

        Ok(Self {
            files,
            source_column,
            output_column,
            source_lang,
            target_lang,
            decode,
            keep_going,
            prompt,
            backend_name,
            model_override: overrides.model,
            threads,
            gpu_layers,
            config_path,
            file_cfg,
        })
    }

    /// Locates the model file. Only needed once a real engine is about to load.
    pub fn resolve_backend(&self) -> anyhow::Result<ResolvedBackend> {
        if let Some(p) = self.model_override.clone() {
            if !p.exists() {
                return Err(anyhow!("model not found: {}", p.display()));
            }
            return Ok(ResolvedBackend::from_model_path(
                &self.backend_name,
                p,
                DEFAULT_BACKEND_CTX,
            ));
        }
        resolve_backend(
            &self.file_cfg,
            &self.config_path,
            &self.backend_name,
            DEFAULT_BACKEND_CTX,
        )
    }
}

/// English name for a column code, as the prompt wants it. Unknown codes pass through.
pub fn language_name(code: &str) -> &str {
    match code.to_ascii_lowercase().as_str() {
        "bg" => "Bulgarian",
        "cs" => "Czech",
        "da" => "Danish",
        "de" => "German",
        "el" => "Greek",
        "en" => "English",
        "es" => "Spanish",
        "et" => "Estonian",
        "fi" => "Finnish",
        "fr" => "French",
        "hu" => "Hungarian",
        "it" => "Italian",
        "lt" => "Lithuanian",
        "lv" => "Latvian",
        "nl" => "Dutch",
        "pl" => "Polish",
        "pt" => "Portuguese",
        "ro" => "Romanian",
        "sk" => "Slovak",
        "sl" => "Slovenian",
        "sv" => "Swedish",
        _ => code,
    }
}

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(DEFAULT_CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;
    let prompt_path = prompts_dir.join(DEFAULT_TRANSLATE_PROMPT);
    if !prompt_path.exists() || force {
        std::fs::write(&prompt_path, DEFAULT_TRANSLATE_PROMPT_TEXT)
            .with_context(|| format!("write prompt: {}", prompt_path.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_CONFIG_TOML: &str = r#"[split]
source_file = "europarl-v7.da-en.en"
source_lang = "en"
target_file = "europarl-v7.da-en.da"
target_lang = "da"

train_size = 25000
valid_size = 5000
test_size = 5000
seed = 1234

output_dir = "."
manifest = "split-manifest.json"
# Drop lines present in only one file instead of failing.
allow_unaligned = false

[translate]
files = ["train.tsv", "valid.tsv", "test.tsv"]
source_column = "da"
output_column = "en_mt"
# Language names as they appear in the prompt (not column codes).
source_lang = "Danish"
target_lang = "English"

backend = "mt_da_en"
prompt = "prompts/translate.txt"

batch_size = 32
num_beams = 4
truncation = true
max_input_tokens = 512
max_new_tokens = 256
length_penalty = 1.0

threads = -1
gpu_layers = -1
keep_going = false

[models]
model_dir = "."

[models.backends.mt_da_en]
path = "HY-MT1.5-1.8B-Q8_0.gguf"
template_hint = "hunyuan-dense"
ctx_size = 1024
gpu_layers = -1
batch_size = 512
offload_kqv = true
"#;
