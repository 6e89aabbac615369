mod config;
pub mod prompts;
mod splitter;
mod translator;

pub use config::{
    init_default_config, SplitOverrides, SplitSettings, TranslateOverrides, TranslateSettings,
};
pub use splitter::{CorpusSplitter, PartitionSummary, SplitManifest};
pub use translator::{BatchTranslator, TranslateReport};
