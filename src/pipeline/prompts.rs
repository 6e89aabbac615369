use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";
pub const DEFAULT_TRANSLATE_PROMPT: &str = "translate.txt";

pub const DEFAULT_TRANSLATE_PROMPT_TEXT: &str = r#"Translate the following {{source_lang}} sentence into {{target_lang}}.
Output ONLY the translation, on a single line, with no notes or quotes.

{{text}}"#;

/// Loads the prompt named in config, or the built-in one when none is configured.
pub fn load_prompt(config_path: &Path, configured: Option<&str>) -> anyhow::Result<String> {
    let Some(rel) = configured.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(DEFAULT_TRANSLATE_PROMPT_TEXT.to_string());
    };
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut p = PathBuf::from(rel);
    if p.is_relative() {
        p = config_dir.join(&p);
    }
    if !p.exists() {
        return Err(anyhow!(
            "prompt file not found: {} (run: corpus-mt-prep --init-config)",
            p.display()
        ));
    }
    let text = std::fs::read_to_string(&p).with_context(|| format!("read prompt: {}", p.display()))?;
    if !text.contains("{{text}}") {
        return Err(anyhow!("prompt {} has no {{{{text}}}} placeholder", p.display()));
    }
    Ok(text)
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders() {
        let out = render_template(
            DEFAULT_TRANSLATE_PROMPT_TEXT,
            &[("source_lang", "da"), ("target_lang", "en"), ("text", "Tak.")],
        );
        assert!(out.starts_with("Translate the following da sentence into en."));
        assert!(out.ends_with("Tak."));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn loads_configured_prompt_relative_to_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = dir.path().join("corpus-mt-prep.toml");
        std::fs::create_dir_all(dir.path().join("prompts")).expect("mkdir");
        std::fs::write(dir.path().join("prompts/p.txt"), "{{source_lang}}: {{text}}").expect("write");

        assert_eq!(
            load_prompt(&cfg, Some("prompts/p.txt")).expect("load"),
            "{{source_lang}}: {{text}}"
        );
        assert_eq!(
            load_prompt(&cfg, None).expect("default"),
            DEFAULT_TRANSLATE_PROMPT_TEXT
        );
        assert!(load_prompt(&cfg, Some("prompts/missing.txt")).is_err());

        std::fs::write(dir.path().join("prompts/bad.txt"), "no slot").expect("write");
        assert!(load_prompt(&cfg, Some("prompts/bad.txt")).is_err());
    }
}
