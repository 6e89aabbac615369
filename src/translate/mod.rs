pub mod beam;

use anyhow::anyhow;

use crate::progress::ConsoleProgress;

#[derive(Clone, Debug, PartialEq)]
pub struct DecodeOptions {
    pub batch_size: usize,
    pub num_beams: usize,
    /// Cut over-length inputs to `max_input_tokens` instead of failing.
    pub truncation: bool,
    pub max_input_tokens: usize,
    pub max_new_tokens: usize,
    /// Exponent applied to hypothesis length when ranking finished beams.
    pub length_penalty: f32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_beams: 4,
            truncation: true,
            max_input_tokens: 512,
            max_new_tokens: 256,
            length_penalty: 1.0,
        }
    }
}

/// Generated tokens kept free in the context even when the source is cut hard.
pub const MIN_GENERATION_TOKENS: usize = 32;
/// Slack for a truncated source re-tokenizing a few tokens longer inside the prompt.
pub const RETOKENIZE_SLACK: usize = 8;

/// Largest source length, in tokens, that fits a `ctx_tokens` window next to
/// `prompt_overhead` template tokens while leaving room to generate.
///
/// Returns `None` when the template alone leaves no room for any source text.
pub fn source_token_budget(
    ctx_tokens: usize,
    prompt_overhead: usize,
    opts: &DecodeOptions,
) -> Option<usize> {
    let reserve = opts.max_new_tokens.min(MIN_GENERATION_TOKENS).max(1) + RETOKENIZE_SLACK;
    let room = ctx_tokens
        .checked_sub(prompt_overhead)?
        .checked_sub(reserve)?;
    let budget = room.min(opts.max_input_tokens);
    (budget > 0).then_some(budget)
}

/// A loaded translation model.
///
/// `translate_batch` must return exactly one output per input, in input order.
pub trait TranslationEngine {
    fn name(&self) -> &str;

    fn translate_batch(
        &mut self,
        sources: &[String],
        opts: &DecodeOptions,
    ) -> anyhow::Result<Vec<String>>;
}

/// Feeds `sources` to the engine in `batch_size` chunks and concatenates the results.
pub fn translate_all<E: TranslationEngine + ?Sized>(
    engine: &mut E,
    sources: &[String],
    opts: &DecodeOptions,
    progress: &ConsoleProgress,
    label: &str,
) -> anyhow::Result<Vec<String>> {
    let batch_size = opts.batch_size.max(1);
    let total = sources.len();
    let mut out: Vec<String> = Vec::with_capacity(total);

    for (batch_idx, chunk) in sources.chunks(batch_size).enumerate() {
        let translated = engine.translate_batch(chunk, opts).map_err(|err| {
            err.context(format!(
                "{} batch {} (rows {}..{})",
                engine.name(),
                batch_idx,
                batch_idx * batch_size,
                batch_idx * batch_size + chunk.len()
            ))
        })?;
        if translated.len() != chunk.len() {
            return Err(anyhow!(
                "{} returned {} translations for {} inputs (batch {batch_idx})",
                engine.name(),
                translated.len(),
                chunk.len()
            ));
        }
        out.extend(translated);
        progress.progress(label, out.len(), total);
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeEngine, LossyEngine};
    use super::*;

    fn inputs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sætning {i}")).collect()
    }

    #[test]
    fn batches_keep_order_and_count() {
        let mut engine = FakeEngine::default();
        let opts = DecodeOptions {
            batch_size: 4,
            ..DecodeOptions::default()
        };
        let src = inputs(10);
        let out = translate_all(&mut engine, &src, &opts, &ConsoleProgress::quiet(), "t")
            .expect("translate");
        assert_eq!(engine.batches, vec![4, 4, 2]);
        assert_eq!(out.len(), 10);
        for (i, t) in out.iter().enumerate() {
            assert_eq!(t, &format!("gnintæs {i}"));
        }
    }

    #[test]
    fn empty_input_makes_no_calls() {
        let mut engine = FakeEngine::default();
        let out = translate_all(
            &mut engine,
            &[],
            &DecodeOptions::default(),
            &ConsoleProgress::quiet(),
            "t",
        )
        .expect("translate");
        assert!(out.is_empty());
        assert!(engine.batches.is_empty());
    }

    #[test]
    fn short_batch_is_an_error() {
        let err = translate_all(
            &mut LossyEngine,
            &inputs(3),
            &DecodeOptions::default(),
            &ConsoleProgress::quiet(),
            "t",
        )
        .unwrap_err();
        assert!(err.to_string().contains("2 translations for 3 inputs"), "{err}");
    }

    #[test]
    fn source_budget_respects_context_and_setting() {
        let opts = DecodeOptions::default();
        // Roomy context: the configured limit wins.
        assert_eq!(source_token_budget(1024, 40, &opts), Some(512));
        // Tight context: 512 - 40 template - 32 generation - 8 slack.
        assert_eq!(source_token_budget(512, 40, &opts), Some(432));
        // Template alone fills the window.
        assert_eq!(source_token_budget(64, 40, &opts), None);
        assert_eq!(source_token_budget(30, 40, &opts), None);

        let short_gen = DecodeOptions {
            max_new_tokens: 4,
            ..DecodeOptions::default()
        };
        assert_eq!(source_token_budget(512, 40, &short_gen), Some(460));
    }

    #[test]
    fn engine_errors_name_the_batch() {
        let mut engine = FakeEngine {
            fail_on: Some("sætning 5".into()),
            ..FakeEngine::default()
        };
        let opts = DecodeOptions {
            batch_size: 2,
            ..DecodeOptions::default()
        };
        let err = translate_all(&mut engine, &inputs(8), &opts, &ConsoleProgress::quiet(), "t")
            .unwrap_err();
        assert!(format!("{err:#}").contains("batch 2 (rows 4..6)"), "{err:#}");
    }
}
