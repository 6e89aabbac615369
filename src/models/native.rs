use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use encoding_rs::UTF_8;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;

use crate::pipeline::prompts::render_template;
use crate::textutil::cleanup_model_text;
use crate::translate::beam::{log_softmax, top_k, BeamSearch, Candidate, Hypothesis};
use crate::translate::{source_token_budget, DecodeOptions, TranslationEngine};

/// `template_hint` value that feeds the rendered prompt to the model without a chat template.
pub const RAW_PROMPT_HINT: &str = "none";

#[derive(Clone, Debug)]
pub struct NativeModelConfig {
    pub name: String,
    pub model_path: PathBuf,
    pub template_hint: Option<String>,
    /// Context available to a single sentence (prompt + generation).
    pub ctx_size: u32,
    pub threads: i32,
    pub gpu_layers: i32,
    pub batch_size: Option<u32>,
    pub offload_kqv: Option<bool>,
    /// Widest beam this context must hold; sizes the KV sequence table.
    pub max_beams: usize,
    pub prompt: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// A GGUF translation model driven through llama.cpp.
///
/// Field order matters: `ctx` and `model` borrow `_owned` and must drop first.
pub struct NativeTranslator {
    name: String,
    ctx: LlamaContext<'static>,
    model: &'static LlamaModel,
    _owned: Box<LlamaModel>,
    template: Option<LlamaChatTemplate>,
    seq_ctx: usize,
    /// Prompt tokens spent on everything except the source sentence.
    prompt_overhead: usize,
    max_beams: usize,
    prompt: String,
    source_lang: String,
    target_lang: String,
}

impl NativeTranslator {
    pub fn load(backend: &LlamaBackend, cfg: NativeModelConfig) -> anyhow::Result<Self> {
        if !cfg.model_path.exists() {
            return Err(anyhow!(
                "{} model not found: {}",
                cfg.name,
                cfg.model_path.display()
            ));
        }

        let mut model_params = LlamaModelParams::default();
        if cfg.gpu_layers == -1 {
            // llama.cpp treats values above n_layer as "all layers".
            model_params = model_params.with_n_gpu_layers(9999);
        } else if cfg.gpu_layers >= 0 {
            model_params = model_params.with_n_gpu_layers(cfg.gpu_layers as u32);
        }

        let model = Box::new(
            LlamaModel::load_from_file(backend, &cfg.model_path, &model_params)
                .with_context(|| format!("load model {}", cfg.model_path.display()))?,
        );
        // SAFETY: the boxed model has a stable address and outlives `ctx` and `model`, which
        // are declared before `_owned` in the struct and therefore dropped first.
        let model_ptr: *const LlamaModel = &*model;
        let model_ref: &'static LlamaModel = unsafe { &*model_ptr };

        let ctx_train = model_ref.n_ctx_train();
        let mut seq_ctx = cfg.ctx_size;
        if seq_ctx == 0 {
            seq_ctx = ctx_train.clamp(256, 2048);
        }
        if ctx_train > 0 && seq_ctx > ctx_train {
            seq_ctx = ctx_train;
        }
        seq_ctx = seq_ctx.max(256);

        // Two banks of beam sequences: survivors are copied into the idle bank each step.
        let max_beams = cfg.max_beams.max(1);
        let n_seq_max = (max_beams * 2) as u32;
        let n_ctx = seq_ctx.saturating_mul(n_seq_max);

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_seq_max(n_seq_max);
        let n_batch: u32 = cfg.batch_size.unwrap_or(512).clamp(8, 65536);
        ctx_params = ctx_params.with_n_batch(n_batch).with_n_ubatch(n_batch);
        if let Some(offload) = cfg.offload_kqv {
            ctx_params = ctx_params.with_offload_kqv(offload);
        }
        if cfg.threads > 0 {
            ctx_params = ctx_params.with_n_threads(cfg.threads);
            ctx_params = ctx_params.with_n_threads_batch(cfg.threads);
        }
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .context("create model context")?;

        let hint = cfg.template_hint.as_deref().map(str::trim);
        let template = if hint == Some(RAW_PROMPT_HINT) {
            None
        } else {
            match model_ref.chat_template(None) {
                Ok(t) => Some(t),
                Err(_) => Some(
                    LlamaChatTemplate::new(hint.unwrap_or("chatml"))
                        .context("build fallback chat template")?,
                ),
            }
        };

        let mut me = Self {
            name: cfg.name,
            ctx,
            model: model_ref,
            _owned: model,
            template,
            seq_ctx: seq_ctx as usize,
            prompt_overhead: 0,
            max_beams,
            prompt: cfg.prompt,
            source_lang: cfg.source_lang,
            target_lang: cfg.target_lang,
        };
        let empty = me.render_prompt("")?;
        me.prompt_overhead = model_ref
            .str_to_token(&empty, decide_add_bos(&empty))
            .context("tokenize prompt template")?
            .len();
        Ok(me)
    }

    /// Fills the prompt template and wraps it in the chat template, if any.
    fn render_prompt(&self, source: &str) -> anyhow::Result<String> {
        let rendered = render_template(
            &self.prompt,
            &[
                ("source_lang", self.source_lang.as_str()),
                ("target_lang", self.target_lang.as_str()),
                ("text", source),
            ],
        );
        let Some(tmpl) = self.template.as_ref() else {
            return Ok(rendered);
        };
        let chat = vec![LlamaChatMessage::new("user".to_string(), rendered)
            .context("build user message")?];
        self.model
            .apply_chat_template(tmpl, &chat, true)
            .context("apply chat template")
    }

    pub fn translate_one(&mut self, text: &str, opts: &DecodeOptions) -> anyhow::Result<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        let model = self.model;

        let source = self.fit_source(text, opts)?;
        let prompt = self.render_prompt(&source)?;

        let prompt_tokens = model
            .str_to_token(&prompt, decide_add_bos(&prompt))
            .context("tokenize prompt")?;
        if prompt_tokens.is_empty() {
            return Err(anyhow!("empty prompt tokens"));
        }
        if prompt_tokens.len() + 1 >= self.seq_ctx {
            return Err(anyhow!(
                "prompt_too_long: prompt_tokens={} n_ctx={}",
                prompt_tokens.len(),
                self.seq_ctx
            ));
        }
        let max_new = opts
            .max_new_tokens
            .min(self.seq_ctx - prompt_tokens.len() - 1)
            .max(1);
        let width = opts.num_beams.clamp(1, self.max_beams);

        let first_logits = self.decode_prompt(&prompt_tokens)?;
        let tokens = self.beam_decode(first_logits, prompt_tokens.len(), width, max_new, opts)?;
        let out = detokenize(model, &tokens)?;
        Ok(cleanup_model_text(&out))
    }

    /// Applies the input length limit to the source sentence.
    ///
    /// The limit is `max_input_tokens`, lowered when the context cannot hold that much
    /// source next to the prompt template and room to generate.
    fn fit_source(&self, text: &str, opts: &DecodeOptions) -> anyhow::Result<String> {
        let model = self.model;
        let limit =
            source_token_budget(self.seq_ctx, self.prompt_overhead, opts).ok_or_else(|| {
                anyhow!(
                    "prompt_too_long: template uses {} of n_ctx={}",
                    self.prompt_overhead,
                    self.seq_ctx
                )
            })?;
        let tokens = model
            .str_to_token(text, AddBos::Never)
            .context("tokenize source")?;
        if tokens.len() <= limit {
            return Ok(text.to_string());
        }
        if !opts.truncation {
            return Err(anyhow!(
                "input_too_long: tokens={} limit={limit} (max_input_tokens={})",
                tokens.len(),
                opts.max_input_tokens
            ));
        }
        Ok(detokenize(model, &tokens[..limit])?.trim().to_string())
    }

    /// Runs the prompt through sequence 0 and returns log-probs for the next token.
    fn decode_prompt(&mut self, prompt_tokens: &[LlamaToken]) -> anyhow::Result<Vec<f32>> {
        self.ctx.clear_kv_cache();

        let n_batch = self.ctx.n_batch() as usize;
        if n_batch == 0 {
            return Err(anyhow!("invalid n_batch=0"));
        }

        let last_index = prompt_tokens.len() - 1;
        let mut chunk_start = 0;
        let mut last_in_batch = 0i32;
        while chunk_start < prompt_tokens.len() {
            let chunk_end = (chunk_start + n_batch).min(prompt_tokens.len());
            let chunk = &prompt_tokens[chunk_start..chunk_end];

            let mut batch = LlamaBatch::new(chunk.len().max(512), 1);
            for (i, token) in chunk.iter().copied().enumerate() {
                let pos = (chunk_start + i) as i32;
                let is_last = (chunk_start + i) == last_index;
                batch
                    .add(token, pos, &[0], is_last)
                    .context("batch.add(prompt)")?;
                if is_last {
                    last_in_batch = i as i32;
                }
            }

            self.decode_checked(&mut batch, "decode prompt")?;
            chunk_start = chunk_end;
        }
        Ok(log_softmax(self.ctx.get_logits_ith(last_in_batch)))
    }

    fn beam_decode(
        &mut self,
        first_logits: Vec<f32>,
        prompt_len: usize,
        width: usize,
        max_new: usize,
        opts: &DecodeOptions,
    ) -> anyhow::Result<Vec<LlamaToken>> {
        let model = self.model;
        let mut search: BeamSearch<LlamaToken> = BeamSearch::new(width, opts.length_penalty);
        let mut live: Vec<Hypothesis<LlamaToken>> = vec![Hypothesis::root()];
        let mut live_seq: Vec<i32> = vec![0];
        let mut logits: Vec<Vec<f32>> = vec![first_logits];
        let mut bank = 0usize;
        let mut pos = prompt_len as i32;
        let mut batch = LlamaBatch::new(512.max(width), 1);

        for step in 0..max_new {
            let mut candidates = Vec::new();
            for (parent, lp) in logits.iter().enumerate() {
                for (tok, v) in top_k(lp, search.candidates_per_beam()) {
                    candidates.push(Candidate {
                        parent,
                        token: LlamaToken(tok as i32),
                        score: live[parent].score + v,
                    });
                }
            }

            let next = search.step(&live, candidates, |t| model.is_eog_token(t));
            if next.is_empty() {
                live.clear();
                break;
            }

            let next_bank = 1 - bank;
            let mut next_seq = Vec::with_capacity(next.len());
            for (j, (parent, _)) in next.iter().enumerate() {
                let dst = (next_bank * width + j) as i32;
                self.ctx
                    .clear_kv_cache_seq(Some(dst as u32), None, None)
                    .context("clear beam sequence")?;
                self.ctx
                    .copy_kv_cache_seq(live_seq[*parent], dst, None, None)
                    .context("copy beam sequence")?;
                next_seq.push(dst);
            }
            for &old in &live_seq {
                self.ctx
                    .clear_kv_cache_seq(Some(old as u32), None, None)
                    .context("release beam sequence")?;
            }
            bank = next_bank;
            live = next.into_iter().map(|(_, h)| h).collect();
            live_seq = next_seq;

            if search.is_done(&live) || step + 1 == max_new {
                break;
            }

            batch.clear();
            for (j, h) in live.iter().enumerate() {
                let Some(&tok) = h.tokens.last() else {
                    return Err(anyhow!("live beam without tokens"));
                };
                batch
                    .add(tok, pos, &[live_seq[j]], true)
                    .context("batch.add(beam)")?;
            }
            self.decode_checked(&mut batch, "decode(beam)")?;
            pos += 1;
            logits = (0..live.len())
                .map(|j| log_softmax(self.ctx.get_logits_ith(j as i32)))
                .collect();
        }

        Ok(search.finish(live).map(|h| h.tokens).unwrap_or_default())
    }

    fn decode_checked(&mut self, batch: &mut LlamaBatch, stage: &str) -> anyhow::Result<()> {
        self.ctx.decode(batch).map_err(|err| match err {
            DecodeError::Unknown(-2) => anyhow!(
                "llama_decode threw a foreign exception (likely OOM) (model={}, stage={})",
                self.name,
                stage
            ),
            other => anyhow!(other),
        })?;
        Ok(())
    }
}

impl TranslationEngine for NativeTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    fn translate_batch(
        &mut self,
        sources: &[String],
        opts: &DecodeOptions,
    ) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::with_capacity(sources.len());
        for (i, text) in sources.iter().enumerate() {
            let t = self
                .translate_one(text, opts)
                .with_context(|| format!("translate item {i}"))?;
            out.push(t);
        }
        Ok(out)
    }
}

fn detokenize(model: &LlamaModel, tokens: &[LlamaToken]) -> anyhow::Result<String> {
    let mut decoder = UTF_8.new_decoder();
    let mut out = String::new();
    for &token in tokens {
        let bytes = model
            .token_to_bytes(token, Special::Plaintext)
            .context("token_to_bytes")?;
        out.reserve(bytes.len() * 3 + 4);
        let _ = decoder.decode_to_string(&bytes, &mut out, false);
    }
    out.reserve(8);
    let _ = decoder.decode_to_string(&[], &mut out, true);
    Ok(out)
}

fn decide_add_bos(prompt: &str) -> AddBos {
    let p = prompt.trim_start();
    // Templates that already open with a BOS-like token must not get a second one.
    if p.starts_with("<s>")
        || p.starts_with("<|begin_of_text|>")
        || p.starts_with("<bos>")
        || p.starts_with("<BOS>")
        || p.starts_with("<|startoftext|>")
    {
        AddBos::Never
    } else {
        AddBos::Always
    }
}
