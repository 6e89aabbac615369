use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use corpus_mt_prep::pipeline::{
    init_default_config, CorpusSplitter, SplitOverrides, SplitSettings, TranslateOverrides,
    TranslateSettings,
};
use corpus_mt_prep::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "corpus-mt-prep")]
#[command(about = "Split a parallel corpus into train/valid/test and add machine translations", long_about = None)]
struct Args {
    /// Generate default config + prompt file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Config file path (default: $CORPUS_MT_PREP_CONFIG, else search for corpus-mt-prep.toml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// No progress output on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair two line-aligned files and write train.tsv, valid.tsv and test.tsv
    Split {
        /// First-column input (one sentence per line)
        #[arg(long, value_name = "FILE")]
        source_file: Option<PathBuf>,

        /// Second-column input, line-aligned with --source-file
        #[arg(long, value_name = "FILE")]
        target_file: Option<PathBuf>,

        /// Sampling seed (default: 1234)
        #[arg(long)]
        seed: Option<u64>,

        /// Where the partition files go
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
    /// Add a machine-translation column to partition files, in place
    Translate {
        /// Partition files (default: train.tsv valid.tsv test.tsv)
        #[arg(value_name = "TSV")]
        files: Vec<PathBuf>,

        /// Backend name from config
        #[arg(long)]
        backend: Option<String>,

        /// Translation model GGUF (overrides backend path)
        #[arg(long, value_name = "GGUF")]
        model: Option<PathBuf>,

        /// Sentences per inference batch (default: 32)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Beam width (default: 4)
        #[arg(long)]
        num_beams: Option<usize>,

        /// Threads for llama.cpp (default: -1 = auto)
        #[arg(long)]
        threads: Option<i32>,

        /// GPU layers for llama.cpp (default: -1 = offload as much as possible)
        #[arg(long)]
        gpu_layers: Option<i32>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let progress = ConsoleProgress::new(!args.quiet);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let Some(command) = args.command else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nUSAGE:\n  corpus-mt-prep split\n  corpus-mt-prep translate\n\nTIPS:\n  - Run split first; translate rewrites its train/valid/test.tsv in place.\n  - corpus-mt-prep --init-config writes an editable corpus-mt-prep.toml.\n"
        );
        return Ok(());
    };

    match command {
        Command::Split {
            source_file,
            target_file,
            seed,
            output_dir,
        } => {
            let cfg = SplitSettings::load(
                args.config,
                SplitOverrides {
                    source_file,
                    target_file,
                    seed,
                    output_dir,
                },
            )
            .context("build split config")?;
            CorpusSplitter::new(cfg, progress).run()?;
        }
        Command::Translate {
            files,
            backend,
            model,
            batch_size,
            num_beams,
            threads,
            gpu_layers,
        } => {
            let cfg = TranslateSettings::load(
                args.config,
                TranslateOverrides {
                    files,
                    backend,
                    model,
                    batch_size,
                    num_beams,
                    threads,
                    gpu_layers,
                },
            )
            .context("build translate config")?;
            run_translate(cfg, progress)?;
        }
    }
    Ok(())
}

#[cfg(feature = "native")]
fn run_translate(cfg: TranslateSettings, progress: ConsoleProgress) -> anyhow::Result<()> {
    let report = corpus_mt_prep::pipeline::BatchTranslator::new(cfg, progress).run()?;
    let rows: usize = report.done.iter().map(|(_, n)| n).sum();
    eprintln!("Translated {rows} rows in {} files", report.done.len());
    Ok(())
}

#[cfg(not(feature = "native"))]
fn run_translate(_cfg: TranslateSettings, _progress: ConsoleProgress) -> anyhow::Result<()> {
    Err(anyhow::anyhow!(
        "translate needs the llama.cpp engine: rebuild with --features native"
    ))
}
