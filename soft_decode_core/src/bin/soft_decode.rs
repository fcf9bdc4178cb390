use clap::{Parser, Subcommand};
use soft_decode_core::config::{
    CacheMode, RunConfig, WhichDevice, DEFAULT_LENGTH, DEFAULT_MODEL_ID, DEFAULT_PROMPT,
    DEFAULT_TEMPERATURES,
};
use soft_decode_core::experiments::{argmax_baseline, compare_input_paths, temperature_sweep};
use soft_decode_core::session::Session;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    version = "0.1",
    about = "Soft (embedding-weighted) vs arg-max decoding experiments"
)]
struct Args {
    /// Hugging Face model repo, ignored if --checkpoint is set
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Local checkpoint directory with config.json, model.safetensors and tokenizer.json
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = WhichDevice::Cpu)]
    device: WhichDevice,

    /// Prompt text
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Number of decoding steps
    #[arg(short, long, default_value_t = DEFAULT_LENGTH)]
    length: usize,

    /// Re-encode the whole sequence every step instead of reusing the KV cache
    #[arg(long)]
    no_cache: bool,

    /// Show a spinner while decoding
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    experiment: Experiment,
}

#[derive(Subcommand, Debug)]
enum Experiment {
    /// Soft decoding from the one-hot prompt at each temperature
    Sweep {
        /// Temperatures to try, lower is peakier
        #[arg(long, num_args = 1.., default_values_t = DEFAULT_TEMPERATURES)]
        temperatures: Vec<f64>,
    },
    /// Conventional greedy decoding
    Argmax,
    /// Compare logits from ids, looked-up embeddings and the one-hot projection
    CompareInputs {
        /// Divides the one-hot prompt before its softmax projection
        #[arg(long, default_value_t = 0.001)]
        temperature: f64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let cfg = RunConfig {
        model_id: args.model_id,
        checkpoint: args.checkpoint,
        device: args.device,
        prompt: args.prompt,
        length: args.length,
        cache: CacheMode::from_no_cache(args.no_cache),
        show_progress: args.progress,
    };
    let session = Session::load(&cfg)?;
    let prompt_ids = session.encode_prompt(&cfg.prompt)?;
    println!("Prompt: {:?} ({} tokens)", cfg.prompt, prompt_ids.dim(1)?);

    match args.experiment {
        Experiment::Sweep { temperatures } => {
            let entries = temperature_sweep(
                &session.model,
                &session.tokenizer,
                &prompt_ids,
                &temperatures,
                cfg.length,
                cfg.cache,
                cfg.show_progress,
            )?;
            for entry in entries {
                println!(" ------- \n * temperature: {}", entry.temperature);
                if let Some(h) = entry.prompt_entropy {
                    println!("prompt entropy: {:.4}", h);
                }
                println!("{}", entry.transcript.text);
                println!("nll: {:.3}", entry.transcript.nll);
            }
        }
        Experiment::Argmax => {
            let transcript = argmax_baseline(
                &session.model,
                &session.tokenizer,
                &prompt_ids,
                cfg.length,
                cfg.cache,
                cfg.show_progress,
            )?;
            println!("{}", transcript.text);
            println!("nll: {:.3}", transcript.nll);
        }
        Experiment::CompareInputs { temperature } => {
            let report = compare_input_paths(&session.model, &prompt_ids, temperature)?;
            println!(
                "max |logit diff| vs ids: lookup {:.6}, one-hot projection (T={}) {:.6}",
                report.lookup_max_diff, temperature, report.one_hot_max_diff
            );
        }
    }

    Ok(())
}
