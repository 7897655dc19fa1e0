use std::path::PathBuf;

use clap::Parser;
use deepseek_ocr::{generate, init_tracing, load_local, postprocess, DType, Device, GenerationConfig};

/// Runs the OCR engine over a single page image and writes grounded markdown
/// plus cropped figures to an output directory.
#[derive(Parser)]
struct Args {
    /// Local checkpoint directory (config.json, tokenizer.json, safetensors shards).
    #[arg(long)]
    model_dir: PathBuf,

    /// Image to OCR.
    #[arg(long)]
    image: PathBuf,

    /// Prompt sent to the model; must contain an `<image>` placeholder.
    #[arg(long, default_value = "<image>\nFree OCR.")]
    prompt: String,

    /// Output directory for result.md, annotated.png, and cropped images.
    #[arg(long, default_value = "ocr_output")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 0.0)]
    temperature: f64,

    #[arg(long, default_value_t = 4096)]
    max_new_tokens: usize,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
    let loaded = load_local(&args.model_dir, DType::F16, &device)?;

    let image = image::open(&args.image)?;
    let processed = loaded.preprocessor.process(&image, &args.prompt, &device)?;

    let gen_cfg = GenerationConfig {
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        eos_token_id: loaded.config.text_config.eos_token_id,
        ..Default::default()
    };

    let result = generate(&loaded.model, &processed.input_ids, Some(&processed.vision), &gen_cfg)?;
    let text = loaded.preprocessor.decode(&result.token_ids, true)?;

    postprocess::save_ocr_outputs(&image, &text, &args.out_dir)?;
    println!("wrote {}", args.out_dir.join("result.md").display());
    Ok(())
}
