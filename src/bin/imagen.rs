use anyhow::Result;

use clap::Parser;
use imagen::{
    init_logging,
    model::{fetch_artifacts, verify_artifacts},
    orchestrator::{StylePreset, EXAMPLE_PROMPTS},
    pipeline::StableDiffusionLoader,
    BatchOutcome, Cli, Command, GenerateArgs, ModelManager, Orchestrator,
};
use tracing::error;

async fn generate(cli: &Cli, args: GenerateArgs) -> Result<BatchOutcome> {
    let loader = StableDiffusionLoader {
        sliced_attention_size: cli.sliced_attention_size,
        use_flash_attn: cli.use_flash_attn,
        ..StableDiffusionLoader::new(cli.sd_version)
    };
    let model_dir = cli.model_dir.clone();
    let force_cpu = cli.cpu;
    let request = args.request();
    let output_dir = args.output_dir;

    // The whole batch runs on one blocking thread, one image after another.
    let outcome = tokio::task::spawn_blocking(move || {
        let manager = ModelManager::new(loader, model_dir, force_cpu);
        let mut orchestrator = Orchestrator::new(manager, output_dir);
        let outcome = orchestrator.generate_batch(&request);
        if outcome.is_err() {
            println!("{}", orchestrator.status().banner());
        }
        outcome
    })
    .await?;
    Ok(outcome?)
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Generate(args) => {
            let outcome = generate(&cli, args.clone()).await?;
            for image in &outcome.images {
                println!("{}: {}", image.label, image.path.display());
            }
            println!("{}", outcome.status.banner());
        }
        Command::Verify => {
            let report = verify_artifacts(&cli.model_dir);
            if report.is_complete() {
                println!("all model files present under {}", cli.model_dir.display());
            } else {
                for missing in &report.missing {
                    println!("missing: {missing}");
                }
                anyhow::bail!("model files not found, run `imagen fetch` first");
            }
        }
        Command::Fetch { repo } => {
            fetch_artifacts(&cli.model_dir, cli.sd_version, repo.as_deref()).await?;
            println!("model downloaded to {}", cli.model_dir.display());
        }
        Command::Presets => {
            println!("Style presets:");
            for style in StylePreset::ALL {
                println!("  {:<16}{}", style.keyword(), style.descriptor());
            }
            println!("Example prompts:");
            for prompt in EXAMPLE_PROMPTS {
                println!("  {prompt}");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file(), cli.tracing)?;
    let result = run(cli).await;
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}
