use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use pruefwerk::{
    load_prompts, EvalPrompt, EvalSummary, EvaluationScheduler, FixtureToolHost, HarnessConfig, ResultWriter,
    StrategyKind,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pruefwerk")]
#[command(about = "Run model-driven tool-use evaluations and judge the transcripts")]
struct Args {
    /// Harness config (YAML/JSON)
    #[arg(long, default_value = "pruefwerk.yaml")]
    config: PathBuf,

    /// Prompt file or directory of prompt files
    #[arg(long, default_value = "prompts")]
    prompts: PathBuf,

    /// Tool fixture file served to the agent
    #[arg(long, default_value = "tools.yaml")]
    tools: PathBuf,

    /// Output directory for result files (overrides config)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Evaluations per window (overrides config)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Strategy for prompts without a script: agent or conversation
    #[arg(long)]
    mode: Option<StrategyKind>,

    /// Run only prompts whose id contains this substring (repeatable)
    #[arg(long)]
    filter: Vec<String>,

    /// Fail tool calls whose step references could not be resolved
    #[arg(long)]
    strict: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pruefwerk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = HarnessConfig::load(&args.config)?;
    config.apply_env()?;
    if let Some(out) = args.out {
        config.output_dir = out;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if args.strict {
        config.strict_references = true;
    }

    let prompts = filter_prompts(load_prompts(&args.prompts)?, &args.filter);
    if prompts.is_empty() {
        eprintln!("No prompts matched.");
        std::process::exit(2);
    }

    let targets = config.build_targets()?;
    let judge = config.build_judge(&targets)?;
    let judge_provider = judge.provider_name();
    let judge_model = judge.model().to_string();
    let tool_host = Arc::new(FixtureToolHost::from_path(&args.tools)?);

    let scheduler = EvaluationScheduler::new(targets, judge, tool_host)
        .with_normalizer(config.normalizer()?)
        .with_settings(config.settings());

    let results = scheduler.run(&prompts).await?;
    let summary = EvalSummary::from_results(&results).with_judge(judge_provider, judge_model);
    let writer = ResultWriter::new(&config.output_dir);
    let summary_path = writer.write_all(&results, &summary)?;

    for result in results.iter().filter(|result| !result.passed()) {
        eprintln!("FAIL {} (score {:.3})", result.id, result.validation.score);
        match &result.error {
            Some(error) => eprintln!("  - error: {error}"),
            None => eprintln!("  - {}", result.validation.reasoning),
        }
    }
    for target in &summary.targets {
        println!(
            "Provider: {}, Model: {}, Results: {}/{} passed, AvgScore: {:.3}, AvgSteps: {:.1}, AvgLatency: {:.0}ms, Tokens: {}",
            target.provider,
            target.model,
            target.passed,
            target.total,
            target.average_score,
            target.average_steps,
            target.average_latency_ms,
            target.usage.total_tokens
        );
    }
    println!(
        "Total: {}/{} passed ({:.1}%), Output: {}",
        summary.passed,
        summary.total,
        summary.pass_rate * 100.0,
        summary_path.display()
    );

    if summary.all_passed() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn filter_prompts(mut prompts: Vec<EvalPrompt>, filters: &[String]) -> Vec<EvalPrompt> {
    if filters.is_empty() {
        return prompts;
    }
    prompts.retain(|p| filters.iter().any(|f| p.id.contains(f)));
    prompts
}
