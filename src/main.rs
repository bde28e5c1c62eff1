use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};
use webpilot::{ChromeDriver, OpenAiClient, Orchestrator, Settings, TaskResult};

#[derive(Parser, Debug)]
#[command(name = "webpilot")]
#[command(version)]
#[command(about = "Drive a browser toward a goal with a language model.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one task and print the result
    Run {
        /// What the agent should accomplish, in plain language
        task: String,

        /// Page to open before the first step
        #[arg(long)]
        url: Option<String>,

        /// Override MAX_STEPS
        #[arg(long)]
        max_steps: Option<usize>,

        /// Run Chrome without a window
        #[arg(long)]
        headless: bool,

        /// Also write the task result as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Load and validate settings, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    match cli.command {
        Commands::Run {
            task,
            url,
            max_steps,
            headless,
            report,
        } => run(task, url, max_steps, headless, report).await,
        Commands::Check => {
            let settings = Settings::from_env()?;
            println!("Settings OK");
            println!("  model:      {} @ {}", settings.model.model, settings.model.base_url);
            println!("  max steps:  {}", settings.agent.max_steps);
            println!("  loop:       {:?}", settings.agent.loop_policy);
            println!("  diagnostics {}", settings.executor.diagnostics_dir.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(
    task: String,
    url: Option<String>,
    max_steps: Option<usize>,
    headless: bool,
    report: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut settings = Settings::from_env()?;
    if let Some(max_steps) = max_steps {
        settings.agent.max_steps = max_steps;
    }
    if headless {
        settings.browser.headless = true;
    }
    settings.validate()?;

    let browser = settings.browser.clone();
    let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&browser))
        .await
        .context("browser launch panicked")??;
    let model = OpenAiClient::new(&settings.model)?;
    tracing::info!(model = model.model(), "agent ready");

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling task");
            on_ctrl_c.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(driver, model, settings);
    let result = orchestrator.run(&task, url.as_deref(), cancel).await;
    print_result(&result);

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&result)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_result(result: &TaskResult) {
    let status = if result.success { "SUCCESS" } else { "FAILED" };
    println!();
    println!("{status}: {}", result.summary);
    if let Some(reason) = result.error {
        println!("  reason:    {reason:?}");
    }
    println!("  steps:     {}", result.steps_taken);
    println!("  elapsed:   {:.1}s", result.elapsed_secs);
    if let Some(url) = &result.final_url {
        println!("  final url: {url}");
    }
    if !result.context.is_empty() {
        println!("  context:");
        for (key, value) in &result.context {
            println!("    {key}: {value}");
        }
    }
}
