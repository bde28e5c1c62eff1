mod face;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};
use webpilot::{AgentEvent, ChromeDriver, OpenAiClient, Orchestrator, Settings};

use crate::face::WebIntervention;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info,webpilot_agent=info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let settings = Settings::from_env()?;
    tracing::info!("starting webpilot agent");

    // Web UI first so the user sees something while Chrome starts.
    let (mut cmd_rx, ui) = face::start_server().await?;

    tracing::info!("launching Chrome");
    let browser = settings.browser.clone();
    let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&browser))
        .await
        .context("browser launch panicked")??;
    let driver = Arc::new(driver);
    tracing::info!("Chrome ready, waiting for commands");
    let _ = ui.events.send(AgentEvent::Ready);

    while let Some(request) = cmd_rx.recv().await {
        tracing::info!(command = %request.command, "received command");

        // Every task gets its own tab.
        let tab_driver = Arc::clone(&driver);
        match tokio::task::spawn_blocking(move || tab_driver.new_tab()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to open a new tab for the task"),
            Err(e) => tracing::warn!(error = %e, "new tab task panicked"),
        }

        let model = match OpenAiClient::new(&settings.model) {
            Ok(model) => model,
            Err(e) => {
                let _ = ui.events.send(AgentEvent::TaskError {
                    message: e.to_string(),
                    reason: None,
                });
                let _ = ui.events.send(AgentEvent::Ready);
                continue;
            }
        };

        let cancel = ui.begin_task();
        let mut orchestrator = Orchestrator::new(Arc::clone(&driver), model, settings.clone())
            .with_events(ui.events.clone())
            .with_intervention(WebIntervention::new(Arc::clone(&ui.decisions)));
        let result = orchestrator
            .run(&request.command, request.url.as_deref(), cancel)
            .await;
        tracing::info!(success = result.success, steps = result.steps_taken, "task finished");

        let _ = ui.events.send(AgentEvent::Ready);
    }

    Ok(())
}
