//! `distillery demo` — Replay a scripted scenario and show what was distilled.

use distillery_agent::scenario::{self, Scenario};
use distillery_config::AppConfig;
use distillery_core::run::DeterminismMode;

pub async fn run(
    scenario_name: &str,
    objective: Option<String>,
    llm: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario: Scenario = scenario_name.parse()?;
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let orchestrator = distillery_gateway::build_orchestrator(&config).await?;
    if llm && !orchestrator.has_llm() {
        return Err("--llm needs an API key (set DISTILLERY_API_KEY or OPENAI_API_KEY)".into());
    }

    let mut run_config = config.run_defaults.clone();
    if llm {
        run_config.determinism_mode = DeterminismMode::LlmAssisted;
    }

    let objective = objective.unwrap_or_else(|| scenario.default_objective().to_string());
    let run = orchestrator.create_run(&objective, run_config).await?;

    println!("Distillery demo — scenario {}", scenario.as_str());
    println!("   Run:       {}", run.id);
    println!("   Objective: {}", run.objective);
    println!("   Mode:      {}", run.config.determinism_mode.as_str());
    println!();

    let outcomes = scenario::run_scenario(&orchestrator, &run.id, scenario).await?;
    for (message, outcome) in scenario.messages().iter().zip(&outcomes) {
        println!("[step {}] {message}", outcome.step_index);
        if let Some(trigger) = outcome.compression_trigger {
            println!(
                "   compressed ({}) -> snapshot v{}",
                trigger.as_str(),
                outcome.snapshot_version.unwrap_or_default()
            );
        }
        println!(
            "   verdict: {}  injected: {}  baseline: {}  reduction: {:.1}%{}",
            outcome.verdict.as_str(),
            outcome.metrics.injected_tokens,
            outcome.metrics.baseline_tokens,
            outcome.metrics.reduction_pct,
            if outcome.degraded { "  (degraded)" } else { "" }
        );
    }

    let memory = orchestrator.get_memory(&run.id).await?;
    println!();
    println!("Compressed working memory ({} facts):", memory.latest_cwm.len());
    for fact in &memory.latest_cwm {
        println!("   {} = {}", fact.key, fact.value);
    }
    if let Some(path) = &memory.metrics.last_snapshot_path {
        println!("   Last snapshot: {path}");
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&memory.metrics)?);

    Ok(())
}
