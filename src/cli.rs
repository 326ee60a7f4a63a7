//! CLI interface for adaptive-policy

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::context::AdaptiveContext;
use crate::engine::default_scenarios;
use crate::types::Modality;

#[derive(Parser)]
#[command(name = "adaptive-policy")]
#[command(about = "Adaptive provider/model selection with idle-time experiments and federated aggregation", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(short, long, global = true, env = "ADAPTIVE_POLICY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the learning engine and federated broker until interrupted
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Pick a provider and model for a task
    Choose {
        /// Prompt text
        prompt: String,
        /// Task-type label
        #[arg(short, long, default_value = "general")]
        task_type: String,
        /// Modalities involved (repeatable)
        #[arg(short, long)]
        modality: Vec<String>,
    },
    /// Record a task outcome
    Record {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(short, long, default_value = "general")]
        task_type: String,
        #[arg(long, default_value = "cli")]
        agent: String,
        /// Mark the task as failed
        #[arg(long)]
        failed: bool,
        /// Explicit reward (defaults to 1.0 on success, 0.0 on failure)
        #[arg(long)]
        reward: Option<f64>,
        #[arg(long, default_value = "0")]
        latency_ms: f64,
    },
    /// Outcome summary ordered by mean reward
    Summary {
        #[arg(long, value_enum, default_value = "provider")]
        by: SummaryKey,
    },
    /// Most recent feedback events
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Inspect or change the policy state
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// List the learning scenario catalog
    Scenarios,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SummaryKey {
    Provider,
    Agent,
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Show provider priority and model preferences
    Show,
    /// Replace the provider priority list
    Set {
        /// Comma-separated providers, highest priority first
        #[arg(value_delimiter = ',')]
        priority: Vec<String>,
        /// Also clear all model preferences
        #[arg(long)]
        clear_preferences: bool,
    },
    /// Prefer a model for one task type
    Prefer {
        task_type: String,
        provider: String,
        model: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Run the CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => run_config(command, cli.config.as_ref()),
        Commands::Scenarios => {
            print_scenarios();
            Ok(())
        }
        command => {
            let config = load_config(cli.config.as_ref())?;
            let ctx = AdaptiveContext::build(config).await?;
            run_with_context(&ctx, command).await
        }
    }
}

async fn run_with_context(ctx: &AdaptiveContext, command: Commands) -> Result<()> {
    match command {
        Commands::Run { duration } => {
            ctx.start().await;
            println!("Continuous learning running (Ctrl-C to stop)...");

            match duration {
                Some(secs) => tokio::time::sleep(std::time::Duration::from_secs(secs)).await,
                None => tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?,
            }

            ctx.stop().await;
            if ctx.config.snapshots.enabled {
                ctx.engine.persist_state().await?;
            }

            let state = ctx.optimization_state().await;
            println!(
                "Stopped after {} experiments ({} improvements, exploration rate {:.3})",
                state.total_experiments, state.successful_optimizations, state.exploration_rate
            );
        }
        Commands::Choose { prompt, task_type, modality } => {
            let modalities = modality
                .iter()
                .map(|m| m.parse::<Modality>())
                .collect::<Result<Vec<_>>>()?;
            let choice = ctx.policy.choose_provider_model(&prompt, &task_type, &modalities).await?;
            if choice.model.is_empty() {
                println!("{} (no default model configured)", choice.provider);
            } else {
                println!("{}", choice);
            }
        }
        Commands::Record { provider, model, task_type, agent, failed, reward, latency_ms } => {
            let id = ctx
                .policy
                .update_reward(&agent, &provider, &model, &task_type, !failed, reward, latency_ms, HashMap::new())
                .await?;
            println!("Recorded event #{}", id);
        }
        Commands::Summary { by } => {
            let rows = match by {
                SummaryKey::Provider => ctx.store.summary_by_provider().await?,
                SummaryKey::Agent => ctx.store.summary_by_agent().await?,
            };
            if rows.is_empty() {
                println!("No feedback recorded yet.");
                return Ok(());
            }
            println!("{:<24} {:>7} {:>9} {:>10} {:>12}", "key", "count", "success", "reward", "latency_ms");
            for row in rows {
                println!(
                    "{:<24} {:>7} {:>8.1}% {:>10.3} {:>12.1}",
                    row.key,
                    row.count,
                    row.success_rate() * 100.0,
                    row.avg_reward,
                    row.avg_latency_ms
                );
            }
        }
        Commands::Recent { limit } => {
            for event in ctx.store.recent_events(limit).await? {
                println!(
                    "#{} {} {} {}/{} [{}] {} reward={:.2} latency={:.0}ms",
                    event.id,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.agent,
                    event.provider,
                    event.model,
                    event.task_type,
                    if event.success { "ok" } else { "failed" },
                    event.reward,
                    event.latency_ms
                );
            }
        }
        Commands::Policy { command } => match command {
            PolicyCommands::Show => {
                let state = ctx.policy_state().await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            PolicyCommands::Set { priority, clear_preferences } => {
                let priority: Vec<String> = priority
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                if priority.is_empty() {
                    anyhow::bail!("Priority list must name at least one provider");
                }
                let state = ctx
                    .policy
                    .modify_state(|current, prefs| {
                        *current = priority;
                        if clear_preferences {
                            prefs.clear();
                        }
                        true
                    })
                    .await?;
                println!("Provider priority: {}", state.provider_priority.join(", "));
            }
            PolicyCommands::Prefer { task_type, provider, model } => {
                ctx.policy.set_task_preference(&task_type, &provider, &model).await?;
                println!("{} -> {}/{}", task_type, provider, model);
            }
        },
        Commands::Scenarios => print_scenarios(),
        Commands::Config { command } => run_config(command, None)?,
    }

    Ok(())
}

fn print_scenarios() {
    for scenario in default_scenarios() {
        println!("{} ({})", scenario.id, scenario.complexity);
        println!("  {}", scenario.description);
        println!(
            "  thresholds: reward >= {:.2}, latency <= {:.0}ms, success rate >= {:.0}%",
            scenario.thresholds.min_reward,
            scenario.thresholds.max_latency_ms,
            scenario.thresholds.min_success_rate * 100.0
        );
        println!("  prompts: {}", scenario.test_prompts.len());
    }
}

fn run_config(command: ConfigCommands, explicit: Option<&PathBuf>) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = load_config(explicit)?;
            println!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
        ConfigCommands::Path => {
            let path = match explicit {
                Some(path) => path.clone(),
                None => config::config_path()?,
            };
            println!("{}", path.display());
        }
        ConfigCommands::Init { force } => {
            let path = match explicit {
                Some(path) => path.clone(),
                None => config::config_path()?,
            };
            if path.exists() && !force {
                println!("Config already exists at {} (use --force to overwrite)", path.display());
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            std::fs::write(&path, config::default_config_toml()).context("Failed to write config file")?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
