use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cryptoflow_agent::{
    comparison_table, market_workflow, History, MarketContext, MarketState, ReasoningLoop,
    RunOptions,
};
use cryptoflow_core::config::AppConfig;
use cryptoflow_core::event::EventBus;
use cryptoflow_core::types::AgentEvent;
use cryptoflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "cryptoflow", version, about = "Tool-using crypto analysis agent and workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cryptoflow.toml")]
    config: PathBuf,

    /// Print model output and every step as it happens
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with the reasoning agent
    Ask {
        /// The question to answer
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Ask questions interactively, one fresh reasoning run per question
    Repl,
    /// Run the market workflow for one or more symbols
    Analyze {
        /// Ticker symbols, e.g. `BTC ETH` or `BTC,ETH`
        #[arg(required = true)]
        symbols: Vec<String>,
        /// Requested action recorded in the report
        #[arg(long, default_value = "analyze")]
        action: String,
    },
    /// List the available tools
    Tools,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cryptoflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "cryptoflow", &mut io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let tools = Arc::new(ToolRegistry::builder().with_builtins(&config).build()?);

    match cli.command {
        Commands::Tools => {
            for def in tools.definitions() {
                let marker = if def.side_effects { "*" } else { " " };
                println!("{marker} {:<22} {}", def.name, def.description);
            }
            println!("\n* has side effects");
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
        Commands::Ask { query } => ask(config, tools, &query.join(" "), cli.verbose).await,
        Commands::Repl => repl(config, tools, cli.verbose).await,
        Commands::Analyze { symbols, action } => {
            let symbols = parse_symbols(&symbols);
            if symbols.is_empty() {
                anyhow::bail!("no symbols given");
            }
            analyze(config, tools, &symbols, &action, cli.verbose).await
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupted, stopping...");
        token.cancel();
    });
}

fn spawn_printer(event_bus: &EventBus, verbose: bool) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(text) if verbose => {
                    eprint!("{text}");
                    io::stderr().flush().ok();
                }
                AgentEvent::ToolStart { name, input } => {
                    eprintln!("\n[tool: {name}] {}", truncate(&input.to_string(), 120));
                }
                AgentEvent::ToolEnd { name, result } => {
                    let status = if result.is_error { "ERROR" } else { "ok" };
                    eprintln!("[{name}: {status}] {}", truncate(&result.content, 200));
                }
                AgentEvent::RunComplete {
                    total_turns,
                    input_tokens,
                    output_tokens,
                    ..
                } => {
                    eprintln!(
                        "\n[done: {total_turns} turns, {input_tokens}in/{output_tokens}out tokens]"
                    );
                }
                AgentEvent::RunError { error } => eprintln!("\n[error: {error}]"),
                AgentEvent::NodeStarted { node, .. } => eprintln!("[{node}] ..."),
                AgentEvent::NodeCompleted {
                    node, elapsed_ms, ..
                } => eprintln!("[{node}] done in {elapsed_ms}ms"),
                AgentEvent::WorkflowComplete { trace, .. } => {
                    eprintln!("[workflow: {}]", trace.join(" -> "));
                }
                _ => {}
            }
        }
    })
}

async fn ask(
    config: AppConfig,
    tools: Arc<ToolRegistry>,
    query: &str,
    verbose: bool,
) -> anyhow::Result<()> {
    let llm = cryptoflow_llm::build_client(&config)?;
    let event_bus = Arc::new(EventBus::default());
    let printer = spawn_printer(&event_bus, verbose);

    let agent = ReasoningLoop::new(config, llm, tools, event_bus);
    cancel_on_ctrl_c(agent.cancel_token());

    let outcome = agent.run_with_history(query).await;
    printer.abort();

    match outcome {
        Ok((answer, history)) => {
            if verbose {
                print_history(&history);
            }
            println!("\n{answer}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Agent run failed");
            Err(e.into())
        }
    }
}

fn print_history(history: &History) {
    eprintln!("\n--- {} turn(s) ---", history.len());
    for (i, turn) in history.turns().iter().enumerate() {
        eprintln!("{}. Thought: {}", i + 1, turn.thought);
        if let Some(action) = &turn.action {
            eprintln!("   Action: {} {}", action.name, action.input());
        }
        if let Some(obs) = &turn.observation {
            eprintln!("   Observation: {}", truncate(&obs.content, 200));
        }
    }
}

#[derive(Debug, PartialEq)]
enum ReplInput {
    Quit,
    Skip,
    Ask(String),
}

fn parse_repl_line(line: &str) -> ReplInput {
    let line = line.trim();
    match line {
        "" => ReplInput::Skip,
        "exit" | "quit" | "/exit" | "/quit" | "/q" => ReplInput::Quit,
        _ => ReplInput::Ask(line.to_string()),
    }
}

async fn repl(config: AppConfig, tools: Arc<ToolRegistry>, verbose: bool) -> anyhow::Result<()> {
    let llm = cryptoflow_llm::build_client(&config)?;
    let event_bus = Arc::new(EventBus::default());
    let printer = spawn_printer(&event_bus, verbose);
    let agent = ReasoningLoop::new(config, llm, tools, event_bus);

    println!("cryptoflow - ask about the market. Type 'exit' or press Ctrl-D to quit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let question = match parse_repl_line(&input) {
            ReplInput::Quit => break,
            ReplInput::Skip => continue,
            ReplInput::Ask(q) => q,
        };

        // Ctrl-C drops the in-flight run and returns to the prompt.
        let outcome = tokio::select! {
            outcome = agent.run_with_history(&question) => outcome,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[interrupted]");
                continue;
            }
        };
        match outcome {
            Ok((answer, history)) => {
                if verbose {
                    print_history(&history);
                }
                println!("\n{answer}\n");
            }
            Err(e) => {
                error!(error = %e, "Agent run failed");
                eprintln!("Error: {e}\n");
            }
        }
    }

    printer.abort();
    println!("Goodbye!");
    Ok(())
}

/// Split comma-separated arguments into distinct uppercase symbols.
fn parse_symbols(args: &[String]) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for sym in args.iter().flat_map(|a| a.split(',')) {
        let sym = sym.trim().to_ascii_uppercase();
        if !sym.is_empty() && !symbols.contains(&sym) {
            symbols.push(sym);
        }
    }
    symbols
}

async fn analyze(
    config: AppConfig,
    tools: Arc<ToolRegistry>,
    symbols: &[String],
    action: &str,
    verbose: bool,
) -> anyhow::Result<()> {
    let llm: Arc<dyn cryptoflow_core::traits::LlmClient> =
        Arc::from(cryptoflow_llm::build_client(&config)?);
    let event_bus = Arc::new(EventBus::default());
    let printer = spawn_printer(&event_bus, verbose);

    let ctx = MarketContext::new(&config, llm, tools);
    let graph = market_workflow(&ctx)?.with_event_bus(event_bus);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut finished = Vec::new();
    let mut failed = Vec::new();
    for symbol in symbols {
        let state = MarketState::new(symbol.as_str()).with_action(action);
        let outcome = graph
            .run_with(state, RunOptions::new().with_cancel(cancel.clone()))
            .await;

        match outcome {
            Ok(result) => {
                let state = result.state;
                println!(
                    "\n{}: {} ({:.0}% confidence)",
                    state.symbol,
                    state.recommendation,
                    state.confidence * 100.0
                );
                for line in &state.reasoning {
                    println!("  - {line}");
                }
                if !state.notification_sent {
                    eprintln!("[notification not delivered]");
                }
                finished.push(state);
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, trace = ?e.trace(), "Workflow failed");
                let stop = e.is_cancelled();
                failed.push(symbol.clone());
                if stop {
                    break;
                }
            }
        }
    }
    printer.abort();

    if symbols.len() > 1 && !finished.is_empty() {
        println!("\n{}", comparison_table(&finished));
    }
    match failed.len() {
        0 => Ok(()),
        1 if symbols.len() == 1 => anyhow::bail!("analysis of {} failed", failed[0]),
        _ => anyhow::bail!("analysis failed for: {}", failed.join(", ")),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repl_line() {
        assert_eq!(parse_repl_line("  \n"), ReplInput::Skip);
        assert_eq!(parse_repl_line("exit\n"), ReplInput::Quit);
        assert_eq!(parse_repl_line("quit"), ReplInput::Quit);
        assert_eq!(parse_repl_line("/q"), ReplInput::Quit);
        assert_eq!(
            parse_repl_line(" What is BTC doing? \n"),
            ReplInput::Ask("What is BTC doing?".into())
        );
        assert_eq!(
            parse_repl_line("should I exit ETH?"),
            ReplInput::Ask("should I exit ETH?".into())
        );
    }

    #[test]
    fn test_parse_symbols() {
        let args = vec!["btc,eth".to_string(), " sol ".to_string(), "BTC".to_string()];
        assert_eq!(parse_symbols(&args), vec!["BTC", "ETH", "SOL"]);
        assert!(parse_symbols(&[",".to_string()]).is_empty());
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("café au lait", 4), "café");
        assert_eq!(truncate("btc", 10), "btc");
    }

    #[test]
    fn test_cli_parses_symbols() {
        let cli = Cli::try_parse_from(["cryptoflow", "analyze", "btc", "eth", "--action", "review"])
            .unwrap();
        match cli.command {
            Commands::Analyze { symbols, action } => {
                assert_eq!(symbols, vec!["btc", "eth"]);
                assert_eq!(action, "review");
            }
            _ => panic!("expected analyze"),
        }
        assert!(Cli::try_parse_from(["cryptoflow", "analyze"]).is_err());
    }
}
