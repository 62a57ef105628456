//! stratloop - generate, run and repair trading strategies from plain requests
//!
//! ## Commands
//!
//! - `chat`: interactive session with slash commands
//! - `generate`: one request, run until it works or the loop gives up
//! - `run`: run (and repair) an existing strategy file
//! - `config`: print the effective configuration

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stratloop_core::{
    ForgeConfig, LoopEvent, ProcessRunner, RepairController, Reply, ResponseMode, StrategySession,
    TradingParams,
};
use stratloop_llm::{HttpTemplateSource, OpenAiChatClient, PromptLibrary};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stratloop")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate, run and repair trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "STRATLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Model identifier (overrides GPT_MODEL)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Chat endpoint base URL (overrides OPENAI_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Fix attempts allowed per request
    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    /// Wait for whole responses instead of streaming them
    #[arg(long, global = true)]
    no_stream: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session
    Chat,

    /// Generate a strategy for REQUEST and run it until it works
    Generate {
        /// What the strategy should do
        request: String,

        /// Instrument symbol
        #[arg(long)]
        symbol: Option<String>,

        /// Backtest start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Backtest end date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Bar period, e.g. 1d or 15m
        #[arg(long)]
        period: Option<String>,

        /// Save the strategy when it succeeds, optionally under NAME
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        save: Option<String>,
    },

    /// Run an existing strategy file, repairing it if it fails
    Run {
        /// Strategy source file
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stratloop_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Chat => cmd_chat(&config).await,
        Commands::Generate {
            request,
            symbol,
            start,
            end,
            period,
            save,
        } => {
            let params = params_from_flags(
                &config.params,
                symbol.as_deref(),
                start.as_deref(),
                end.as_deref(),
                period.as_deref(),
            );
            cmd_generate(&config, request, params, save.as_deref()).await
        }
        Commands::Run { file } => cmd_run(&config, file).await,
    }
}

/// File and environment configuration with command-line flags applied last.
fn load_config(cli: &Cli) -> Result<ForgeConfig> {
    let config = ForgeConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    Ok(apply_overrides(cli, config))
}

fn apply_overrides(cli: &Cli, mut config: ForgeConfig) -> ForgeConfig {
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    if let Some(api_url) = &cli.api_url {
        config.llm.api_url = api_url.clone();
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.controller.loop_config.max_iterations = max_iterations;
    }
    if cli.no_stream {
        config.controller.mode = ResponseMode::Buffered;
    }
    config
}

fn params_from_flags(
    base: &TradingParams,
    symbol: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
    period: Option<&str>,
) -> TradingParams {
    let mut params = base.clone();
    if let Some(symbol) = symbol {
        params.symbol = symbol.to_string();
    }
    if let Some(start) = start {
        params.start_date = start.replace('/', "-");
    }
    if let Some(end) = end {
        params.end_date = end.replace('/', "-");
    }
    if let Some(period) = period {
        params.period = period.to_string();
    }
    params
}

fn build_session(config: &ForgeConfig) -> Result<StrategySession> {
    if config.llm.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; requests will fail until it is");
    }
    let service = OpenAiChatClient::new(config.llm.clone()).context("Failed to build chat client")?;

    let prompts = if config.use_prompt_server {
        let source = HttpTemplateSource::new(config.prompt_server.clone())
            .context("Failed to build prompt server client")?;
        PromptLibrary::new(Arc::new(source))
    } else {
        PromptLibrary::offline()
    };

    let runner = ProcessRunner::new(config.runner.clone()).context("Invalid runner configuration")?;
    let controller = RepairController::new(
        Arc::new(service),
        Arc::new(runner),
        Arc::new(prompts),
        config.controller.clone(),
    )
    .context("Invalid controller configuration")?;

    info!(
        model = %config.llm.model,
        interpreter = %config.runner.interpreter,
        max_iterations = config.controller.loop_config.max_iterations,
        "session ready"
    );
    Ok(
        StrategySession::new(controller, config.params.clone(), config.output_dir.clone())
            .with_session_dir(config.session_dir.clone()),
    )
}

/// Prints streamed responses and strategy output as they arrive.
fn console_sink() -> impl FnMut(LoopEvent<'_>) + Send {
    let mut mid_line = false;
    move |event| {
        let mut stdout = std::io::stdout();
        match event {
            LoopEvent::ResponseChunk(chunk) => {
                print!("{}", chunk);
                stdout.flush().ok();
                mid_line = !chunk.ends_with('\n');
            }
            LoopEvent::OutputLine(line) => {
                if std::mem::take(&mut mid_line) {
                    println!();
                }
                println!("  | {}", line);
            }
            LoopEvent::Status(status) => {
                if std::mem::take(&mut mid_line) {
                    println!();
                }
                println!("== {}", status);
            }
        }
    }
}

fn print_reply(reply: &Reply, streamed: bool) {
    let marker = if reply.success { "ok" } else { "failed" };
    println!();
    println!("[{}] {}", marker, reply.message);
    for path in &reply.payload.derived_paths {
        println!("  result file: {}", path.display());
    }
    if let Some(path) = &reply.payload.path {
        println!("  file: {}", path.display());
    }
    if !streamed {
        if let Some(analysis) = &reply.payload.analysis {
            println!("\nAnalysis:\n{}", analysis);
        }
    }
}

/// Await `operation` unless Ctrl-C arrives first. Dropping the operation
/// kills any running strategy process.
async fn interruptible<F>(operation: F) -> Option<Reply>
where
    F: std::future::Future<Output = Reply>,
{
    tokio::select! {
        reply = operation => Some(reply),
        _ = tokio::signal::ctrl_c() => {
            println!("\ninterrupted");
            None
        }
    }
}

fn cmd_config(config: &ForgeConfig) -> Result<()> {
    let text = config
        .to_toml_string()
        .context("Failed to serialize configuration")?;
    print!("{}", text);
    Ok(())
}

async fn cmd_generate(
    config: &ForgeConfig,
    request: &str,
    params: TradingParams,
    save: Option<&str>,
) -> Result<()> {
    let mut session = build_session(config)?;
    let streamed = config.controller.mode == ResponseMode::Streaming;
    println!("{}", params);

    let mut sink = console_sink();
    let Some(reply) = interruptible(session.generate(request, params, &mut sink)).await else {
        bail!("Interrupted");
    };
    print_reply(&reply, streamed);

    if !reply.success {
        bail!("Strategy did not reach a successful run");
    }
    if let Some(name) = save {
        let name = Some(name).filter(|n| !n.is_empty());
        let saved = session.save_current_artifact(name);
        print_reply(&saved, streamed);
    }
    Ok(())
}

async fn cmd_run(config: &ForgeConfig, file: &Path) -> Result<()> {
    let mut session = build_session(config)?;
    let streamed = config.controller.mode == ResponseMode::Streaming;

    let loaded = session.load_strategy_file(file);
    if !loaded.success {
        bail!("{}", loaded.message);
    }

    let mut sink = console_sink();
    let Some(reply) = interruptible(session.run(&mut sink)).await else {
        bail!("Interrupted");
    };
    print_reply(&reply, streamed);
    if !reply.success {
        bail!("Strategy did not reach a successful run");
    }
    Ok(())
}

/// A line typed into the interactive session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Generate(String),
    Run,
    Modify(String),
    Save(Option<String>),
    Results,
    Reset,
    Params(String),
    Stream(bool),
    History(PathBuf),
    Load(PathBuf),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Generate(line.to_string());
    };
    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    match name {
        "run" => ReplCommand::Run,
        "modify" if !rest.is_empty() => ReplCommand::Modify(rest.to_string()),
        "modify" => ReplCommand::Invalid("usage: /modify <what to change>".to_string()),
        "save" => ReplCommand::Save(Some(rest).filter(|r| !r.is_empty()).map(str::to_string)),
        "results" => ReplCommand::Results,
        "reset" => ReplCommand::Reset,
        "params" => ReplCommand::Params(rest.to_string()),
        "stream" => ReplCommand::Stream(true),
        "nostream" => ReplCommand::Stream(false),
        "history" if !rest.is_empty() => ReplCommand::History(PathBuf::from(rest)),
        "history" => ReplCommand::Invalid("usage: /history <file>".to_string()),
        "load" if !rest.is_empty() => ReplCommand::Load(PathBuf::from(rest)),
        "load" => ReplCommand::Invalid("usage: /load <file>".to_string()),
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        other => ReplCommand::Invalid(format!("unknown command /{}; try /help", other)),
    }
}

const HELP: &str = "\
Type a strategy request to generate and run a new strategy.

  /run                 run the current strategy again
  /modify <text>       change the current strategy and run it
  /save [name]         save the current strategy
  /results             show the output of the last run
  /reset               clear the conversation (the strategy is kept)
  /params [k=v ...]    show or change symbol=, start=, end=, period=
  /stream, /nostream   stream responses or wait for them
  /history <file>      save the conversation as JSON
  /load <file>         load a conversation (.json) or a strategy file
  /quit                leave";

async fn cmd_chat(config: &ForgeConfig) -> Result<()> {
    let mut session = build_session(config)?;
    println!("stratloop {} - /help for commands", env!("CARGO_PKG_VERSION"));
    println!("{}", session.params());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("stratloop> ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        if !handle_command(&mut session, parse_command(&line)).await {
            break;
        }
    }
    Ok(())
}

/// Execute one REPL command. Returns false when the session should end.
async fn handle_command(session: &mut StrategySession, command: ReplCommand) -> bool {
    let streamed = session.controller().mode() == ResponseMode::Streaming;
    let mut sink = console_sink();

    let reply = match command {
        ReplCommand::Empty => return true,
        ReplCommand::Quit => return false,
        ReplCommand::Help => {
            println!("{}", HELP);
            return true;
        }
        ReplCommand::Invalid(message) => {
            println!("{}", message);
            return true;
        }
        ReplCommand::Params(text) => {
            if !text.is_empty() && session.params_mut().apply_command(&text) == 0 {
                println!("no parameters recognised in '{}'", text);
            }
            println!("{}", session.params());
            return true;
        }
        ReplCommand::Stream(on) => {
            let mode = if on {
                ResponseMode::Streaming
            } else {
                ResponseMode::Buffered
            };
            session.controller_mut().set_mode(mode);
            println!("response mode: {:?}", mode);
            return true;
        }
        ReplCommand::Generate(request) => {
            let params = session.params().clone();
            interruptible(session.generate(&request, params, &mut sink)).await
        }
        ReplCommand::Run => interruptible(session.run(&mut sink)).await,
        ReplCommand::Modify(request) => interruptible(session.modify(&request, &mut sink)).await,
        ReplCommand::Save(name) => Some(session.save_current_artifact(name.as_deref())),
        ReplCommand::Results => {
            let reply = session.fetch_last_results();
            print_reply(&reply, false);
            if let Some(output) = &reply.payload.output {
                println!("\n{}", output);
            }
            return true;
        }
        ReplCommand::Reset => Some(session.reset_conversation()),
        ReplCommand::History(path) => Some(session.save_conversation(&path)),
        ReplCommand::Load(path) => {
            let is_conversation = path.extension().map_or(false, |ext| ext == "json");
            if is_conversation {
                Some(session.load_conversation(&path))
            } else {
                Some(session.load_strategy_file(&path))
            }
        }
    };

    if let Some(reply) = reply {
        if !streamed {
            if let Some(output) = &reply.payload.output {
                println!("{}", output);
            }
        }
        print_reply(&reply, streamed);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line_is_a_generation_request() {
        assert_eq!(
            parse_command("  generate a 5/20 crossover strategy "),
            ReplCommand::Generate("generate a 5/20 crossover strategy".to_string())
        );
        assert_eq!(parse_command("   "), ReplCommand::Empty);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(parse_command("/run"), ReplCommand::Run);
        assert_eq!(
            parse_command("/modify use a 10 bar fast average"),
            ReplCommand::Modify("use a 10 bar fast average".to_string())
        );
        assert_eq!(parse_command("/save"), ReplCommand::Save(None));
        assert_eq!(
            parse_command("/save dual_ma"),
            ReplCommand::Save(Some("dual_ma".to_string()))
        );
        assert_eq!(
            parse_command("/params symbol=au888 period=1h"),
            ReplCommand::Params("symbol=au888 period=1h".to_string())
        );
        assert_eq!(parse_command("/nostream"), ReplCommand::Stream(false));
        assert_eq!(
            parse_command("/load saved/chat.json"),
            ReplCommand::Load(PathBuf::from("saved/chat.json"))
        );
        assert_eq!(parse_command("/quit"), ReplCommand::Quit);
    }

    #[test]
    fn test_slash_commands_missing_arguments() {
        assert!(matches!(parse_command("/modify"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/history"), ReplCommand::Invalid(_)));
        assert!(matches!(parse_command("/frobnicate"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn test_flags_override_configuration() {
        let cli = Cli::try_parse_from([
            "stratloop",
            "--model",
            "deepseek-chat",
            "--max-iterations",
            "2",
            "--no-stream",
            "chat",
        ])
        .unwrap();
        let config = apply_overrides(&cli, ForgeConfig::default());

        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.controller.loop_config.max_iterations, 2);
        assert_eq!(config.controller.mode, ResponseMode::Buffered);
    }

    #[test]
    fn test_generate_flags_override_params() {
        let cli = Cli::try_parse_from([
            "stratloop",
            "generate",
            "dual moving average",
            "--symbol",
            "au888",
            "--start",
            "2023/01/01",
            "--save",
        ])
        .unwrap();
        let Commands::Generate {
            request,
            symbol,
            start,
            end,
            period,
            save,
        } = cli.command
        else {
            panic!("expected generate");
        };

        let params = params_from_flags(
            &TradingParams::default(),
            symbol.as_deref(),
            start.as_deref(),
            end.as_deref(),
            period.as_deref(),
        );
        assert_eq!(request, "dual moving average");
        assert_eq!(params.symbol, "au888");
        assert_eq!(params.start_date, "2023-01-01");
        assert_eq!(params.end_date, TradingParams::default().end_date);
        assert_eq!(save.as_deref(), Some(""));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratloop.toml");
        std::fs::write(&path, "output_dir = \"out\"\n\n[runner]\ninterpreter = \"python\"\n")
            .unwrap();

        let config = ForgeConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.runner.interpreter, "python");
    }
}
