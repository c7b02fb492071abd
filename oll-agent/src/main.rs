use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use oll_agent::clients::{LLMClient, OllamaClient};
use oll_agent::config::Config;
use oll_agent::core::{AgentError, GenerationOptions, Orchestrator, Outcome};
use oll_agent::dispatch::{DispatchOptions, ToolDispatcher};
use oll_agent::history::Turn;
use oll_agent::mcp::{McpSessionManager, ServerSpec};
use oll_agent::output::{ConsoleOperator, Transcript, Verbosity};
use oll_agent::prompts::{build_user_turn, default_system_instruction, merge_stdin};
use oll_agent::tools::{ToolRegistry, parse_declarations};

#[derive(Parser, Debug)]
#[command(name = "oll")]
#[command(version)]
#[command(about = "Chat with local Ollama models, with local and MCP tools", long_about = None)]
struct Args {
    #[arg(short, long, help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Model to use")]
    model: Option<String>,

    #[arg(short, long, help = "System instruction")]
    system: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    top_k: Option<i32>,

    #[arg(long, help = "Stop sequence (repeatable)")]
    stop: Vec<String>,

    #[arg(long, help = "Context window size")]
    context_window: Option<u32>,

    #[arg(short, long, help = "Prompt; piped input is prepended")]
    prompt: Option<String>,

    #[arg(short = 'f', long = "filepath", help = "File or directory to attach (repeatable)")]
    filepaths: Vec<PathBuf>,

    #[arg(short = 'j', long = "json", help = "Output JSON schema")]
    output_schema: Option<String>,

    #[arg(long)]
    with_thinking: bool,

    #[arg(long)]
    hide_reasoning: bool,

    #[arg(short, long, help = "Tool declarations as a JSON array")]
    tools: Option<String>,

    #[arg(long, value_parser = parse_callback, help = "Tool callback as name=callback (repeatable)")]
    tool_callbacks: Vec<(String, String)>,

    #[arg(long, value_parser = parse_confirmation, help = "Confirmation as name=bool (repeatable)")]
    tool_callbacks_confirm: Vec<(String, bool)>,

    #[arg(long)]
    show_callback_results: bool,

    #[arg(long)]
    recurse_on_callback_results: bool,

    #[arg(long)]
    force_call_destructive_tools: bool,

    #[arg(long = "mcp-streamable-url", help = "Streamable HTTP MCP server URL (repeatable)")]
    mcp_streamable_urls: Vec<String>,

    #[arg(long = "mcp-stdio-command", help = "Stdio MCP server command line (repeatable)")]
    mcp_stdio_commands: Vec<String>,

    #[arg(short, long, help = "List local models")]
    list_models: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_callback(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, spec)| (name.to_string(), spec.to_string()))
        .ok_or_else(|| format!("expected name=callback, got '{}'", s))
}

fn parse_confirmation(s: &str) -> Result<(String, bool), String> {
    let (name, value) = parse_callback(s)?;
    let value = value
        .parse::<bool>()
        .map_err(|_| format!("expected name=true|false, got '{}'", s))?;
    Ok((name, value))
}

fn init_tracing(verbose: u8) {
    let fallback = if verbose >= 3 { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn read_piped_stdin() -> Result<Option<String>> {
    if std::io::stdin().is_terminal() {
        return Ok(None);
    }

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read standard input")?;
    Ok(Some(input))
}

async fn list_models(client: &dyn LLMClient) -> Result<()> {
    let models = client.list_models().await.context("failed to list models")?;
    for model in models {
        println!("{}", model.name);
    }
    Ok(())
}

fn server_specs(args: &Args) -> Vec<ServerSpec> {
    args.mcp_streamable_urls
        .iter()
        .cloned()
        .map(ServerSpec::Streamable)
        .chain(args.mcp_stdio_commands.iter().cloned().map(ServerSpec::Stdio))
        .collect()
}

async fn generate(
    args: &Args,
    manager: &mut McpSessionManager,
    mut registry: ToolRegistry,
    options: GenerationOptions,
    prompt: Turn,
) -> Result<Outcome, AgentError> {
    for spec in server_specs(args) {
        let session = manager.connect(&spec).await?;
        let tools = manager.list_tools(session.as_ref()).await?;
        registry.register_remote(session.server_key(), tools)?;
    }

    let client: Arc<dyn LLMClient> = Arc::new(OllamaClient::from_env());
    let dispatcher = ToolDispatcher::new(
        Arc::new(registry),
        manager.sessions(),
        Arc::new(ConsoleOperator),
        DispatchOptions {
            force_destructive: args.force_call_destructive_tools,
            show_results: args.show_callback_results,
            recurse: args.recurse_on_callback_results,
        },
    );

    let transcript = Transcript::stdout(Verbosity::from_count(args.verbose));
    Orchestrator::new(client, Arc::new(dispatcher), options)
        .run(prompt, transcript)
        .await
}

async fn run(args: Args) -> Result<ExitCode> {
    let prompt = merge_stdin(read_piped_stdin().await?, args.prompt.clone());

    if prompt.is_some() == args.list_models {
        let problem = if args.list_models {
            "Both generation and listing models were requested"
        } else {
            "No task was requested"
        };
        eprintln!("{}", problem.red());
        let _ = Args::command().print_help();
        return Ok(ExitCode::FAILURE);
    }

    if args.list_models {
        list_models(&OllamaClient::from_env()).await?;
        return Ok(ExitCode::SUCCESS);
    }
    let prompt = prompt.unwrap_or_default();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).await?;

    let model = args.model.clone().unwrap_or_else(|| config.model().to_string());
    let system = args
        .system
        .clone()
        .or_else(|| config.system_instruction.clone())
        .unwrap_or_else(|| default_system_instruction(&model));

    let mut options = GenerationOptions::new(&model, system);
    if let Some(schema) = &args.output_schema {
        options = options.with_output_schema(schema)?;
    }
    if let Some(temperature) = args.temperature {
        options.temperature = temperature;
    }
    if let Some(top_p) = args.top_p {
        options.top_p = top_p;
    }
    if let Some(top_k) = args.top_k {
        options.top_k = top_k;
    }
    options.context_window = args.context_window;
    options.stop = args.stop.clone();
    options.with_thinking = args.with_thinking;
    options.hide_reasoning = args.hide_reasoning;
    options.recurse = args.recurse_on_callback_results;
    options.timeout = config.timeout();

    let declarations = match &args.tools {
        Some(json) => parse_declarations(json).map_err(AgentError::from)?,
        None => Vec::new(),
    };
    let callbacks: HashMap<String, String> = args.tool_callbacks.iter().cloned().collect();
    let confirmations: HashMap<String, bool> = args.tool_callbacks_confirm.iter().cloned().collect();
    let registry = ToolRegistry::new(declarations, &callbacks, confirmations).map_err(AgentError::from)?;

    let turn = build_user_turn(&prompt, &args.filepaths).await?;
    tracing::debug!(%model, files = args.filepaths.len(), "starting generation");

    let mut manager = McpSessionManager::new();
    let result = generate(&args, &mut manager, registry, options, turn).await;
    manager.close_all().await;

    result?;
    Ok(ExitCode::SUCCESS)
}

/// Drives `future` to completion without joining leftover blocking tasks, so a
/// worker abandoned on a terminal read cannot keep the process alive.
fn block_on_detached<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_background();
    Ok(output)
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(args.verbose);

    let result = block_on_detached(run(args))
        .context("failed to start the async runtime")
        .and_then(|result| result);
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", format!("Error: {:#}", e).red());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callback() {
        assert_eq!(
            parse_callback("categorize=@format=Category: {{.category}}"),
            Ok(("categorize".to_string(), "@format=Category: {{.category}}".to_string()))
        );
        assert!(parse_callback("=x").is_err());
        assert!(parse_callback("noequals").is_err());
    }

    #[test]
    fn test_parse_confirmation() {
        assert_eq!(parse_confirmation("add=true"), Ok(("add".to_string(), true)));
        assert!(parse_confirmation("add=maybe").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "oll",
            "-p",
            "hi",
            "--tool-callbacks",
            "add=/bin/add",
            "--tool-callbacks-confirm",
            "add=true",
            "--mcp-stdio-command",
            "npx server --flag",
            "-vv",
        ])
        .unwrap();

        assert_eq!(args.prompt.as_deref(), Some("hi"));
        assert_eq!(args.tool_callbacks, vec![("add".to_string(), "/bin/add".to_string())]);
        assert_eq!(args.tool_callbacks_confirm, vec![("add".to_string(), true)]);
        assert_eq!(server_specs(&args), vec![ServerSpec::Stdio("npx server --flag".to_string())]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_block_on_detached_does_not_wait_for_blocking_tasks() {
        let started = std::time::Instant::now();

        let output = block_on_detached(async {
            drop(tokio::task::spawn_blocking(|| {
                std::thread::sleep(std::time::Duration::from_secs(30))
            }));
            tokio::task::yield_now().await;
            7
        })
        .unwrap();

        assert_eq!(output, 7);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }
}
