//! conduit - drive AI coding agents from the command line.
//!
//! `conduit run` starts an agent and prints every [`RunEvent`] as one JSON
//! line on stdout. `conduit parse` replays a captured stdout file through an
//! agent's parser, which is handy when a new CLI release changes its output.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use conduit_core::acp::{AcpAgentConfig, AcpAgentProcess};
use conduit_core::agents::errors::BuiltinPatterns;
use conduit_core::agents::parser::{parser_for, shared};
use conduit_core::config::{load_or_default, TomlConfigSource};
use conduit_core::event_bus::EventReceiver;
use conduit_core::{AgentKind, AgentRun, LineAgentProcess, LineSpawnConfig, NormalizedEvent, RunEvent};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version)]
#[command(about = "Drive AI coding agents and print normalized events")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent and print its events as JSON lines
    Run {
        /// Agent type: claude-code, codex, gemini-cli, copilot, opencode, acp
        #[arg(short, long)]
        agent: AgentKind,

        /// Agent binary (defaults to the agent's usual command name)
        #[arg(short, long)]
        binary: Option<String>,

        /// Prompt to send
        #[arg(short, long)]
        prompt: Option<String>,

        /// Working directory for the agent
        #[arg(long)]
        cwd: Option<String>,

        /// Session to resume
        #[arg(long)]
        resume: Option<String>,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,

        /// Write raw agent traffic to this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Read further prompts from stdin (ACP agents)
        #[arg(short, long)]
        interactive: bool,

        /// Arguments passed to the agent verbatim, replacing the defaults
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Replay a captured stdout file through an agent's parser
    Parse {
        /// Agent type: claude-code or codex
        #[arg(short, long)]
        agent: AgentKind,

        /// File holding the agent's stdout, one JSON object per line
        file: PathBuf,

        /// Classify this exit code after the last line
        #[arg(long)]
        exit_code: Option<i32>,

        /// Captured stderr to use for exit classification
        #[arg(long)]
        stderr: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            agent,
            binary,
            prompt,
            cwd,
            resume,
            model,
            log_dir,
            interactive,
            args,
        } => {
            let options = RunOptions {
                agent,
                binary,
                prompt,
                cwd,
                resume,
                model,
                log_dir,
                interactive,
                args,
            };
            run(options).await
        }
        Commands::Parse {
            agent,
            file,
            exit_code,
            stderr,
        } => parse(agent, file, exit_code, stderr).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    }
}

struct RunOptions {
    agent: AgentKind,
    binary: Option<String>,
    prompt: Option<String>,
    cwd: Option<String>,
    resume: Option<String>,
    model: Option<String>,
    log_dir: Option<PathBuf>,
    interactive: bool,
    args: Vec<String>,
}

/// Agents with a line parser run as plain processes; the rest speak ACP.
fn is_line_based(agent: AgentKind) -> bool {
    matches!(agent, AgentKind::ClaudeCode | AgentKind::Codex)
}

fn default_binary(agent: AgentKind) -> Option<&'static str> {
    match agent {
        AgentKind::ClaudeCode => Some("claude"),
        AgentKind::Codex => Some("codex"),
        AgentKind::GeminiCli => Some("gemini"),
        AgentKind::Copilot => Some("copilot"),
        AgentKind::OpenCode => Some("opencode"),
        AgentKind::Acp => None,
    }
}

fn default_acp_args(agent: AgentKind) -> Vec<String> {
    let args: &[&str] = match agent {
        AgentKind::GeminiCli => &["--experimental-acp"],
        AgentKind::Copilot => &["--acp"],
        AgentKind::OpenCode => &["acp"],
        _ => &[],
    };
    args.iter().map(|s| s.to_string()).collect()
}

fn default_line_args(options: &RunOptions, model: Option<&str>) -> CliResult<Vec<String>> {
    let prompt = options
        .prompt
        .clone()
        .ok_or("a --prompt is required unless agent arguments are given")?;
    let mut args = Vec::new();
    match options.agent {
        AgentKind::ClaudeCode => {
            args.extend(["-p", prompt.as_str(), "--output-format", "stream-json", "--verbose"].map(String::from));
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if let Some(resume) = &options.resume {
                args.extend(["--resume".to_string(), resume.clone()]);
            }
        }
        AgentKind::Codex => {
            args.extend(["exec".to_string(), "--json".to_string()]);
            if let Some(model) = model {
                args.extend(["-m".to_string(), model.to_string()]);
            }
            if options.resume.is_some() {
                log::warn!("--resume is ignored for codex exec");
            }
            args.push(prompt);
        }
        other => return Err(format!("{} is not a line-based agent", other).into()),
    }
    Ok(args)
}

async fn run(options: RunOptions) -> CliResult<i32> {
    let agent = options.agent;
    let binary = options
        .binary
        .clone()
        .or_else(|| default_binary(agent).map(str::to_string))
        .ok_or("--binary is required for generic ACP agents")?;

    let config_source = Arc::new(TomlConfigSource::new());
    let settings = load_or_default(config_source.as_ref(), agent);
    let model = options.model.clone().or(settings.model);

    let process: Box<dyn AgentRun> = if is_line_based(agent) {
        let args = if options.args.is_empty() {
            default_line_args(&options, model.as_deref())?
        } else {
            options.args.clone()
        };
        let mut config = LineSpawnConfig::new(agent, binary, args).no_stdin();
        if let Some(cwd) = &options.cwd {
            config = config.working_dir(cwd.clone());
        }
        if let Some(dir) = &options.log_dir {
            config = config.log(dir.clone(), agent.as_str());
        }
        let parser = parser_for(agent, Arc::new(BuiltinPatterns), config_source)
            .ok_or_else(|| format!("No parser for {}", agent))?;
        Box::new(LineAgentProcess::new(config, shared(parser)))
    } else {
        let args = if options.args.is_empty() {
            default_acp_args(agent)
        } else {
            options.args.clone()
        };
        let mut config = AcpAgentConfig::new(binary).with_agent(agent).with_args(args);
        if let Some(cwd) = &options.cwd {
            config = config.with_working_dir(cwd.clone());
        }
        if let Some(prompt) = &options.prompt {
            config = config.with_initial_prompt(prompt.clone());
        }
        if let Some(resume) = &options.resume {
            config = config.with_resume_session(resume.clone());
        }
        if let Some(dir) = &options.log_dir {
            config = config.with_log(dir.clone(), agent.as_str());
        }
        if options.prompt.is_none() && !options.interactive {
            return Err("ACP agents need --prompt or --interactive".into());
        }
        Box::new(AcpAgentProcess::new(config))
    };

    let events = process.subscribe();
    process.start().await;

    let acp = !is_line_based(agent);
    let code = pump(process.as_ref(), events, acp, options.interactive, options.prompt.is_some()).await?;
    Ok(code)
}

fn print_event(event: &RunEvent) -> CliResult<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Read the next prompt from stdin and send it. False at end of input.
async fn next_prompt(process: &dyn AgentRun, stdin: &mut Lines<BufReader<Stdin>>) -> CliResult<bool> {
    loop {
        match stdin.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => {
                process.write(&line).await?;
                return Ok(true);
            }
            None => return Ok(false),
        }
    }
}

/// Print events until the run exits. Returns the exit code to use.
///
/// ACP agents stay alive between turns, so a finished turn either reads
/// the next prompt (interactive) or ends the run.
async fn pump(
    process: &dyn AgentRun,
    mut events: EventReceiver,
    acp: bool,
    interactive: bool,
    has_prompt: bool,
) -> CliResult<i32> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, stopping agent");
                process.cancel().await;
                process.kill().await;
                return Ok(130);
            }
        };
        let Some(event) = event else {
            return Ok(0);
        };
        print_event(&event)?;

        match &event {
            RunEvent::Exit(code) => return Ok(*code),
            RunEvent::Data(NormalizedEvent::Init {
                session_id: Some(_), ..
            }) if acp && !has_prompt => {
                if !next_prompt(process, &mut stdin).await? {
                    process.kill().await;
                    return Ok(0);
                }
            }
            RunEvent::Data(NormalizedEvent::Result { .. }) if acp => {
                if !interactive || !next_prompt(process, &mut stdin).await? {
                    process.kill().await;
                    return Ok(0);
                }
            }
            _ => {}
        }
    }
}

async fn parse(
    agent: AgentKind,
    file: PathBuf,
    exit_code: Option<i32>,
    stderr: Option<PathBuf>,
) -> CliResult<i32> {
    let config_source = Arc::new(TomlConfigSource::new());
    let mut parser = parser_for(agent, Arc::new(BuiltinPatterns), config_source)
        .ok_or_else(|| format!("{} has no line parser", agent))?;
    parser.reset();

    let stdout = tokio::fs::read_to_string(&file).await?;
    for line in stdout.lines() {
        for event in parser.parse_events(line) {
            print_event(&RunEvent::Data(event))?;
        }
        if let Some(error) = parser.detect_error_from_line(line) {
            print_event(&RunEvent::AgentError(error))?;
        }
    }

    if let Some(code) = exit_code {
        let stderr = match stderr {
            Some(path) => tokio::fs::read_to_string(path).await?,
            None => String::new(),
        };
        if let Some(error) = parser.detect_error_from_exit(code, &stderr, &stdout) {
            print_event(&RunEvent::AgentError(error))?;
        }
        print_event(&RunEvent::Exit(code))?;
    }
    Ok(0)
}
