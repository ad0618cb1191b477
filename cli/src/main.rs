//! Minimal interactive driver for a session: start or resume, send input,
//! poll for new items, answer approval and escalation prompts inline.

use std::io::BufRead;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::debug;

use tether_core::client::MultiProviderClient;
use tether_core::safety::ApprovalDecision;
use tether_core::safety::EscalationDecision;
use tether_core::Session;
use tether_core::SessionHandle;
use tether_protocol::ApprovalMode;
use tether_protocol::ItemPayload;
use tether_protocol::ModelConfig;
use tether_protocol::SessionConfiguration;
use tether_protocol::SessionPhase;
use tether_protocol::UserInputAnswers;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "tether", about = "Durable agentic coding session")]
struct Args {
    /// Initial message; prompted for interactively when absent.
    message: Option<String>,

    #[arg(long, default_value = "gpt-5")]
    model: String,

    #[arg(long, value_enum, default_value = "unless-trusted")]
    approval: ApprovalArg,

    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Resume the session recorded in this rollout file.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Where to record the session for later resume.
    #[arg(long)]
    rollout: Option<PathBuf>,

    #[arg(long, default_value_t = 128_000)]
    context_window: u64,

    /// Auto-compaction threshold in tokens; 0 disables.
    #[arg(long, default_value_t = 100_000)]
    auto_compact: u64,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ApprovalArg {
    Never,
    OnFailure,
    UnlessTrusted,
}

impl From<ApprovalArg> for ApprovalMode {
    fn from(arg: ApprovalArg) -> Self {
        match arg {
            ApprovalArg::Never => ApprovalMode::Never,
            ApprovalArg::OnFailure => ApprovalMode::OnFailure,
            ApprovalArg::UnlessTrusted => ApprovalMode::UnlessTrusted,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = Arc::new(MultiProviderClient::new());

    let handle = if let Some(rollout) = &args.resume {
        eprintln!("Resuming session from {}", rollout.display());
        Session::resume(rollout, client).await?
    } else {
        let cwd = match args.cwd.clone() {
            Some(cwd) => cwd,
            None => std::env::current_dir().context("cannot determine cwd")?,
        };
        let config = SessionConfiguration {
            model: ModelConfig {
                model: args.model.clone(),
                context_window: args.context_window,
                ..Default::default()
            },
            approval_mode: args.approval.into(),
            auto_compact_token_limit: args.auto_compact,
            cwd,
            session_source: "interactive-cli".into(),
            ..Default::default()
        };
        let rollout = args.rollout.clone().unwrap_or_else(default_rollout_path);
        eprintln!("Recording session to {}", rollout.display());
        Session::spawn(config, args.message.clone(), client, Some(rollout.as_path())).await?
    };

    eprintln!("Session: {}", handle.conversation_id());
    run_loop(&handle, args.message.is_some() || args.resume.is_some()).await?;

    if let Some(result) = handle.join().await {
        eprintln!(
            "Session ended. Tokens: {}, tools: {}",
            result.total_tokens.total, result.tool_calls_executed
        );
    }
    Ok(())
}

fn default_rollout_path() -> PathBuf {
    let stamp = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("tether-{}.jsonl", &stamp[..8]))
}

async fn run_loop(handle: &SessionHandle, mut watching: bool) -> anyhow::Result<()> {
    // Render whatever already exists (resume path).
    let mut last_seq = render_new_items(handle, None);

    loop {
        if !watching {
            let Some(line) = read_line("> ")? else {
                handle.shutdown().await.ok();
                return Ok(());
            };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line == "/exit" || line == "/quit" {
                handle.shutdown().await.ok();
                return Ok(());
            }
            if line == "/interrupt" {
                handle.interrupt().await.ok();
                continue;
            }
            handle.user_input(line).await?;
            watching = true;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
        last_seq = render_new_items(handle, last_seq);

        let status = handle.turn_status();
        debug!(phase = ?status.phase, "poll");
        match status.phase {
            SessionPhase::WaitingForInput => {
                watching = false;
            }
            SessionPhase::ApprovalPending => {
                let mut approved = Vec::new();
                let mut denied = Vec::new();
                for pending in &status.pending_approvals {
                    eprintln!(
                        "Approve {} {} ({})? [y/N]",
                        pending.tool_name, pending.arguments, pending.reason
                    );
                    match read_line("approve> ")? {
                        Some(answer) if answer.trim().eq_ignore_ascii_case("y") => {
                            approved.push(pending.call_id.clone());
                        }
                        _ => denied.push(pending.call_id.clone()),
                    }
                }
                handle
                    .approval_response(ApprovalDecision {
                        approved,
                        denied,
                        approved_for_session: Vec::new(),
                    })
                    .await?;
            }
            SessionPhase::EscalationPending => {
                let mut approved = Vec::new();
                let mut denied = Vec::new();
                for pending in &status.pending_escalations {
                    eprintln!(
                        "{} failed in the sandbox:\n{}\nRetry without sandbox? [y/N]",
                        pending.tool_name, pending.output
                    );
                    match read_line("retry> ")? {
                        Some(answer) if answer.trim().eq_ignore_ascii_case("y") => {
                            approved.push(pending.call_id.clone());
                        }
                        _ => denied.push(pending.call_id.clone()),
                    }
                }
                handle
                    .escalation_response(EscalationDecision { approved, denied })
                    .await?;
            }
            SessionPhase::UserInputPending => {
                let mut answers = UserInputAnswers::default();
                if let Some(pending) = &status.pending_user_input {
                    for question in &pending.questions {
                        eprintln!("{}", question.question);
                        for (index, option) in question.options.iter().enumerate() {
                            eprintln!("  {}. {}", index + 1, option.label);
                        }
                        let answer = read_line("answer> ")?.unwrap_or_default();
                        answers
                            .answers
                            .insert(question.id.clone(), answer.trim().to_string());
                    }
                }
                handle.user_input_response(answers).await?;
            }
            SessionPhase::Idle => return Ok(()),
            SessionPhase::LlmCalling | SessionPhase::ToolExecuting => {}
        }
    }
}

fn render_new_items(handle: &SessionHandle, last_seq: Option<u64>) -> Option<u64> {
    let items = handle.conversation_items(last_seq);
    let mut newest = last_seq;
    for item in items {
        newest = Some(item.seq);
        match &item.payload {
            ItemPayload::AssistantMessage { content } => println!("{content}"),
            ItemPayload::FunctionCall { name, arguments, .. } => {
                eprintln!("[tool] {name} {arguments}");
            }
            ItemPayload::FunctionCallOutput { output, .. } => {
                let mark = if output.is_failure() { "!" } else { "=" };
                for line in output.content.lines().take(20) {
                    eprintln!("  {mark} {line}");
                }
            }
            ItemPayload::TurnComplete { interrupted, .. } if *interrupted => {
                eprintln!("(turn interrupted)");
            }
            ItemPayload::Compaction { .. } => eprintln!("(context compacted)"),
            _ => {}
        }
    }
    newest
}

/// Blocking single-line prompt; `None` on EOF.
fn read_line(prompt: &str) -> anyhow::Result<Option<String>> {
    eprint!("{prompt}");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("stdin read failed")?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}
