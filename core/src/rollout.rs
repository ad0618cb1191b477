//! JSONL persistence of the conversation and periodic state snapshots, so
//! a session can be resumed after a process restart.
//!
//! Each line is either an appended conversation item or a full state
//! snapshot; resume replays the items and adopts the latest snapshot.
//! Writes are best-effort: a failing disk degrades durability, never the
//! live session.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;
use crate::error::TetherErr;
use tether_protocol::ConversationItem;
use tether_protocol::ItemPayload;
use tether_protocol::PlanState;
use tether_protocol::SessionConfiguration;
use tether_protocol::TokenUsage;

/// Everything the orchestrator needs to continue where it left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<uuid::Uuid>,
    pub config: Option<SessionConfiguration>,
    pub transcript: Vec<ItemPayload>,
    pub turn_counter: u64,
    pub usage: TokenUsage,
    pub tool_calls_executed: u64,
    pub trusted_tools: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanState>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RolloutLine {
    Item(ConversationItem),
    Snapshot(Box<SessionSnapshot>),
}

pub struct RolloutRecorder {
    path: PathBuf,
    file: tokio::fs::File,
}

impl RolloutRecorder {
    /// Open (or create) the rollout file for appending.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record_item(&mut self, item: &ConversationItem) {
        self.write_line(&RolloutLine::Item(item.clone())).await;
    }

    pub async fn record_snapshot(&mut self, snapshot: &SessionSnapshot) {
        self.write_line(&RolloutLine::Snapshot(Box::new(snapshot.clone())))
            .await;
    }

    async fn write_line(&mut self, line: &RolloutLine) {
        let encoded = match serde_json::to_string(line) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode rollout line");
                return;
            }
        };
        let payload = format!("{encoded}\n");
        if let Err(err) = self.file.write_all(payload.as_bytes()).await {
            warn!(path = %self.path.display(), error = %err, "failed to append rollout line");
        } else if let Err(err) = self.file.flush().await {
            warn!(path = %self.path.display(), error = %err, "failed to flush rollout");
        }
    }
}

/// Replay a rollout file: all items in order plus the latest snapshot.
pub async fn load(path: &Path) -> Result<(Vec<ConversationItem>, SessionSnapshot)> {
    let raw = tokio::fs::read_to_string(path).await?;

    let mut items = Vec::new();
    let mut snapshot = SessionSnapshot::default();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RolloutLine>(line) {
            Ok(RolloutLine::Item(item)) => items.push(item),
            Ok(RolloutLine::Snapshot(snap)) => snapshot = *snap,
            Err(err) => {
                // A torn final line after a crash is expected; anything else
                // is worth flagging.
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %err,
                    "skipping unreadable rollout line"
                );
            }
        }
    }

    if items.is_empty() && snapshot.config.is_none() {
        return Err(TetherErr::Validation(format!(
            "rollout `{}` contains no usable session state",
            path.display()
        )));
    }
    Ok((items, snapshot))
}
