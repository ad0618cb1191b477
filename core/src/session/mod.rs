//! The session orchestrator: a single task that owns the conversation
//! log, consumes control operations from the front-end, and drives turns.
//!
//! All suspension is explicit: while a turn is in flight the orchestrator
//! only blocks inside [`SessionCore::await_with_ops`] or one of the
//! decision waiters, every one of which also observes interrupt and
//! shutdown. Observers never touch the orchestrator; they read
//! copy-on-read snapshots of the shared state.

mod escalation;
mod plan;
mod turn;
mod user_input;

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ModelClient;
use crate::conversation_log::ConversationLog;
use crate::error::Result;
use crate::error::TetherErr;
use crate::exec_policy;
use crate::exec_sessions::ExecSessionManager;
use crate::instructions;
use crate::rollout::RolloutRecorder;
use crate::rollout::SessionSnapshot;
use crate::safety::ApprovalDecision;
use crate::safety::ApprovalGate;
use crate::safety::EscalationDecision;
use crate::tools::registry::ToolRegistry;
use tether_protocol::ConversationItem;
use tether_protocol::ItemPayload;
use tether_protocol::SessionConfiguration;
use tether_protocol::SessionPhase;
use tether_protocol::SessionResult;
use tether_protocol::TurnStatus;
use tether_protocol::UserInputAnswers;

const SUBMISSION_CHANNEL_CAPACITY: usize = 64;

/// Control operations accepted by the orchestrator.
#[derive(Debug, Clone)]
pub enum Op {
    UserInput { content: String },
    ApprovalResponse(ApprovalDecision),
    EscalationResponse(EscalationDecision),
    UserInputResponse(UserInputAnswers),
    Interrupt,
    Shutdown,
}

/// Observable state shared with front-ends. Guarded by a plain mutex;
/// both sides only hold it long enough to copy.
#[derive(Default)]
pub(crate) struct SharedState {
    pub(crate) log: ConversationLog,
    pub(crate) status: TurnStatus,
}

/// Client-facing handle: control channel plus snapshot queries.
pub struct SessionHandle {
    conversation_id: uuid::Uuid,
    tx: mpsc::Sender<Op>,
    shared: Arc<StdMutex<SharedState>>,
    result_rx: StdMutex<Option<oneshot::Receiver<SessionResult>>>,
}

impl SessionHandle {
    pub fn conversation_id(&self) -> uuid::Uuid {
        self.conversation_id
    }

    pub async fn user_input(&self, content: impl Into<String>) -> Result<()> {
        self.submit(Op::UserInput {
            content: content.into(),
        })
        .await
    }

    pub async fn approval_response(&self, decision: ApprovalDecision) -> Result<()> {
        self.submit(Op::ApprovalResponse(decision)).await
    }

    pub async fn escalation_response(&self, decision: EscalationDecision) -> Result<()> {
        self.submit(Op::EscalationResponse(decision)).await
    }

    pub async fn user_input_response(&self, answers: UserInputAnswers) -> Result<()> {
        self.submit(Op::UserInputResponse(answers)).await
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.submit(Op::Interrupt).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.submit(Op::Shutdown).await
    }

    async fn submit(&self, op: Op) -> Result<()> {
        self.tx
            .send(op)
            .await
            .map_err(|_| TetherErr::Fatal("session has terminated".into()))
    }

    /// The log tail strictly after `since_seq` (everything when `None`).
    pub fn conversation_items(&self, since_seq: Option<u64>) -> Vec<ConversationItem> {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.log.items_since(since_seq)
    }

    /// A consistent snapshot of phase, counters, and pending requests.
    pub fn turn_status(&self) -> TurnStatus {
        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.status.clone()
    }

    /// Wait for the session to settle after `shutdown`. Returns `None` if
    /// the result was already claimed.
    pub async fn join(&self) -> Option<SessionResult> {
        let rx = self
            .result_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        rx.await.ok()
    }
}

/// Entry points for starting and resuming sessions.
pub struct Session;

impl Session {
    /// Start a fresh session. Instruction and policy resolution happen
    /// here, once, before the first turn; the initial message (when
    /// given) is queued as the first turn.
    pub async fn spawn(
        mut config: SessionConfiguration,
        initial_user_message: Option<String>,
        client: Arc<dyn ModelClient>,
        rollout_path: Option<&Path>,
    ) -> Result<SessionHandle> {
        instructions::resolve(&mut config).await;

        let policy = match &config.agent_home {
            Some(home) => exec_policy::load_policy(home).await,
            None => Default::default(),
        };

        let rollout = match rollout_path {
            Some(path) => Some(RolloutRecorder::open(path).await?),
            None => None,
        };

        let (core, tx) = SessionCore::new(config, client, policy, rollout, None);
        let conversation_id = uuid::Uuid::new_v4();
        info!(%conversation_id, "session started");
        Ok(Self::launch(core, tx, conversation_id, initial_user_message))
    }

    /// Resume from a rollout file: the log keeps its sequence numbers and
    /// the transcript, counters, and trusted tools carry over.
    pub async fn resume(rollout_path: &Path, client: Arc<dyn ModelClient>) -> Result<SessionHandle> {
        let (items, snapshot) = crate::rollout::load(rollout_path).await?;
        let config = snapshot.config.clone().ok_or_else(|| {
            TetherErr::Validation("rollout has no configuration snapshot".into())
        })?;
        let conversation_id = snapshot
            .conversation_id
            .unwrap_or_else(uuid::Uuid::new_v4);

        let policy = match &config.agent_home {
            Some(home) => exec_policy::load_policy(home).await,
            None => Default::default(),
        };
        let rollout = RolloutRecorder::open(rollout_path).await?;

        let (core, tx) = SessionCore::new(
            config,
            client,
            policy,
            Some(rollout),
            Some((items, snapshot)),
        );
        info!(%conversation_id, "session resumed from rollout");
        Ok(Self::launch(core, tx, conversation_id, None))
    }

    fn launch(
        mut core: SessionCore,
        tx: mpsc::Sender<Op>,
        conversation_id: uuid::Uuid,
        initial_user_message: Option<String>,
    ) -> SessionHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let shared = Arc::clone(&core.shared);

        if let Some(content) = initial_user_message {
            if !content.is_empty() {
                // The channel is empty at this point; the send cannot fail.
                let _ = tx.try_send(Op::UserInput { content });
            }
        }

        core.conversation_id = conversation_id;
        tokio::spawn(async move {
            core.run(result_tx).await;
        });

        SessionHandle {
            conversation_id,
            tx,
            shared,
            result_rx: StdMutex::new(Some(result_rx)),
        }
    }
}

pub(crate) struct SessionCore {
    pub(crate) conversation_id: uuid::Uuid,
    pub(crate) config: SessionConfiguration,
    pub(crate) client: Arc<dyn ModelClient>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) gate: ApprovalGate,
    pub(crate) shared: Arc<StdMutex<SharedState>>,
    pub(crate) rx: mpsc::Receiver<Op>,

    /// The rebuilt item sequence sent to the model; diverges from the
    /// observer log only at compaction.
    pub(crate) transcript: Vec<ItemPayload>,
    /// Start of the unsent suffix when the provider holds server state.
    pub(crate) transcript_sent: usize,
    pub(crate) last_response_id: Option<String>,
    pub(crate) turn_counter: u64,
    pub(crate) tool_calls_executed: u64,
    pub(crate) interrupted: bool,
    pub(crate) shutdown_requested: bool,
    pub(crate) compacted_this_turn: bool,
    pub(crate) repeat_key: Option<String>,
    pub(crate) repeat_count: u32,
    pub(crate) rollout: Option<RolloutRecorder>,
}

impl SessionCore {
    fn new(
        config: SessionConfiguration,
        client: Arc<dyn ModelClient>,
        policy: crate::exec_policy::ExecPolicy,
        rollout: Option<RolloutRecorder>,
        resume: Option<(Vec<ConversationItem>, SessionSnapshot)>,
    ) -> (Self, mpsc::Sender<Op>) {
        let exec_manager = Arc::new(ExecSessionManager::new());
        let registry = Arc::new(ToolRegistry::new(&config.tools, Arc::clone(&exec_manager)));
        let mut gate = ApprovalGate::new(config.approval_mode, policy);

        let (tx, rx) = mpsc::channel(SUBMISSION_CHANNEL_CAPACITY);

        let mut shared = SharedState::default();
        let mut transcript = Vec::new();
        let mut turn_counter = 0;
        let mut tool_calls_executed = 0;

        if let Some((items, snapshot)) = resume {
            shared.log = ConversationLog::from_items(items);
            shared.status.total_tokens = snapshot.usage;
            shared.status.turn_count = snapshot.turn_counter;
            shared.status.plan = snapshot.plan;
            for tool in &snapshot.trusted_tools {
                gate.trust_tool(tool);
            }
            transcript = snapshot.transcript;
            turn_counter = snapshot.turn_counter;
            tool_calls_executed = snapshot.tool_calls_executed;
            // Server-side conversation state does not survive a restart;
            // the first call after resume resends the full transcript.
        }

        let core = Self {
            conversation_id: uuid::Uuid::nil(),
            config,
            client,
            registry,
            gate,
            shared: Arc::new(StdMutex::new(shared)),
            rx,
            transcript,
            transcript_sent: 0,
            last_response_id: None,
            turn_counter,
            tool_calls_executed,
            interrupted: false,
            shutdown_requested: false,
            compacted_this_turn: false,
            repeat_key: None,
            repeat_count: 0,
            rollout,
        };
        (core, tx)
    }

    async fn run(&mut self, result_tx: oneshot::Sender<SessionResult>) {
        self.set_phase(SessionPhase::WaitingForInput);

        loop {
            let op = match self.rx.recv().await {
                Some(op) => op,
                None => break,
            };
            match op {
                Op::UserInput { content } => {
                    self.run_turn(content).await;
                    self.snapshot_to_rollout().await;
                    if self.log_over_continuation_bounds() {
                        self.continue_as_new();
                    }
                    if self.shutdown_requested {
                        break;
                    }
                    self.set_phase(SessionPhase::WaitingForInput);
                }
                Op::Shutdown => {
                    self.shutdown_requested = true;
                    break;
                }
                Op::Interrupt => {
                    debug!("interrupt with no turn in flight; ignoring");
                }
                other => {
                    warn!(?other, "unexpected operation outside a turn; ignoring");
                }
            }
        }

        self.snapshot_to_rollout().await;
        self.set_phase(SessionPhase::Idle);

        let result = {
            let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            SessionResult {
                total_tokens: shared.status.total_tokens,
                tool_calls_executed: self.tool_calls_executed,
                interrupted: self.interrupted,
            }
        };
        let _ = result_tx.send(result);
    }

    // ------------------------------------------------------------------
    // Shared-state helpers
    // ------------------------------------------------------------------

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.status.phase = phase;
    }

    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut shared)
    }

    /// Append to the observer log (and transcript unless it is a marker
    /// the model never sees), then persist.
    pub(crate) async fn append_item(&mut self, payload: ItemPayload) -> ConversationItem {
        let to_transcript = !matches!(
            payload,
            ItemPayload::TurnStarted { .. } | ItemPayload::TurnComplete { .. }
        );
        let item = {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.log.append(payload.clone())
        };
        if to_transcript && !matches!(payload, ItemPayload::Compaction { .. }) {
            self.transcript.push(payload);
        }
        if let Some(rollout) = &mut self.rollout {
            rollout.record_item(&item).await;
        }
        item
    }

    /// Append to the observer log only; used for compaction markers whose
    /// transcript effect is the rebuild itself.
    pub(crate) async fn append_log_only(&mut self, payload: ItemPayload) -> ConversationItem {
        let item = {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.log.append(payload)
        };
        if let Some(rollout) = &mut self.rollout {
            rollout.record_item(&item).await;
        }
        item
    }

    async fn snapshot_to_rollout(&mut self) {
        let snapshot = SessionSnapshot {
            conversation_id: Some(self.conversation_id),
            config: Some(self.config.clone()),
            transcript: self.transcript.clone(),
            turn_counter: self.turn_counter,
            usage: self.with_shared(|shared| shared.status.total_tokens),
            tool_calls_executed: self.tool_calls_executed,
            trusted_tools: self.gate.trusted_tool_names(),
            last_response_id: self.last_response_id.clone(),
            plan: self.with_shared(|shared| shared.status.plan.clone()),
        };
        if let Some(rollout) = &mut self.rollout {
            rollout.record_snapshot(&snapshot).await;
        }
    }

    fn log_over_continuation_bounds(&self) -> bool {
        self.with_shared(|shared| {
            shared.log.len() > self.config.max_log_entries
                || shared.log.content_bytes() > self.config.max_log_bytes
        })
    }

    /// In-place equivalent of snapshot-and-restart: persistent state (log,
    /// transcript, counters) carries over while per-activation scratch is
    /// discarded. Invisible to observers.
    fn continue_as_new(&mut self) {
        debug!(
            log_entries = self.with_shared(|shared| shared.log.len()),
            "log exceeded continuation bounds; recycling activation scratch"
        );
        self.repeat_key = None;
        self.repeat_count = 0;
        // Server-side conversation state does not survive a restart; the
        // next call resends the full transcript.
        self.last_response_id = None;
        self.transcript_sent = 0;
    }

    // ------------------------------------------------------------------
    // Await helpers
    // ------------------------------------------------------------------

    /// Await a future while also observing control operations. Interrupt
    /// and shutdown resolve to `TetherErr::Interrupted`, which unwinds the
    /// turn; the dropped future cancels the underlying work.
    pub(crate) async fn await_with_ops<T>(
        &mut self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                result = &mut fut => return result,
                op = self.rx.recv() => {
                    if self.note_interrupting_op(op) {
                        return Err(TetherErr::Interrupted);
                    }
                }
            }
        }
    }

    /// Record an op received mid-await. Returns true when the op ends the
    /// current turn.
    fn note_interrupting_op(&mut self, op: Option<Op>) -> bool {
        match op {
            Some(Op::Interrupt) => {
                self.interrupted = true;
                true
            }
            Some(Op::Shutdown) => {
                self.interrupted = true;
                self.shutdown_requested = true;
                true
            }
            Some(other) => {
                warn!(?other, "operation arrived while the turn was busy; ignoring");
                false
            }
            None => {
                self.shutdown_requested = true;
                self.interrupted = true;
                true
            }
        }
    }

    pub(crate) async fn wait_for_approval_decision(&mut self) -> Result<ApprovalDecision> {
        loop {
            match self.rx.recv().await {
                Some(Op::ApprovalResponse(decision)) => return Ok(decision),
                other => {
                    if self.note_interrupting_op(other) {
                        return Err(TetherErr::Interrupted);
                    }
                }
            }
        }
    }

    pub(crate) async fn wait_for_escalation_decision(&mut self) -> Result<EscalationDecision> {
        loop {
            match self.rx.recv().await {
                Some(Op::EscalationResponse(decision)) => return Ok(decision),
                other => {
                    if self.note_interrupting_op(other) {
                        return Err(TetherErr::Interrupted);
                    }
                }
            }
        }
    }

    pub(crate) async fn wait_for_user_input_answers(&mut self) -> Result<UserInputAnswers> {
        loop {
            match self.rx.recv().await {
                Some(Op::UserInputResponse(answers)) => return Ok(answers),
                other => {
                    if self.note_interrupting_op(other) {
                        return Err(TetherErr::Interrupted);
                    }
                }
            }
        }
    }
}
