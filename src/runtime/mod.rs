//! Session Runtime: one state machine per conversation, owning the child
//! process, a parser instance, and a subscriber fan-out hub.
//!
//! An explicit state machine with explicit cancellation: every
//! long-running loop (reading the child's stdout, writing its stdin,
//! store I/O, subscriber delivery) takes a cancellation token rather than
//! relying on an implicit cancellation boundary.

pub mod spawn;
pub mod subscriber;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{error, warn};

use crate::adapters::{Adapter, InvocationContext};
use crate::error::{BrokerError, BrokerResult};
use crate::schema::{ApprovalAction, ContentBlock, Conversation, ConversationStatus, Message, Mode, Role, Tool};
use crate::store::Store;
use spawn::{ChildSpawner, SpawnedChild};
use subscriber::{SubscriberEvent, SubscriberHub, SubscriberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    New,
    Starting,
    Running,
    Suspending,
    Suspended,
    Ended,
    Errored,
}

/// Configuration fixed at runtime construction; the Broker passes these
/// in when admitting a new session.
pub struct RuntimeConfig {
    pub idle_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub subscriber_buffer_capacity: usize,
}

pub struct SessionRuntime {
    pub conversation_id: String,
    tool: Tool,
    workspace: String,
    model: Option<String>,
    mode: Mode,
    adapter: Arc<dyn Adapter>,
    store: Arc<Store>,
    spawner: Arc<dyn ChildSpawner>,
    config: RuntimeConfig,

    state: Mutex<RuntimeState>,
    hub: Mutex<SubscriberHub>,
    pending_approval: Mutex<Option<ApprovalAction>>,
    interactive_child: Mutex<Option<SpawnedChild>>,
    /// Set once a `session_start` block has been persisted, whether
    /// self-reported by the adapter's own stream or synthesized on first
    /// dispatch. Guards against emitting it twice.
    session_started: Mutex<bool>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    /// Last time a message was persisted/published or a client attached.
    /// An idle runtime (no subscribers, no recent activity) may be
    /// suspended after a configured timeout. Checked by the Broker's
    /// background reaper, never by the runtime itself.
    last_activity: Mutex<Instant>,
}

fn affirmative(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

impl SessionRuntime {
    pub fn new(
        conversation_id: String,
        tool: Tool,
        workspace: String,
        model: Option<String>,
        mode: Mode,
        adapter: Arc<dyn Adapter>,
        store: Arc<Store>,
        spawner: Arc<dyn ChildSpawner>,
        config: RuntimeConfig,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            conversation_id,
            tool,
            workspace,
            model,
            mode,
            adapter,
            store,
            spawner,
            config,
            state: Mutex::new(RuntimeState::New),
            hub: Mutex::new(SubscriberHub::new()),
            pending_approval: Mutex::new(None),
            interactive_child: Mutex::new(None),
            session_started: Mutex::new(false),
            cancel_tx,
            cancel_rx,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.lock().await
    }

    /// `New -> Starting -> Running`. `session_start` is not emitted here:
    /// no child exists yet in the headless model, so the block is tied to
    /// actual child spawn instead (see `dispatch_turn`).
    pub async fn start(&self) -> BrokerResult<()> {
        {
            let mut state = self.state.lock().await;
            *state = RuntimeState::Starting;
        }

        let mut state = self.state.lock().await;
        *state = RuntimeState::Running;
        Ok(())
    }

    /// Registers a new subscriber; returns its id, receiver, and the
    /// snapshot it should replay before switching to live delivery.
    pub async fn attach(&self, cursor: Option<i64>) -> BrokerResult<(SubscriberId, tokio::sync::mpsc::Receiver<SubscriberEvent>, Vec<Message>)> {
        let snapshot = self.store.get_messages(&self.conversation_id, cursor)?;
        let mut hub = self.hub.lock().await;
        let (id, rx) = hub.subscribe(self.config.subscriber_buffer_capacity);
        drop(hub);
        self.touch().await;
        Ok((id, rx, snapshot))
    }

    pub async fn detach(&self, id: SubscriberId) {
        self.hub.lock().await.unsubscribe(id);
    }

    /// Handles one inbound client message: an approval response, or a new
    /// turn dispatched to the child.
    pub async fn send(&self, text: &str) -> BrokerResult<()> {
        {
            let state = self.state.lock().await;
            if *state != RuntimeState::Running {
                return Err(BrokerError::InvalidState(format!("{:?}", *state)));
            }
        }

        self.persist_and_publish(Message::new(self.conversation_id.clone(), Some(Role::User), ContentBlock::Text { content: text.to_string() })).await?;

        let pending = self.pending_approval.lock().await.take();
        if let (Some(_action), Some(is_yes)) = (pending, affirmative(text)) {
            return self.route_approval_response(is_yes, text).await;
        }

        self.dispatch_turn(text).await
    }

    /// Routes an affirmative/negative approval response to wherever the
    /// child actually is: a live interactive PTY child's stdin if one is
    /// running, or — the broker's only currently wired mode — as the next
    /// headless turn, so the response reaches a freshly spawned child
    /// instead of being silently swallowed.
    async fn route_approval_response(&self, is_yes: bool, text: &str) -> BrokerResult<()> {
        let response = if is_yes { "y\n" } else { "n\n" };
        let mut guard = self.interactive_child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Some(writer) = child.writer.as_mut() {
                writer.write_all(response.as_bytes()).await?;
                return Ok(());
            }
        }
        drop(guard);
        self.dispatch_turn(text).await
    }

    /// Non-interactive protocol: spawn a fresh child per message, stream
    /// its stdout through the parser until EOF.
    async fn dispatch_turn(&self, text: &str) -> BrokerResult<()> {
        if !self.adapter.reports_session_start() {
            let mut started = self.session_started.lock().await;
            if !*started {
                *started = true;
                drop(started);
                let model = self.model.clone();
                self.persist_and_publish(Message::new(self.conversation_id.clone(), None, ContentBlock::SessionStart { model })).await?;
            }
        }

        let ctx = InvocationContext {
            session_id: &self.conversation_id,
            workspace: Some(self.workspace.as_str()),
            model: self.model.as_deref(),
            mode: self.mode,
            message: text,
            is_new: false,
        };
        let args = self.adapter.build_send_args(&ctx);
        let executable = self.resolve_executable()?;

        let mut child = self.spawner.spawn_headless(&executable, &args, &PathBuf::from(&self.workspace)).await?;
        let exit = self.drain_child(&mut child).await?;

        if exit != 0 {
            self.fail(format!("child exited with status {exit}")).await?;
        }
        Ok(())
    }

    /// Reads a child's stdout to EOF through the line parser, persisting
    /// and publishing each block, detecting approval prompts along the
    /// way, then awaits process exit.
    async fn drain_child(&self, child: &mut SpawnedChild) -> BrokerResult<i32> {
        let mut line_parser = crate::parser::LineParser::new(self.adapter.parse_strategy());
        let mut buf = [0u8; 8192];
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
                read = child.reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    let blocks = line_parser.feed(&buf[..n], self.adapter.as_ref());
                    self.handle_parsed_blocks(blocks).await?;
                }
            }
        }
        let tail = line_parser.flush(self.adapter.as_ref());
        self.handle_parsed_blocks(tail).await?;
        child.waiter.wait().await
    }

    async fn handle_parsed_blocks(&self, blocks: Vec<crate::parser::ParsedBlock>) -> BrokerResult<()> {
        for parsed in blocks {
            if matches!(parsed.block, ContentBlock::SessionStart { .. }) {
                *self.session_started.lock().await = true;
            }
            if let ContentBlock::Text { content } = &parsed.block {
                if let Some(action) = self.adapter.detect_approval_request(content) {
                    let approval = Message::new(
                        self.conversation_id.clone(),
                        None,
                        ContentBlock::ApprovalRequest { action, content: content.clone() },
                    );
                    *self.pending_approval.lock().await = Some(action);
                    self.persist_and_publish(approval).await?;
                }
            }
            let mut message = Message::new(self.conversation_id.clone(), Some(Role::Assistant), parsed.block);
            if parsed.is_partial {
                message = message.partial();
            }
            self.persist_and_publish(message).await?;
        }
        Ok(())
    }

    fn resolve_executable(&self) -> BrokerResult<String> {
        self.adapter.resolve_executable().ok_or_else(|| BrokerError::AdapterUnavailable(format!("{:?}", self.tool)))
    }

    async fn persist_and_publish(&self, message: Message) -> BrokerResult<()> {
        if self.state().await == RuntimeState::Errored {
            return Err(BrokerError::InvalidState("Errored".into()));
        }
        // Store-then-publish ordering: no message reaches a subscriber
        // before it is durable.
        if let Err(err) = self.save_message_with_backoff(&message).await {
            error!(conversation = %self.conversation_id, %err, "storage write failed after retries, erroring session and refusing further writes");
            *self.state.lock().await = RuntimeState::Errored;
            self.store.update_conversation_status(&self.conversation_id, ConversationStatus::Errored).ok();
            return Err(err);
        }
        self.store.update_conversation_status(&self.conversation_id, RuntimeState::to_conversation_status(self.state().await)).ok();
        self.hub.lock().await.publish(message);
        self.touch().await;
        Ok(())
    }

    /// Retries a failed `save_message` with a short exponential backoff
    /// before giving up; the caller errors the session on exhaustion.
    async fn save_message_with_backoff(&self, message: &Message) -> BrokerResult<()> {
        const ATTEMPTS: u32 = 3;
        const BASE_DELAY_MS: u64 = 20;
        let mut attempt = 0;
        loop {
            match self.store.save_message(&self.conversation_id, message) {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < ATTEMPTS => {
                    warn!(conversation = %self.conversation_id, attempt, %err, "retrying storage write");
                    tokio::time::sleep(Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fail(&self, reason: String) -> BrokerResult<()> {
        error!(conversation = %self.conversation_id, %reason, "session errored");
        *self.state.lock().await = RuntimeState::Errored;
        self.persist_and_publish(Message::new(self.conversation_id.clone(), None, ContentBlock::Error { content: reason.clone() }))
            .await?;
        self.persist_and_publish(Message::new(
            self.conversation_id.clone(),
            None,
            ContentBlock::SessionEnd { reason, success: false },
        ))
        .await?;
        self.store.update_conversation_status(&self.conversation_id, ConversationStatus::Errored)?;
        Ok(())
    }

    /// Requests graceful termination with a bounded grace period: the child
    /// is force-killed if SIGTERM does not suffice in time.
    pub async fn close(&self) -> BrokerResult<()> {
        *self.state.lock().await = RuntimeState::Suspending;
        let _ = self.cancel_tx.send(true);

        let mut guard = self.interactive_child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.waiter.kill();
            let grace = std::time::Duration::from_secs(self.config.shutdown_grace_secs);
            if tokio::time::timeout(grace, child.waiter.wait()).await.is_err() {
                warn!(conversation = %self.conversation_id, "SIGTERM grace period expired, force-killing");
                let _ = child.waiter.kill();
            }
        }
        drop(guard);

        *self.state.lock().await = RuntimeState::Suspended;
        self.store.update_conversation_status(&self.conversation_id, ConversationStatus::Suspended)?;
        Ok(())
    }

    /// True when no one is attached and no activity has been recorded for
    /// at least `timeout`. Only meaningful while `Running` — a runtime
    /// already suspending/suspended is left alone by the reaper.
    pub async fn is_idle_past(&self, timeout: Duration) -> bool {
        if *self.state.lock().await != RuntimeState::Running {
            return false;
        }
        if self.has_subscribers().await {
            return false;
        }
        self.last_activity.lock().await.elapsed() >= timeout
    }

    pub async fn has_subscribers(&self) -> bool {
        !self.hub.lock().await.is_empty()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Reanimates a `Suspended` conversation without replaying
    /// `session_start`.
    pub async fn resume(&self) -> BrokerResult<()> {
        *self.state.lock().await = RuntimeState::Running;
        self.store.update_conversation_status(&self.conversation_id, ConversationStatus::Running)?;
        Ok(())
    }
}

impl RuntimeState {
    fn to_conversation_status(self) -> ConversationStatus {
        match self {
            RuntimeState::Suspended => ConversationStatus::Suspended,
            RuntimeState::Ended => ConversationStatus::Ended,
            RuntimeState::Errored => ConversationStatus::Errored,
            _ => ConversationStatus::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::claude::ClaudeAdapter;
    use crate::runtime::spawn::fake::FakeSpawner;
    use crate::store::Store;
    use std::sync::Arc;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig { idle_timeout_secs: 60, shutdown_grace_secs: 1, subscriber_buffer_capacity: 16 }
    }

    fn test_store() -> Arc<Store> {
        let store = Store::open_in_memory().unwrap();
        store.init().unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn start_transitions_to_running_without_persisting_anything() {
        let store = test_store();
        let conv = Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into());
        store.save_conversation(&conv).unwrap();

        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::Claude,
            "/tmp/p".into(),
            None,
            Mode::Agent,
            Arc::new(ClaudeAdapter::default()),
            store.clone(),
            Arc::new(FakeSpawner::new()),
            test_config(),
        );

        runtime.start().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Running);

        // No child has been spawned yet, so nothing is persisted: a
        // self-reporting adapter's session_start is tied to actual child
        // spawn, not to this state transition.
        let messages = store.get_messages("c1", None).unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn non_reporting_adapter_gets_synthetic_session_start_on_first_turn() {
        use crate::adapters::cursor_agent::CursorAgentAdapter;

        let store = test_store();
        store.save_conversation(&Conversation::new("c1".into(), Tool::CursorAgent, Mode::Agent, "/tmp/p".into())).unwrap();
        let spawner = Arc::new(FakeSpawner::new());
        spawner.feed.lock().unwrap().push(b"done\n".to_vec());
        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::CursorAgent,
            "/tmp/p".into(),
            Some("gpt-5".into()),
            Mode::Agent,
            Arc::new(CursorAgentAdapter::default()),
            store.clone(),
            spawner,
            test_config(),
        );
        runtime.start().await.unwrap();
        runtime.send("hi").await.unwrap();

        let messages = store.get_messages("c1", None).unwrap();
        let session_starts: Vec<_> = messages.iter().filter(|m| matches!(m.block, ContentBlock::SessionStart { .. })).collect();
        assert_eq!(session_starts.len(), 1);
        assert_eq!(session_starts[0].block, ContentBlock::SessionStart { model: Some("gpt-5".into()) });
    }

    #[tokio::test]
    async fn claude_scenario_one_has_single_session_start_with_reported_model() {
        let store = test_store();
        store.save_conversation(&Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into())).unwrap();
        let spawner = Arc::new(FakeSpawner::new());
        let stream = concat!(
            r#"{"type":"message_start","message":{"model":"m"}}"#, "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}"#, "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}"#, "\n",
            r#"{"type":"message_stop"}"#, "\n",
        );
        spawner.feed.lock().unwrap().push(stream.as_bytes().to_vec());
        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::Claude,
            "/tmp/p".into(),
            None,
            Mode::Agent,
            Arc::new(ClaudeAdapter::default()),
            store.clone(),
            spawner,
            test_config(),
        );
        runtime.start().await.unwrap();
        runtime.send("hi").await.unwrap();

        let messages = store.get_messages("c1", None).unwrap();
        let kinds: Vec<&str> = messages.iter().map(|m| m.block.kind()).collect();
        assert_eq!(kinds, vec!["text", "session_start", "text", "text", "session_end"]);
        let session_starts: Vec<_> = messages.iter().filter(|m| matches!(m.block, ContentBlock::SessionStart { .. })).collect();
        assert_eq!(session_starts.len(), 1);
        assert_eq!(session_starts[0].block, ContentBlock::SessionStart { model: Some("m".into()) });
    }

    #[tokio::test]
    async fn send_before_running_is_invalid_state() {
        let store = test_store();
        store.save_conversation(&Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into())).unwrap();
        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::Claude,
            "/tmp/p".into(),
            None,
            Mode::Agent,
            Arc::new(ClaudeAdapter::default()),
            store,
            Arc::new(FakeSpawner::new()),
            test_config(),
        );

        let err = runtime.send("hi").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn idle_past_only_true_once_running_unsubscribed_and_timed_out() {
        let store = test_store();
        store.save_conversation(&Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into())).unwrap();
        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::Claude,
            "/tmp/p".into(),
            None,
            Mode::Agent,
            Arc::new(ClaudeAdapter::default()),
            store,
            Arc::new(FakeSpawner::new()),
            test_config(),
        );

        // New/not-yet-running: never idle.
        assert!(!runtime.is_idle_past(Duration::from_secs(0)).await);

        runtime.start().await.unwrap();
        // Running with no subscribers but timeout not yet elapsed.
        assert!(!runtime.is_idle_past(Duration::from_secs(3600)).await);
        // A zero-second timeout has necessarily already elapsed.
        assert!(runtime.is_idle_past(Duration::from_secs(0)).await);

        // A live subscriber keeps it from being reaped regardless of timeout.
        let (_id, _rx, _snapshot) = runtime.attach(None).await.unwrap();
        assert!(!runtime.is_idle_past(Duration::from_secs(0)).await);
    }

    #[tokio::test]
    async fn repeated_storage_failure_errors_session_and_refuses_further_writes() {
        let store = test_store();
        store.save_conversation(&Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into())).unwrap();
        let runtime = SessionRuntime::new(
            "c1".into(),
            Tool::Claude,
            "/tmp/p".into(),
            None,
            Mode::Agent,
            Arc::new(ClaudeAdapter::default()),
            store.clone(),
            Arc::new(FakeSpawner::new()),
            test_config(),
        );
        runtime.start().await.unwrap();

        store.drop_messages_table_for_test();
        let err = runtime.send("hi").await.unwrap_err();
        assert!(matches!(err, BrokerError::StorageError(_)));
        assert_eq!(runtime.state().await, RuntimeState::Errored);
        assert_eq!(store.get_conversation("c1").unwrap().unwrap().status, ConversationStatus::Errored);

        // The session stays Errored: a further send is refused outright,
        // without retrying the (still-broken) store.
        let err = runtime.send("again").await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));
    }
}
