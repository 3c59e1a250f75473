//! Broker: process-wide registry of sessions, admission of new sessions,
//! lookup by id, restart recovery, and shutdown orchestration.
//!
//! A single owned `HashMap<String, Arc<SessionRuntime>>` behind a mutex —
//! runtimes live only in the Broker; every other consumer goes through a
//! scoped handle rather than holding the map itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::adapters::{self, Adapter, CreateArgs};
use crate::config::Config;
use crate::error::{BrokerError, BrokerResult};
use crate::runtime::spawn::ChildSpawner;
use crate::runtime::subscriber::{SubscriberEvent, SubscriberId};
use crate::runtime::{RuntimeConfig, SessionRuntime};
use crate::schema::{Conversation, Message, Mode, Tool};
use crate::store::Store;

pub struct Broker {
    store: Arc<Store>,
    registry: HashMap<Tool, Arc<dyn Adapter>>,
    spawner: Arc<dyn ChildSpawner>,
    runtime_config: RuntimeConfigTemplate,
    sessions: Mutex<HashMap<String, Arc<SessionRuntime>>>,
}

#[derive(Clone, Copy)]
struct RuntimeConfigTemplate {
    idle_timeout_secs: u64,
    shutdown_grace_secs: u64,
    subscriber_buffer_capacity: usize,
}

impl RuntimeConfigTemplate {
    fn instantiate(self) -> RuntimeConfig {
        RuntimeConfig {
            idle_timeout_secs: self.idle_timeout_secs,
            shutdown_grace_secs: self.shutdown_grace_secs,
            subscriber_buffer_capacity: self.subscriber_buffer_capacity,
        }
    }
}

impl Broker {
    pub fn new(store: Arc<Store>, spawner: Arc<dyn ChildSpawner>, config: &Config) -> Self {
        let registry = adapters::default_registry().into_iter().map(|(tool, adapter)| (tool, Arc::from(adapter))).collect();
        Self {
            store,
            registry,
            spawner,
            runtime_config: RuntimeConfigTemplate {
                idle_timeout_secs: config.idle_timeout_secs,
                shutdown_grace_secs: config.shutdown_grace_secs,
                subscriber_buffer_capacity: config.subscriber_buffer_capacity,
            },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Run once at process start, before accepting requests: any
    /// conversation left `running` by a crash is demoted to `suspended`
    /// and is not auto-resurrected.
    pub async fn recover_from_restart(&self) -> BrokerResult<u64> {
        let count = self.store.suspend_all_active_chats()?;
        if count > 0 {
            info!(count, "demoted leftover running conversations to suspended on restart");
        }
        Ok(count)
    }

    fn adapter_for(&self, tool: Tool) -> BrokerResult<Arc<dyn Adapter>> {
        self.registry.get(&tool).cloned().ok_or_else(|| BrokerError::AdapterUnavailable(format!("{tool:?}")))
    }

    /// Resolves this conversation's id: `CallerGeneratesId` mints a UUID v4
    /// directly; `Spawn` actually runs the adapter's native create command
    /// (e.g. CursorAgent's `create-chat --workspace PATH`) and trims its
    /// stdout through `parse_create_output`.
    async fn mint_conversation_id(&self, adapter: &dyn Adapter, project_path: &str) -> BrokerResult<String> {
        match adapter.build_create_args(project_path) {
            CreateArgs::CallerGeneratesId => Ok(uuid::Uuid::new_v4().to_string()),
            CreateArgs::Spawn(args) => {
                let executable = adapter
                    .resolve_executable()
                    .ok_or_else(|| BrokerError::AdapterUnavailable(format!("{:?}", adapter.tool())))?;
                run_create_command(self.spawner.as_ref(), &executable, &args, project_path, adapter).await
            }
        }
    }

    pub async fn create_session(&self, tool: Tool, project_path: String, model: Option<String>, mode: Mode) -> BrokerResult<(String, i64)> {
        let adapter = self.adapter_for(tool)?;
        let id = self.mint_conversation_id(adapter.as_ref(), &project_path).await?;
        let mut conversation = Conversation::new(id.clone(), tool, mode, project_path.clone());
        conversation.model = model.clone();
        self.store.save_conversation(&conversation)?;

        let runtime = Arc::new(SessionRuntime::new(
            id.clone(),
            tool,
            project_path,
            model,
            mode,
            adapter,
            self.store.clone(),
            self.spawner.clone(),
            self.runtime_config.instantiate(),
        ));
        runtime.start().await?;
        self.sessions.lock().await.insert(id.clone(), runtime);
        Ok((id, 0))
    }

    async fn runtime_for(&self, conversation_id: &str) -> BrokerResult<Arc<SessionRuntime>> {
        if let Some(runtime) = self.sessions.lock().await.get(conversation_id) {
            return Ok(runtime.clone());
        }
        self.reanimate(conversation_id).await
    }

    /// Recreates a runtime for a `suspended` conversation: if a runtime is
    /// not live and the stored status is `suspended`, reanimate it.
    async fn reanimate(&self, conversation_id: &str) -> BrokerResult<Arc<SessionRuntime>> {
        let conversation = self.store.get_conversation(conversation_id)?.ok_or_else(|| BrokerError::NotFound(conversation_id.to_string()))?;
        if conversation.status != crate::schema::ConversationStatus::Suspended {
            return Err(BrokerError::InvalidState(format!("{:?}", conversation.status)));
        }
        let adapter = self.adapter_for(conversation.tool)?;
        let runtime = Arc::new(SessionRuntime::new(
            conversation.id.clone(),
            conversation.tool,
            conversation.project_path.clone(),
            conversation.model.clone(),
            conversation.mode,
            adapter,
            self.store.clone(),
            self.spawner.clone(),
            self.runtime_config.instantiate(),
        ));
        runtime.resume().await?;

        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(conversation_id.to_string()).or_insert(runtime);
        Ok(entry.clone())
    }

    /// Validates the conversation exists, reanimating a suspended runtime
    /// if needed; registers a subscriber; returns its id, receiver, and
    /// the replay snapshot.
    pub async fn attach(&self, conversation_id: &str, cursor: Option<i64>) -> BrokerResult<(SubscriberId, mpsc::Receiver<SubscriberEvent>, Vec<Message>)> {
        let runtime = self.runtime_for(conversation_id).await?;
        runtime.attach(cursor).await
    }

    pub async fn detach(&self, conversation_id: &str, subscriber_id: SubscriberId) {
        if let Some(runtime) = self.sessions.lock().await.get(conversation_id) {
            runtime.detach(subscriber_id).await;
        }
    }

    /// Appends the `user` block before dispatch, then enqueues the message
    /// on the runtime.
    pub async fn send(&self, conversation_id: &str, text: &str) -> BrokerResult<()> {
        let runtime = self.runtime_for(conversation_id).await?;
        runtime.send(text).await
    }

    pub async fn close_session(&self, conversation_id: &str) -> BrokerResult<()> {
        let runtime = self.sessions.lock().await.remove(conversation_id);
        match runtime {
            Some(runtime) => runtime.close().await,
            None => Err(BrokerError::NotFound(conversation_id.to_string())),
        }
    }

    /// Shutdown orchestration: suspend every live runtime in parallel with
    /// a bounded grace period each, then sweep any conversation the
    /// in-memory map didn't cover, then close the store.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        let runtimes: Vec<Arc<SessionRuntime>> = self.sessions.lock().await.drain().map(|(_, rt)| rt).collect();
        let closes = runtimes.into_iter().map(|rt| async move {
            if let Err(err) = rt.close().await {
                warn!(conversation = %rt.conversation_id, %err, "error suspending session during shutdown");
            }
        });
        futures::future::join_all(closes).await;

        self.store.suspend_all_active_chats()?;
        self.store.close()?;
        Ok(())
    }

    /// Sweeps the session map once, suspending every `Running` runtime with
    /// no subscribers that has been idle past `config.idle_timeout_secs`.
    /// Intended to be called on a fixed interval by
    /// `spawn_idle_reaper`; exposed separately so tests can drive one sweep
    /// deterministically instead of waiting on a real timer.
    pub async fn reap_idle_sessions(&self) {
        let idle_timeout = std::time::Duration::from_secs(self.runtime_config.idle_timeout_secs);
        let candidates: Vec<(String, Arc<SessionRuntime>)> = {
            let sessions = self.sessions.lock().await;
            sessions.iter().map(|(id, rt)| (id.clone(), rt.clone())).collect()
        };
        for (id, runtime) in candidates {
            if !runtime.is_idle_past(idle_timeout).await {
                continue;
            }
            info!(conversation = %id, "idle timeout exceeded, suspending");
            if let Err(err) = runtime.close().await {
                warn!(conversation = %id, %err, "error suspending idle session");
                continue;
            }
            self.sessions.lock().await.remove(&id);
        }
    }

    /// Spawns the background task that calls `reap_idle_sessions` on a
    /// fixed interval for the life of the process: a long-lived task
    /// holding a handle into shared state. The caller holds the returned
    /// handle and aborts it during shutdown.
    pub fn spawn_idle_reaper(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.reap_idle_sessions().await;
            }
        })
    }
}

/// Spawns an adapter's native create command, reads its stdout to EOF, and
/// hands the raw output to `parse_create_output`, which trims whitespace
/// and returns the printed id verbatim. A free function, not a method, so
/// it is testable with a `FakeSpawner` without resolving a real executable
/// on `PATH` first.
async fn run_create_command(
    spawner: &dyn ChildSpawner,
    executable: &str,
    args: &[String],
    project_path: &str,
    adapter: &dyn Adapter,
) -> BrokerResult<String> {
    let mut child = spawner.spawn_headless(executable, args, Path::new(project_path)).await?;
    let mut buf = Vec::new();
    child.reader.read_to_end(&mut buf).await?;
    let exit = child.waiter.wait().await?;
    if exit != 0 {
        return Err(BrokerError::ChildSpawnFailed(format!("create command exited with status {exit}")));
    }
    Ok(adapter.parse_create_output(&String::from_utf8_lossy(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::spawn::fake::FakeSpawner;

    fn test_config() -> Config {
        Config::from_raw_values(None, None, None, None, None, None, None)
    }

    #[tokio::test]
    async fn spawn_create_command_parses_printed_id() {
        let spawner = FakeSpawner::new();
        spawner.feed.lock().unwrap().push(b"  abc-123  \n".to_vec());
        let adapter = crate::adapters::cursor_agent::CursorAgentAdapter::default();
        let id = run_create_command(&spawner, "cursor-agent", &["create-chat".to_string()], "/tmp/p", &adapter)
            .await
            .unwrap();
        assert_eq!(id, "abc-123");
    }

    fn test_broker() -> Broker {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init().unwrap();
        Broker::new(store, Arc::new(FakeSpawner::new()), &test_config())
    }

    #[tokio::test]
    async fn create_session_persists_conversation_in_running_state() {
        let broker = test_broker();
        let (id, _cursor) = broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        let conv = broker.store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conv.status, crate::schema::ConversationStatus::Running);
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_is_not_found() {
        let broker = test_broker();
        let err = broker.send("missing", "hi").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn attach_returns_snapshot_and_live_receiver() {
        let broker = test_broker();
        let (id, _) = broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        let (_sub_id, _rx, snapshot) = broker.attach(&id, None).await.unwrap();
        // session_start is tied to the first dispatched turn, not to
        // start()/create_session, so nothing has been persisted yet.
        assert_eq!(snapshot.len(), 0);
    }

    #[tokio::test]
    async fn close_session_suspends_and_removes_from_live_map() {
        let broker = test_broker();
        let (id, _) = broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        broker.close_session(&id).await.unwrap();
        let conv = broker.store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conv.status, crate::schema::ConversationStatus::Suspended);

        // Attaching again reanimates rather than failing.
        let (_sub, _rx, _snapshot) = broker.attach(&id, None).await.unwrap();
        let conv = broker.store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conv.status, crate::schema::ConversationStatus::Running);
    }

    #[tokio::test]
    async fn shutdown_leaves_no_conversation_running() {
        let broker = test_broker();
        broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        broker.create_session(Tool::Gemini, "/tmp/q".into(), None, Mode::Agent).await.unwrap();

        broker.shutdown().await.unwrap();

        for conv in broker.store.get_all_conversations().unwrap() {
            assert_ne!(conv.status, crate::schema::ConversationStatus::Running);
        }
    }

    #[tokio::test]
    async fn reap_idle_sessions_suspends_and_removes_unsubscribed_runtime() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init().unwrap();
        let config = Config::from_raw_values(None, None, None, Some("0"), None, None, None);
        let broker = Broker::new(store, Arc::new(FakeSpawner::new()), &config);

        let (id, _) = broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        assert_eq!(broker.sessions.lock().await.len(), 1);

        broker.reap_idle_sessions().await;

        assert!(broker.sessions.lock().await.is_empty());
        let conv = broker.store.get_conversation(&id).unwrap().unwrap();
        assert_eq!(conv.status, crate::schema::ConversationStatus::Suspended);
    }

    #[tokio::test]
    async fn reap_idle_sessions_leaves_attached_session_running() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init().unwrap();
        let config = Config::from_raw_values(None, None, None, Some("0"), None, None, None);
        let broker = Broker::new(store, Arc::new(FakeSpawner::new()), &config);

        let (id, _) = broker.create_session(Tool::Claude, "/tmp/p".into(), None, Mode::Agent).await.unwrap();
        let (_sub, _rx, _snapshot) = broker.attach(&id, None).await.unwrap();

        broker.reap_idle_sessions().await;

        assert_eq!(broker.sessions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn recover_from_restart_demotes_leftover_running_conversations() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.init().unwrap();
        let conv = crate::schema::Conversation::new("c1".into(), Tool::Claude, Mode::Agent, "/tmp/p".into());
        store.save_conversation(&conv).unwrap();

        let broker = Broker::new(store.clone(), Arc::new(FakeSpawner::new()), &test_config());
        let demoted = broker.recover_from_restart().await.unwrap();
        assert_eq!(demoted, 1);
        assert_eq!(store.get_conversation("c1").unwrap().unwrap().status, crate::schema::ConversationStatus::Suspended);
    }
}
