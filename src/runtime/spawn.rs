//! Process-spawning abstraction for the Session Runtime: a swappable
//! backend behind a capability trait, narrowed to "spawn one child, stream
//! its stdout, write to its stdin".
//!
//! Two invocation shapes are needed: a one-shot headless child whose
//! stdout is read to EOF (non-interactive adapters), and a persistent PTY
//! child that stays alive across multiple sends (interactive adapters).

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::BrokerResult;

/// A spawned child's halves the runtime needs: an async-readable stdout
/// (or PTY master read side) and, for interactive children, an
/// async-writable stdin (or PTY master write side).
pub struct SpawnedChild {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub waiter: Box<dyn ChildWaiter>,
}

/// Lets the runtime await process exit and request termination without
/// owning the concrete child-process type.
#[async_trait]
pub trait ChildWaiter: Send {
    async fn wait(&mut self) -> BrokerResult<i32>;
    fn kill(&mut self) -> BrokerResult<()>;
}

#[async_trait]
pub trait ChildSpawner: Send + Sync {
    /// Runs `executable args...` with `cwd` as the working directory,
    /// stdout piped, stdin piped (for interactive adapters that need to
    /// write responses into a headless child — most don't).
    async fn spawn_headless(&self, executable: &str, args: &[String], cwd: &Path) -> BrokerResult<SpawnedChild>;

    /// Runs `executable args...` attached to a freshly allocated PTY, for
    /// interactive adapters that keep one long-lived PTY across sends.
    async fn spawn_pty(&self, executable: &str, args: &[String], cwd: &Path) -> BrokerResult<SpawnedChild>;
}

pub mod tokio_spawner {
    use super::*;
    use std::process::Stdio;
    use tokio::process::{Child, Command};

    pub struct TokioSpawner;

    struct TokioWaiter {
        child: Child,
    }

    #[async_trait]
    impl ChildWaiter for TokioWaiter {
        async fn wait(&mut self) -> BrokerResult<i32> {
            let status = self.child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        }

        fn kill(&mut self) -> BrokerResult<()> {
            if let Some(id) = self.child.id() {
                #[cfg(unix)]
                {
                    // SIGTERM first; the runtime escalates to SIGKILL via a
                    // second kill() after the grace period expires.
                    unsafe {
                        libc_kill(id as i32, 15);
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = id;
                }
            }
            Ok(())
        }
    }

    #[cfg(unix)]
    unsafe fn libc_kill(pid: i32, signal: i32) {
        extern "C" {
            fn kill(pid: i32, sig: i32) -> i32;
        }
        kill(pid, signal);
    }

    #[async_trait]
    impl ChildSpawner for TokioSpawner {
        async fn spawn_headless(&self, executable: &str, args: &[String], cwd: &Path) -> BrokerResult<SpawnedChild> {
            let mut cmd = Command::new(executable);
            cmd.args(args).current_dir(cwd).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = cmd.spawn()?;
            let stdout = child.stdout.take().expect("stdout piped");
            let stdin = child.stdin.take().expect("stdin piped");
            Ok(SpawnedChild {
                reader: Box::new(stdout),
                writer: Some(Box::new(stdin)),
                waiter: Box::new(TokioWaiter { child }),
            })
        }

        async fn spawn_pty(&self, executable: &str, args: &[String], cwd: &Path) -> BrokerResult<SpawnedChild> {
            // Real PTY spawning lives in `runtime::pty` (portable-pty is not
            // `AsyncRead`-native); this default spawner falls back to a
            // headless pipe when a genuine PTY isn't required by the
            // caller, keeping the trait's default backend dependency-light.
            self.spawn_headless(executable, args, cwd).await
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    /// An in-memory spawner for runtime tests: hands back one end of a
    /// duplex pipe per spawn, recording the args it was called with so
    /// tests can assert on invocation shape without a real CLI binary.
    pub struct FakeSpawner {
        pub recorded_args: Arc<Mutex<Vec<Vec<String>>>>,
        pub feed: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FakeSpawner {
        pub fn new() -> Self {
            Self { recorded_args: Arc::new(Mutex::new(Vec::new())), feed: Arc::new(Mutex::new(Vec::new())) }
        }
    }

    struct FakeWaiter;

    #[async_trait]
    impl ChildWaiter for FakeWaiter {
        async fn wait(&mut self) -> BrokerResult<i32> {
            Ok(0)
        }

        fn kill(&mut self) -> BrokerResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChildSpawner for FakeSpawner {
        async fn spawn_headless(&self, _executable: &str, args: &[String], _cwd: &Path) -> BrokerResult<SpawnedChild> {
            self.recorded_args.lock().unwrap().push(args.to_vec());
            let (mut write_half, read_half): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
            for chunk in self.feed.lock().unwrap().iter() {
                use tokio::io::AsyncWriteExt;
                let _ = write_half.write_all(chunk).await;
            }
            drop(write_half);
            Ok(SpawnedChild { reader: Box::new(read_half), writer: None, waiter: Box::new(FakeWaiter) })
        }

        async fn spawn_pty(&self, executable: &str, args: &[String], cwd: &Path) -> BrokerResult<SpawnedChild> {
            self.spawn_headless(executable, args, cwd).await
        }
    }
}
