//! Child supervisor: owns the managed-command set and its processes.
//!
//! Spawns children with stdout and stderr merged onto a single pipe, pumps
//! that pipe into the deputy loop as [`ChildEvent`]s, escalates stop signals
//! under a rate limit, and reaps terminated children without blocking.
//!
//! The supervisor never publishes anything itself; it reports what happened
//! and the deputy turns that into printf/info traffic.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::{split_command_line, Command};
use crate::error::DeputyError;

/// Output is forwarded verbatim in reads of up to this many bytes.
pub const OUTPUT_CHUNK: usize = 4096;

/// What a child's output pipe produced, delivered on the deputy loop.
#[derive(Debug)]
pub enum ChildEvent {
    /// Bytes the child wrote to stdout or stderr.
    Output { sheriff_id: i32, bytes: Vec<u8> },
    /// The pipe reached end of output; it is closed and deregistered.
    OutputEof { sheriff_id: i32 },
    /// The pipe failed; it is closed and deregistered.
    OutputError {
        sheriff_id: i32,
        error: std::io::Error,
    },
}

/// Outcome of reaping one terminated child.
#[derive(Debug)]
pub struct Reaped {
    pub sheriff_id: i32,
    pub status: ExitStatus,
    /// The command was deleted from the set because removal was pending.
    pub removed: bool,
}

/// Owns every [`Command`] this deputy manages, keyed by sheriff id.
pub struct Supervisor {
    commands: HashMap<i32, Command>,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
}

impl Supervisor {
    pub fn new(events_tx: mpsc::UnboundedSender<ChildEvent>) -> Self {
        Self {
            commands: HashMap::new(),
            events_tx,
        }
    }

    /// Insert a new stopped command. The caller guarantees id uniqueness.
    pub fn add(&mut self, sheriff_id: i32, exec_str: &str, nickname: &str, group: &str) {
        debug!(sheriff_id, command = %exec_str, "adding new command");
        self.commands
            .insert(sheriff_id, Command::new(sheriff_id, exec_str, nickname, group));
    }

    pub fn get(&self, sheriff_id: i32) -> Option<&Command> {
        self.commands.get(&sheriff_id)
    }

    pub fn get_mut(&mut self, sheriff_id: i32) -> Option<&mut Command> {
        self.commands.get_mut(&sheriff_id)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub fn commands_mut(&mut self) -> impl Iterator<Item = &mut Command> {
        self.commands.values_mut()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Ids of all managed commands; the two-pass pattern for cull and reap.
    pub fn ids(&self) -> Vec<i32> {
        self.commands.keys().copied().collect()
    }

    pub fn running_count(&self) -> usize {
        self.commands.values().filter(|c| c.pid != 0).count()
    }

    /// Start the command if it is not already running.
    ///
    /// On success the child's stdout and stderr are merged onto one
    /// non-blocking pipe registered with the loop, and `actual_runid` is set
    /// to `runid`. On failure the command stays stopped with `actual_runid`
    /// untouched, so the next orders receipt retries.
    pub fn start(&mut self, sheriff_id: i32, runid: i32) -> Result<(), DeputyError> {
        let events_tx = self.events_tx.clone();
        let Some(cmd) = self.commands.get_mut(&sheriff_id) else {
            return Ok(());
        };
        if cmd.pid != 0 {
            return Ok(());
        }

        let spawn_err = |e: std::io::Error, exec_str: &str| DeputyError::SpawnFailed {
            command: exec_str.to_string(),
            source: e,
        };

        let argv = split_command_line(&cmd.exec_str);
        if argv.is_empty() {
            return Err(spawn_err(
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
                &cmd.exec_str,
            ));
        }

        // One pipe for both output streams, like a terminal would be.
        let (read_fd, write_fd) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| spawn_err(e.into(), &cmd.exec_str))?;
        let write_fd_dup = write_fd
            .try_clone()
            .map_err(|e| spawn_err(e, &cmd.exec_str))?;

        let child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_fd))
            .stderr(Stdio::from(write_fd_dup))
            .spawn()
            .map_err(|e| spawn_err(e, &cmd.exec_str))?;

        let pid = child.id().unwrap_or(0);
        debug!(sheriff_id, pid, command = %cmd.exec_str, "started command");

        spawn_output_pump(sheriff_id, read_fd, events_tx);

        cmd.pid = pid;
        cmd.child = Some(child);
        cmd.output_open = true;
        cmd.exit_status = None;
        cmd.actual_runid = runid;
        cmd.num_kills_sent = 0;
        cmd.last_kill_time = None;
        Ok(())
    }

    /// One step of the stop escalation. Rate-limited; never waits for exit.
    pub fn stop(&mut self, sheriff_id: i32) -> Result<(), DeputyError> {
        let now = Instant::now();
        let Some(sig) = self
            .commands
            .get(&sheriff_id)
            .and_then(|cmd| cmd.next_stop_signal(now))
        else {
            return Ok(());
        };

        let result = self.kill_cmd(sheriff_id, sig);
        if let Some(cmd) = self.commands.get_mut(&sheriff_id) {
            cmd.num_kills_sent += 1;
            cmd.last_kill_time = Some(now);
        }
        result
    }

    /// Unconditional signal delivery to a running command.
    pub fn kill_cmd(&self, sheriff_id: i32, sig: Signal) -> Result<(), DeputyError> {
        match self.commands.get(&sheriff_id) {
            Some(cmd) if cmd.pid != 0 => kill_pid(cmd.pid, sig),
            _ => Ok(()),
        }
    }

    /// Non-blocking reap of every terminated child.
    ///
    /// Commands marked for removal are deleted here; others are left stopped
    /// with their exit status recorded. Output pipes deregister themselves
    /// when they hit end of output, which follows child exit.
    pub fn reap_dead(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::new();

        for id in self.ids() {
            let Some(cmd) = self.commands.get_mut(&id) else {
                continue;
            };
            let Some(child) = cmd.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(sheriff_id = id, pid = cmd.pid, ?status, "reaped child");
                    if cmd.output_open {
                        // EOF has not landed yet; the pump drains whatever
                        // the child left behind and deregisters itself.
                        debug!(sheriff_id = id, "output pipe still draining");
                    }
                    cmd.pid = 0;
                    cmd.child = None;
                    cmd.exit_status = Some(status);
                    let removed = cmd.remove_requested;
                    if removed {
                        debug!(sheriff_id = id, "removing command");
                        self.commands.remove(&id);
                    }
                    reaped.push(Reaped {
                        sheriff_id: id,
                        status,
                        removed,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(sheriff_id = id, error = %e, "try_wait failed");
                }
            }
        }

        reaped
    }

    /// Delete a command that has no live child.
    pub fn remove(&mut self, sheriff_id: i32) {
        debug!(sheriff_id, "removing command");
        self.commands.remove(&sheriff_id);
    }

    /// Stop every running child and drop the whole command set.
    ///
    /// Used during shutdown; kill failures are reported but do not stop the
    /// teardown.
    pub fn remove_all(&mut self) -> Vec<(i32, DeputyError)> {
        let mut failures = Vec::new();
        for id in self.ids() {
            let running = self.commands.get(&id).map(|c| c.pid != 0).unwrap_or(false);
            if running {
                if let Err(e) = self.stop(id) {
                    failures.push((id, e));
                }
            }
            self.commands.remove(&id);
        }
        failures
    }
}

fn kill_pid(pid: u32, sig: Signal) -> Result<(), DeputyError> {
    if pid == 0 {
        return Ok(());
    }
    kill(Pid::from_raw(pid as i32), sig).map_err(DeputyError::KillFailed)
}

/// Move the read end of a child's merged output into a loop-side pump task.
///
/// The pump owns only the pipe and a sender; all command state stays with
/// the supervisor on the loop thread.
fn spawn_output_pump(
    sheriff_id: i32,
    read_fd: OwnedFd,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
) {
    let receiver = match pipe::Receiver::from_owned_fd(read_fd) {
        Ok(receiver) => receiver,
        Err(error) => {
            let _ = events_tx.send(ChildEvent::OutputError { sheriff_id, error });
            return;
        }
    };

    tokio::spawn(async move {
        let mut receiver = receiver;
        let mut buf = vec![0u8; OUTPUT_CHUNK];
        loop {
            match receiver.read(&mut buf).await {
                Ok(0) => {
                    let _ = events_tx.send(ChildEvent::OutputEof { sheriff_id });
                    break;
                }
                Ok(n) => {
                    let event = ChildEvent::Output {
                        sheriff_id,
                        bytes: buf[..n].to_vec(),
                    };
                    if events_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = events_tx.send(ChildEvent::OutputError { sheriff_id, error });
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn supervisor() -> (Supervisor, mpsc::UnboundedReceiver<ChildEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(tx), rx)
    }

    async fn wait_for_exit(sup: &mut Supervisor, sheriff_id: i32) -> Reaped {
        for _ in 0..100 {
            let mut reaped = sup.reap_dead();
            if let Some(pos) = reaped.iter().position(|r| r.sheriff_id == sheriff_id) {
                return reaped.swap_remove(pos);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("child did not exit");
    }

    #[tokio::test]
    async fn test_start_and_reap_clean_exit() {
        let (mut sup, _rx) = supervisor();
        sup.add(7, "/bin/true", "t", "g");
        sup.start(7, 1).unwrap();

        let cmd = sup.get(7).unwrap();
        assert_ne!(cmd.pid, 0);
        assert_eq!(cmd.actual_runid, 1);

        let reaped = wait_for_exit(&mut sup, 7).await;
        assert!(reaped.status.success());
        assert!(!reaped.removed);

        let cmd = sup.get(7).unwrap();
        assert_eq!(cmd.pid, 0);
        assert!(cmd.exit_status.unwrap().success());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_runid_behind() {
        let (mut sup, _rx) = supervisor();
        sup.add(7, "/nonexistent/binary-posse-test", "t", "g");

        let err = sup.start(7, 3).unwrap_err();
        assert!(matches!(err, DeputyError::SpawnFailed { .. }));

        let cmd = sup.get(7).unwrap();
        assert_eq!(cmd.pid, 0);
        assert_eq!(cmd.actual_runid, 0);
    }

    #[tokio::test]
    async fn test_output_forwarded_verbatim() {
        let (mut sup, mut rx) = supervisor();
        sup.add(7, "sh -c 'printf out; printf err >&2'", "t", "g");
        sup.start(7, 1).unwrap();

        let mut collected = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ChildEvent::Output { sheriff_id, bytes } => {
                    assert_eq!(sheriff_id, 7);
                    collected.extend_from_slice(&bytes);
                }
                ChildEvent::OutputEof { sheriff_id } => {
                    assert_eq!(sheriff_id, 7);
                    break;
                }
                ChildEvent::OutputError { error, .. } => panic!("read error: {error}"),
            }
        }

        // Both streams land on the one pipe; relative order of the two
        // writes is the child's own.
        let text = String::from_utf8(collected).unwrap();
        assert_eq!(text.len(), 6);
        assert!(text.contains("out"));
        assert!(text.contains("err"));

        wait_for_exit(&mut sup, 7).await;
    }

    #[tokio::test]
    async fn test_stop_terminates_child() {
        let (mut sup, _rx) = supervisor();
        sup.add(7, "/bin/sleep 600", "t", "g");
        sup.start(7, 1).unwrap();

        sup.stop(7).unwrap();
        assert_eq!(sup.get(7).unwrap().num_kills_sent, 1);

        let reaped = wait_for_exit(&mut sup, 7).await;
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(reaped.status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_stop_is_rate_limited() {
        let (mut sup, _rx) = supervisor();
        sup.add(7, "/bin/sleep 600", "t", "g");
        sup.start(7, 1).unwrap();

        sup.stop(7).unwrap();
        sup.stop(7).unwrap();
        sup.stop(7).unwrap();

        // Only the first call inside the 900 ms window sends anything.
        assert_eq!(sup.get(7).unwrap().num_kills_sent, 1);

        wait_for_exit(&mut sup, 7).await;
    }

    #[tokio::test]
    async fn test_reap_removes_when_requested() {
        let (mut sup, _rx) = supervisor();
        sup.add(7, "/bin/sleep 600", "t", "g");
        sup.start(7, 1).unwrap();

        sup.get_mut(7).unwrap().remove_requested = true;
        sup.stop(7).unwrap();

        let reaped = wait_for_exit(&mut sup, 7).await;
        assert!(reaped.removed);
        assert!(sup.get(7).is_none());
    }

    #[tokio::test]
    async fn test_remove_all_clears_set() {
        let (mut sup, _rx) = supervisor();
        sup.add(1, "/bin/sleep 600", "a", "g");
        sup.add(2, "/bin/true", "b", "g");
        sup.start(1, 1).unwrap();

        let failures = sup.remove_all();
        assert!(failures.is_empty());
        assert!(sup.is_empty());
    }
}
