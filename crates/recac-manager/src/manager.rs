//! The background-session manager.

use crate::state::{BackgroundStatus, SessionState};
use crate::{validate_name, ARCHIVE_DIR, SESSIONS_DIR};
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use recac_core::{RecacError, RecacResult};
use recac_vcs::{GitVcs, Vcs};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{info, warn};

/// Owns the per-user directory of background sessions.
pub struct SessionManager {
    sessions_dir: PathBuf,
    archive_dir: PathBuf,
}

impl SessionManager {
    /// Manager over the default `~/.recac/sessions` directory.
    pub fn new() -> RecacResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| RecacError::Session("cannot determine home directory".into()))?;
        Self::with_base_dir(home.join(SESSIONS_DIR))
    }

    /// Manager over an explicit base directory (tests).
    pub fn with_base_dir(sessions_dir: PathBuf) -> RecacResult<Self> {
        let archive_dir = sessions_dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;
        Ok(Self {
            sessions_dir,
            archive_dir,
        })
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.sessions_dir.join(format!("{name}.json"))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.sessions_dir.join(format!("{name}.log"))
    }

    fn archived_state_path(&self, name: &str) -> PathBuf {
        self.archive_dir.join(format!("{name}.json"))
    }

    fn require_name(name: &str) -> RecacResult<()> {
        if validate_name(name) {
            Ok(())
        } else {
            Err(RecacError::Session(format!(
                "invalid session name '{name}': allowed characters are [A-Za-z0-9_.-]"
            )))
        }
    }

    fn is_alive(pid: u32) -> bool {
        // reap first in case the pid is a zombie child of this process
        let _ = nix::sys::wait::waitpid(
            Pid::from_raw(pid as i32),
            Some(nix::sys::wait::WaitPidFlag::WNOHANG),
        );
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn send_signal(pid: u32, signal: Signal) -> RecacResult<()> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            // the process is already gone
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(RecacError::Session(format!(
                "signal {signal} to pid {pid} failed: {e}"
            ))),
        }
    }

    /// Reconcile a loaded state with the actual process table.
    fn refresh(&self, mut state: SessionState) -> RecacResult<SessionState> {
        if state.status.is_active() && !Self::is_alive(state.pid) {
            state.status = BackgroundStatus::Completed;
            state.ended_at = Some(Utc::now());
            state.save(&self.state_path(&state.name))?;
        }
        Ok(state)
    }

    /// Start a detached background session.
    pub async fn start_session(
        &self,
        name: &str,
        goal: &str,
        command: Vec<String>,
        workspace: &Path,
    ) -> RecacResult<SessionState> {
        Self::require_name(name)?;
        if command.is_empty() {
            return Err(RecacError::Session("command must not be empty".into()));
        }
        if self.state_path(name).exists() {
            let existing = self.load(name)?;
            if existing.status.is_active() {
                return Err(RecacError::Session(format!(
                    "session '{name}' is already {}",
                    existing.status
                )));
            }
        }

        let log_path = self.log_path(name);
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = std::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group: the session survives this process's exit
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .map_err(|e| RecacError::Session(format!("cannot spawn '{}': {e}", command[0])))?;

        let start_commit = GitVcs::new(workspace).head_commit().await.ok();
        let state = SessionState {
            name: name.to_string(),
            pid: child.id(),
            status: BackgroundStatus::Running,
            command,
            workspace: workspace.to_path_buf(),
            log_file: log_path,
            start_commit,
            end_commit: None,
            goal: goal.to_string(),
            started_at: Utc::now(),
            ended_at: None,
        };
        state.save(&self.state_path(name))?;
        info!(session = name, pid = state.pid, "background session started");
        Ok(state)
    }

    /// Load one session, reconciled against the process table.
    pub fn load(&self, name: &str) -> RecacResult<SessionState> {
        Self::require_name(name)?;
        let path = self.state_path(name);
        if !path.exists() {
            return Err(RecacError::Session(format!("no session named '{name}'")));
        }
        self.refresh(SessionState::load(&path)?)
    }

    /// All sessions in the active directory, sorted by name.
    pub fn list(&self) -> RecacResult<Vec<SessionState>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match SessionState::load(&path) {
                Ok(state) => sessions.push(self.refresh(state)?),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    /// Stop a session with SIGTERM; already-stopped sessions are a no-op.
    pub async fn stop(&self, name: &str) -> RecacResult<SessionState> {
        let mut state = self.load(name)?;
        if !state.status.is_active() {
            return Ok(state);
        }
        Self::send_signal(state.pid, Signal::SIGTERM)?;
        state.status = BackgroundStatus::Stopped;
        state.ended_at = Some(Utc::now());
        state.end_commit = GitVcs::new(&state.workspace).head_commit().await.ok();
        state.save(&self.state_path(name))?;
        info!(session = name, "background session stopped");
        Ok(state)
    }

    /// Suspend a running session with SIGSTOP.
    pub fn pause(&self, name: &str) -> RecacResult<SessionState> {
        let mut state = self.load(name)?;
        if state.status != BackgroundStatus::Running {
            return Err(RecacError::Session(format!(
                "session '{name}' is {}, only running sessions can pause",
                state.status
            )));
        }
        Self::send_signal(state.pid, Signal::SIGSTOP)?;
        state.status = BackgroundStatus::Paused;
        state.save(&self.state_path(name))?;
        Ok(state)
    }

    /// Resume a paused session with SIGCONT.
    pub fn resume(&self, name: &str) -> RecacResult<SessionState> {
        let mut state = self.load(name)?;
        if state.status != BackgroundStatus::Paused {
            return Err(RecacError::Session(format!(
                "session '{name}' is {}, only paused sessions can resume",
                state.status
            )));
        }
        Self::send_signal(state.pid, Signal::SIGCONT)?;
        state.status = BackgroundStatus::Running;
        state.save(&self.state_path(name))?;
        Ok(state)
    }

    /// Remove a session's files; removing a live session requires `force`.
    pub fn remove(&self, name: &str, force: bool) -> RecacResult<()> {
        let state = self.load(name)?;
        if state.status.is_active() {
            if !force {
                return Err(RecacError::Session(format!(
                    "session '{name}' is {}; use force to remove it",
                    state.status
                )));
            }
            Self::send_signal(state.pid, Signal::SIGKILL)?;
        }
        std::fs::remove_file(self.state_path(name))?;
        let log = self.log_path(name);
        if log.exists() {
            std::fs::remove_file(log)?;
        }
        Ok(())
    }

    /// Move a finished session (json + log) into the archive directory.
    pub fn archive(&self, name: &str) -> RecacResult<()> {
        let state = self.load(name)?;
        if state.status.is_active() {
            return Err(RecacError::Session(format!(
                "session '{name}' is {}; stop it before archiving",
                state.status
            )));
        }
        std::fs::rename(self.state_path(name), self.archived_state_path(name))?;
        let log = self.log_path(name);
        if log.exists() {
            std::fs::rename(log, self.archive_dir.join(format!("{name}.log")))?;
        }
        info!(session = name, "session archived");
        Ok(())
    }

    /// Move an archived session back; refuses when an active session of the
    /// same name exists.
    pub fn unarchive(&self, name: &str) -> RecacResult<()> {
        Self::require_name(name)?;
        let archived = self.archived_state_path(name);
        if !archived.exists() {
            return Err(RecacError::Session(format!(
                "no archived session named '{name}'"
            )));
        }
        if self.state_path(name).exists() {
            let existing = self.load(name)?;
            if existing.status.is_active() {
                return Err(RecacError::Session(format!(
                    "an active session named '{name}' already exists"
                )));
            }
        }
        std::fs::rename(archived, self.state_path(name))?;
        let log = self.archive_dir.join(format!("{name}.log"));
        if log.exists() {
            std::fs::rename(log, self.log_path(name))?;
        }
        Ok(())
    }

    /// Rename a finished session, moving both json and log.
    pub fn rename(&self, old: &str, new: &str) -> RecacResult<()> {
        Self::require_name(new)?;
        let mut state = self.load(old)?;
        if state.status.is_active() {
            return Err(RecacError::Session(format!(
                "session '{old}' is {}; stop it before renaming",
                state.status
            )));
        }
        if self.state_path(new).exists() || self.archived_state_path(new).exists() {
            return Err(RecacError::Session(format!(
                "a session named '{new}' already exists"
            )));
        }

        let old_log = self.log_path(old);
        let new_log = self.log_path(new);
        if old_log.exists() {
            std::fs::rename(&old_log, &new_log)?;
        }
        state.name = new.to_string();
        state.log_file = new_log;
        state.save(&self.state_path(new))?;
        std::fs::remove_file(self.state_path(old))?;
        Ok(())
    }

    /// Path of a session's log file.
    pub fn logs(&self, name: &str) -> RecacResult<PathBuf> {
        let state = self.load(name)?;
        Ok(state.log_file)
    }

    /// Diff stat between the session's start and end commits, via the given
    /// VCS capability.
    pub async fn diff_stat(&self, name: &str, vcs: &dyn Vcs) -> RecacResult<String> {
        let state = self.load(name)?;
        let start = state.start_commit.as_deref().ok_or_else(|| {
            RecacError::Session(format!("session '{name}' has no start commit"))
        })?;
        let end = match state.end_commit.as_deref() {
            Some(end) => end.to_string(),
            None => vcs.head_commit().await?,
        };
        vcs.diff_stat(start, &end).await
    }
}
