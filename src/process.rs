use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{EnvPolicy, HandlerConfig};

/// Grace period between SIGTERM and SIGKILL when tearing down a process group.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A spawned backend child, its process-group id, and the tasks draining its
/// stdout/stderr into the tracing log.
pub struct RunningProcess {
    key: String,
    child: Child,
    pgid: Option<i32>,
    stdout_drain: tokio::task::JoinHandle<()>,
    stderr_drain: tokio::task::JoinHandle<()>,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking check for whether the child has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Block until the child exits and its output drainers finish.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed to wait for backend '{}'", self.key))?;
        // The drainers see EOF once the child's pipes close, which happens
        // at or before the child itself exits; await them so no stdout/stderr
        // lines are lost when the caller immediately removes the instance.
        let _ = tokio::join!(cancel_safe(&mut self.stdout_drain), cancel_safe(&mut self.stderr_drain));
        Ok(status)
    }

    /// Terminate the whole process group: SIGTERM, grace period, then SIGKILL.
    pub async fn kill(&mut self) {
        if let Some(pgid) = self.pgid {
            send_group_signal(&self.key, pgid, Signal::Term);
            let grace = tokio::time::sleep(KILL_GRACE);
            tokio::select! {
                _ = grace => {
                    warn!(backend = %self.key, pgid, "process group did not exit after SIGTERM, sending SIGKILL");
                    send_group_signal(&self.key, pgid, Signal::Kill);
                }
                status = self.child.wait() => {
                    if let Ok(status) = status {
                        debug!(backend = %self.key, exit = ?status.code(), "backend exited after SIGTERM");
                    }
                }
            }
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

async fn cancel_safe(handle: &mut tokio::task::JoinHandle<()>) {
    if !handle.is_finished() {
        let _ = handle.await;
    }
}

enum Signal {
    Term,
    Kill,
}

fn send_group_signal(key: &str, pgid: i32, signal: Signal) {
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Safety: libc::kill accepts any pid value; a negative value targets the group.
        let ret = unsafe { libc::kill(-pgid, sig) };
        if ret == 0 {
            debug!(backend = %key, pgid, signal = sig, "sent signal to process group");
        } else {
            warn!(backend = %key, pgid, signal = sig, "failed to signal process group");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (key, pgid, signal);
    }
}

/// Build the environment for the child per the handler's forwarding policy.
fn build_env(policy: &EnvPolicy) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if policy.pass_all {
        for (k, v) in std::env::vars() {
            env.insert(k, v);
        }
    } else {
        for name in &policy.pass_names {
            if let Ok(v) = std::env::var(name) {
                env.insert(name.clone(), v);
            }
        }
    }
    for (k, v) in &policy.extra {
        env.insert(k.clone(), v.clone());
    }
    env
}

fn build_command(config: &HandlerConfig) -> Result<Command> {
    let (program, args) = config
        .executable
        .split_first()
        .context("handler config has no executable")?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    for (k, v) in build_env(&config.env) {
        cmd.env(k, v);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
        unsafe {
            cmd.pre_exec(|| {
                // Ask the kernel to SIGTERM us if our parent (the host process) dies,
                // so an orphaned backend never outlives the host.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
                Ok(())
            });
        }
    }

    Ok(cmd)
}

/// Spawn the handler's backend executable in its own process group and start
/// draining its stdout/stderr into the tracing log.
pub fn spawn(key: &str, config: &HandlerConfig) -> Result<RunningProcess> {
    let mut cmd = build_command(config)?;
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn backend '{key}' ({:?})", config.executable))?;

    let pid = child.id();
    let pgid = pid.map(|p| p as i32);
    info!(backend = %key, pid = ?pid, "spawned backend process");

    let stdout = child.stdout.take().context("failed to capture backend stdout")?;
    let stderr = child.stderr.take().context("failed to capture backend stderr")?;

    let stdout_key = key.to_string();
    let stdout_drain = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(backend = %stdout_key, stream = "stdout", "{line}");
        }
    });

    let stderr_key = key.to_string();
    let stderr_drain = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(backend = %stderr_key, stream = "stderr", "{line}");
        }
    });

    Ok(RunningProcess {
        key: key.to_string(),
        child,
        pgid,
        stdout_drain,
        stderr_drain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerConfig;

    fn config_for(exec: &[&str]) -> HandlerConfig {
        let mut cfg = HandlerConfig::default();
        cfg.executable = exec.iter().map(|s| s.to_string()).collect();
        cfg.upstream_spec = ":0".to_string();
        cfg
    }

    #[tokio::test]
    async fn spawns_and_waits_for_short_lived_process() {
        let cfg = config_for(&["sh", "-c", "echo hello; exit 0"]);
        let mut proc = spawn("t1", &cfg).unwrap();
        let status = proc.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_process() {
        let cfg = config_for(&["sleep", "30"]);
        let mut proc = spawn("t2", &cfg).unwrap();
        assert!(!proc.has_exited());
        proc.kill().await;
        assert!(proc.has_exited());
    }

    #[tokio::test]
    async fn spawn_error_for_missing_executable() {
        let cfg = config_for(&["definitely-not-a-real-executable-xyz"]);
        assert!(spawn("t3", &cfg).is_err());
    }

    #[tokio::test]
    async fn env_extra_overrides_passthrough() {
        let mut cfg = config_for(&["sh", "-c", "echo $FOO"]);
        cfg.env.extra.insert("FOO".to_string(), "bar".to_string());
        let mut proc = spawn("t4", &cfg).unwrap();
        let status = proc.wait().await.unwrap();
        assert!(status.success());
    }
}
