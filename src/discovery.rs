use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use crate::config::{HandlerConfig, ReadinessProbe};
use crate::error::LifecycleError;

/// Stdout schema produced by a `dynamic_proxy_detector` command.
#[derive(Debug, Deserialize)]
struct DiscoveryOutput {
    executable: Option<Vec<String>>,
    reverse_proxy_to: Option<String>,
    envs: Option<Vec<String>>,
    dir: Option<String>,
    readiness_check: Option<DiscoveryReadiness>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryReadiness {
    method: String,
    path: String,
}

/// Run `discovery_cmd`, parse its stdout as JSON, and merge overrides onto
/// `base`, producing the effective config used for this single request.
///
/// `argv` must already have its placeholders expanded (e.g. the request
/// path substituted into `{path}`) by the caller's `PlaceholderExpander`.
pub async fn resolve(
    base: &HandlerConfig,
    argv: &[String],
    timeout: Duration,
) -> Result<HandlerConfig, LifecycleError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LifecycleError::InvalidConfig("dynamic_proxy_detector has no command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // If the timeout below fires, the `wait_with_output` future (and the
    // `Child` it owns) is dropped mid-flight; without this the detector
    // would be orphaned instead of reaped.
    cmd.kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn dynamic proxy detector '{program}'"))
        .map_err(|e| LifecycleError::DiscoveryFailed(e.to_string()))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| LifecycleError::DiscoveryFailed("detector timed out".to_string()))?
        .map_err(|e| LifecycleError::DiscoveryFailed(format!("failed to read detector output: {e}")))?;

    if !output.stderr.is_empty() {
        warn!(stderr = %String::from_utf8_lossy(&output.stderr), "dynamic proxy detector stderr");
    }

    if !output.status.success() {
        return Err(LifecycleError::DiscoveryFailed(format!(
            "detector exited with status {}",
            output.status
        )));
    }

    let parsed: DiscoveryOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| LifecycleError::DiscoveryFailed(format!("detector stdout is not valid JSON: {e}")))?;

    Ok(merge(base, parsed))
}

fn merge(base: &HandlerConfig, overrides: DiscoveryOutput) -> HandlerConfig {
    let mut cfg = base.clone();

    if let Some(executable) = overrides.executable {
        cfg.executable = executable;
    }
    if let Some(upstream) = overrides.reverse_proxy_to {
        cfg.upstream_spec = upstream;
    }
    if let Some(dir) = overrides.dir {
        cfg.working_dir = Some(dir);
    }
    if let Some(envs) = overrides.envs {
        for pair in envs {
            if let Some((k, v)) = pair.split_once('=') {
                cfg.env.extra.insert(k.to_string(), v.to_string());
            }
        }
    }
    if let Some(readiness) = overrides.readiness_check {
        cfg.readiness_probe = Some(ReadinessProbe {
            method: readiness.method.to_uppercase(),
            path: readiness.path,
        });
    }

    cfg
}
