use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::LifecycleError;

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_discovery_timeout() -> Duration {
    Duration::from_secs(10)
}

/// An HTTP readiness probe issued once a TCP/UDS connect has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub method: String,
    pub path: String,
}

/// Environment forwarding policy for the spawned backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPolicy {
    pub pass_all: bool,
    pub pass_names: Vec<String>,
    pub extra: BTreeMap<String, String>,
}

/// Settings parsed from one handler block's directive lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub executable: Vec<String>,
    pub working_dir: Option<String>,
    pub env: EnvPolicy,
    pub upstream_spec: String,
    pub readiness_probe: Option<ReadinessProbe>,
    pub idle_timeout: Duration,
    pub startup_timeout: Duration,
    pub discovery_timeout: Duration,
    pub discovery_cmd: Option<Vec<String>>,
    pub inspect: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            executable: Vec::new(),
            working_dir: None,
            env: EnvPolicy::default(),
            upstream_spec: String::new(),
            readiness_probe: None,
            idle_timeout: default_idle_timeout(),
            startup_timeout: default_startup_timeout(),
            discovery_timeout: default_discovery_timeout(),
            discovery_cmd: None,
            inspect: false,
        }
    }
}

impl HandlerConfig {
    /// Parse the already-tokenized directive lines inside one handler block.
    ///
    /// Each inner `Vec<String>` is one directive line already split on
    /// whitespace by the host's config tokenizer; this function does not see
    /// braces, comments, or file includes.
    pub fn from_directives(lines: &[Vec<String>]) -> Result<Self, LifecycleError> {
        let mut cfg = HandlerConfig::default();
        let mut saw_exec = false;
        let mut saw_upstream = false;

        for line in lines {
            let Some((directive, rest)) = line.split_first() else {
                continue;
            };
            match directive.as_str() {
                "exec" => {
                    if rest.is_empty() {
                        return Err(LifecycleError::InvalidConfig(
                            "exec requires at least one argument".to_string(),
                        ));
                    }
                    cfg.executable = rest.to_vec();
                    saw_exec = true;
                }
                "dir" => {
                    cfg.working_dir = Some(
                        rest.first()
                            .cloned()
                            .ok_or_else(|| LifecycleError::InvalidConfig("dir requires a path".to_string()))?,
                    );
                }
                "env" => {
                    for pair in rest {
                        let (k, v) = split_env_pair(pair)?;
                        cfg.env.extra.insert(k, v);
                    }
                }
                "pass_env" => {
                    if rest.is_empty() {
                        return Err(LifecycleError::InvalidConfig(
                            "pass_env requires at least one name".to_string(),
                        ));
                    }
                    cfg.env.pass_names.extend(rest.iter().cloned());
                }
                "pass_all_env" => {
                    cfg.env.pass_all = true;
                }
                "reverse_proxy_to" => {
                    cfg.upstream_spec = rest
                        .first()
                        .cloned()
                        .ok_or_else(|| LifecycleError::InvalidConfig("reverse_proxy_to requires a spec".to_string()))?;
                    saw_upstream = true;
                }
                "readiness_check" => {
                    if rest.len() != 2 {
                        return Err(LifecycleError::InvalidConfig(
                            "readiness_check requires <METHOD> <path>".to_string(),
                        ));
                    }
                    cfg.readiness_probe = Some(ReadinessProbe {
                        method: rest[0].to_uppercase(),
                        path: rest[1].clone(),
                    });
                }
                "dynamic_proxy_detector" => {
                    if rest.is_empty() {
                        return Err(LifecycleError::InvalidConfig(
                            "dynamic_proxy_detector requires a command".to_string(),
                        ));
                    }
                    cfg.discovery_cmd = Some(rest.to_vec());
                }
                "idle_timeout" => {
                    cfg.idle_timeout = parse_duration(first_arg(directive, rest)?)?;
                }
                "startup_timeout" => {
                    cfg.startup_timeout = parse_duration(first_arg(directive, rest)?)?;
                }
                "discovery_timeout" => {
                    cfg.discovery_timeout = parse_duration(first_arg(directive, rest)?)?;
                }
                "inspect" => {
                    cfg.inspect = true;
                }
                other => {
                    return Err(LifecycleError::InvalidConfig(format!(
                        "unrecognized directive '{other}'"
                    )));
                }
            }
        }

        if !saw_exec && cfg.discovery_cmd.is_none() {
            return Err(LifecycleError::InvalidConfig(
                "handler requires either an exec directive or a dynamic_proxy_detector".to_string(),
            ));
        }
        if !saw_upstream && cfg.discovery_cmd.is_none() {
            return Err(LifecycleError::InvalidConfig(
                "handler requires a reverse_proxy_to directive unless discovery supplies one".to_string(),
            ));
        }

        Ok(cfg)
    }
}

fn first_arg<'a>(directive: &str, rest: &'a [String]) -> Result<&'a str, LifecycleError> {
    rest.first()
        .map(String::as_str)
        .ok_or_else(|| LifecycleError::InvalidConfig(format!("{directive} requires a value")))
}

fn split_env_pair(pair: &str) -> Result<(String, String), LifecycleError> {
    pair.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| LifecycleError::InvalidConfig(format!("invalid env pair '{pair}', expected KEY=VALUE")))
}

/// Parse a small humantime-like duration grammar: a non-negative integer
/// followed by one of `ms`, `s`, `m`, `h`. No fractional or compound forms.
pub fn parse_duration(input: &str) -> Result<Duration, LifecycleError> {
    let input = input.trim();
    let invalid = || LifecycleError::InvalidConfig(format!("invalid duration '{input}'"));

    let unit_start = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = input.split_at(unit_start);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

#[cfg(test)]
fn lines_from(src: &[&str]) -> Vec<Vec<String>> {
    src.iter()
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect()
}
