use std::path::PathBuf;

use crate::error::LifecycleError;

/// A dial target resolved from a `reverse_proxy_to` directive value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DialTarget {
    Tcp(String),
    Unix(PathBuf),
}

impl DialTarget {
    /// Parse a `reverse_proxy_to` spec, already placeholder-expanded.
    ///
    /// Accepts `unix/<path>`, `:<port>` (binds 127.0.0.1), or `<host>:<port>`.
    pub fn parse(spec: &str) -> Result<Self, LifecycleError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(LifecycleError::InvalidConfig(
                "reverse_proxy_to must not be empty".to_string(),
            ));
        }

        if let Some(path) = spec.strip_prefix("unix/") {
            if path.is_empty() {
                return Err(LifecycleError::InvalidConfig(
                    "unix/ upstream spec is missing a path".to_string(),
                ));
            }
            return Ok(DialTarget::Unix(PathBuf::from(path)));
        }

        if let Some(port) = spec.strip_prefix(':') {
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                return Err(LifecycleError::InvalidConfig(format!(
                    "invalid port in upstream spec '{spec}'"
                )));
            }
            return Ok(DialTarget::Tcp(format!("127.0.0.1:{port}")));
        }

        match spec.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty() && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                Ok(DialTarget::Tcp(spec.to_string()))
            }
            _ => Err(LifecycleError::InvalidConfig(format!(
                "unrecognized upstream spec '{spec}' (expected host:port, :port, or unix/<path>)"
            ))),
        }
    }
}

impl std::fmt::Display for DialTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialTarget::Tcp(addr) => write!(f, "{addr}"),
            DialTarget::Unix(path) => write!(f, "unix/{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_socket_path() {
        let target = DialTarget::parse("unix//tmp/backend.sock").unwrap();
        assert_eq!(target, DialTarget::Unix(PathBuf::from("/tmp/backend.sock")));
    }

    #[test]
    fn parses_bare_port_as_loopback() {
        let target = DialTarget::parse(":8080").unwrap();
        assert_eq!(target, DialTarget::Tcp("127.0.0.1:8080".to_string()));
    }

    #[test]
    fn parses_host_and_port() {
        let target = DialTarget::parse("backend.internal:9000").unwrap();
        assert_eq!(target, DialTarget::Tcp("backend.internal:9000".to_string()));
    }

    #[test]
    fn rejects_empty_spec() {
        assert!(DialTarget::parse("").is_err());
    }

    #[test]
    fn rejects_unix_spec_without_path() {
        assert!(DialTarget::parse("unix/").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(DialTarget::parse(":abc").is_err());
        assert!(DialTarget::parse("host:abc").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(DialTarget::parse("not-a-spec-at-all").is_err());
    }

    #[test]
    fn display_round_trips_recognizable_form() {
        let tcp = DialTarget::Tcp("127.0.0.1:1234".to_string());
        assert_eq!(tcp.to_string(), "127.0.0.1:1234");

        let unix = DialTarget::Unix(PathBuf::from("/tmp/a.sock"));
        assert_eq!(unix.to_string(), "unix//tmp/a.sock");
    }
}
