//! Backend descriptors: what to launch and which namespace it owns

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default per-call timeout for a backend
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How a backend is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Launch {
    /// Local subprocess speaking newline-delimited JSON-RPC on stdio
    Process {
        /// Program (or full command line when `args` is empty)
        command: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Remote service; each call is one HTTP request/response pair
    Http {
        /// Endpoint URL
        url: String,
    },
}

impl Launch {
    /// Transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Process { .. } => "process",
            Self::Http { .. } => "http",
        }
    }

    /// Split a whole command line into program + args and check the target
    ///
    /// A process launch given as `"npx -y server-fs /tmp"` with no `args` is
    /// split with shell quoting rules.
    pub fn normalized(self) -> Result<Self> {
        match self {
            Self::Process { command, args, cwd } => {
                let command = command.trim().to_string();
                if command.is_empty() {
                    return Err(Error::Config("Empty command".to_string()));
                }
                if !args.is_empty() || !command.contains(char::is_whitespace) {
                    return Ok(Self::Process { command, args, cwd });
                }
                let mut parts = shlex::split(&command)
                    .ok_or_else(|| Error::Config(format!("Unbalanced quotes in command: {command}")))?
                    .into_iter();
                let program = parts
                    .next()
                    .ok_or_else(|| Error::Config("Empty command".to_string()))?;
                Ok(Self::Process {
                    command: program,
                    args: parts.collect(),
                    cwd,
                })
            }
            Self::Http { url } => {
                let parsed = url::Url::parse(&url)
                    .map_err(|e| Error::Config(format!("Invalid backend URL '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::Config(format!(
                        "Backend URL '{url}' must use http or https"
                    )));
                }
                Ok(Self::Http { url })
            }
        }
    }
}

/// A backend the gateway can route to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Backend id (scoped as `tenant/id` in registry mode)
    pub id: String,
    /// Namespace prefix, ending with a separator
    pub namespace: String,
    /// Transport and target
    #[serde(flatten)]
    pub launch: Launch,
    /// Extra environment for process backends
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Extra headers for HTTP backends
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-call timeout
    #[serde(default = "default_timeout", with = "crate::config::humantime_serde")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

impl BackendDescriptor {
    /// Create a descriptor with no env, headers, and the default timeout
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, launch: Launch) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            launch,
            env: HashMap::new(),
            headers: HashMap::new(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_command_line_is_split() {
        let launch = Launch::Process {
            command: "npx -y \"@scope/server fs\" /tmp".to_string(),
            args: vec![],
            cwd: None,
        }
        .normalized()
        .unwrap();

        assert_eq!(
            launch,
            Launch::Process {
                command: "npx".to_string(),
                args: vec!["-y".into(), "@scope/server fs".into(), "/tmp".into()],
                cwd: None,
            }
        );
    }

    #[test]
    fn explicit_args_are_kept() {
        let launch = Launch::Process {
            command: "python3".to_string(),
            args: vec!["-m".into(), "server".into()],
            cwd: None,
        }
        .normalized()
        .unwrap();
        assert!(matches!(launch, Launch::Process { ref args, .. } if args.len() == 2));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = Launch::Process {
            command: "   ".to_string(),
            args: vec![],
            cwd: None,
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn non_http_url_is_rejected() {
        let err = Launch::Http {
            url: "ftp://example.com/mcp".to_string(),
        }
        .normalized()
        .unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn descriptor_deserializes_with_transport_tag() {
        let desc: BackendDescriptor = serde_json::from_value(serde_json::json!({
            "id": "search",
            "namespace": "search.",
            "transport": "http",
            "url": "https://search.internal/mcp",
            "timeout": "10s"
        }))
        .unwrap();
        assert_eq!(desc.launch.transport_type(), "http");
        assert_eq!(desc.timeout, Duration::from_secs(10));
    }
}
