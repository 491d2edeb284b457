use base64::Engine;
use serde::{Deserialize, Serialize};

/// Operations understood by the remote agent listening on each target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    RunCommand {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    ServiceRestart {
        name: String,
    },
    ServiceStart {
        name: String,
    },
    ServiceStop {
        name: String,
    },
    ServiceStatus {
        name: String,
    },
    FileRead {
        path: String,
    },
    FileCopy {
        src: String,
        dst: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        remote_src: bool,
        remote_dst: bool,
    },
    FileChmod {
        path: String,
        mode: u32,
    },
    SystemReboot,
    SystemShutdown,
}

impl AgentRequest {
    pub fn run_command(name: impl Into<String>, args: Vec<String>) -> Self {
        AgentRequest::RunCommand {
            name: name.into(),
            args,
        }
    }

    /// `content` is only shipped when the source lives on the operator's machine.
    pub fn file_copy(
        src: impl Into<String>,
        dst: impl Into<String>,
        content: Option<&[u8]>,
        remote_src: bool,
        remote_dst: bool,
    ) -> Self {
        AgentRequest::FileCopy {
            src: src.into(),
            dst: dst.into(),
            content: content.map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
            remote_src,
            remote_dst,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentRequest::RunCommand { .. } => "run_command",
            AgentRequest::ServiceRestart { .. } => "service_restart",
            AgentRequest::ServiceStart { .. } => "service_start",
            AgentRequest::ServiceStop { .. } => "service_stop",
            AgentRequest::ServiceStatus { .. } => "service_status",
            AgentRequest::FileRead { .. } => "file_read",
            AgentRequest::FileCopy { .. } => "file_copy",
            AgentRequest::FileChmod { .. } => "file_chmod",
            AgentRequest::SystemReboot => "system_reboot",
            AgentRequest::SystemShutdown => "system_shutdown",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AgentRequest::RunCommand { name, args } => {
                if args.is_empty() {
                    name.clone()
                } else {
                    format!("{} {}", name, args.join(" "))
                }
            }
            AgentRequest::ServiceRestart { name } => format!("service restart {}", name),
            AgentRequest::ServiceStart { name } => format!("service start {}", name),
            AgentRequest::ServiceStop { name } => format!("service stop {}", name),
            AgentRequest::ServiceStatus { name } => format!("service status {}", name),
            AgentRequest::FileRead { path } => format!("file read {}", path),
            AgentRequest::FileCopy { src, dst, .. } => format!("file cp {} {}", src, dst),
            AgentRequest::FileChmod { path, mode } => format!("file chmod {} {:o}", path, mode),
            AgentRequest::SystemReboot => "system reboot".to_string(),
            AgentRequest::SystemShutdown => "system shutdown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    #[default]
    Unknown,
    Changed,
    Unchanged,
    NotFound,
    Failed,
}

impl ResponseState {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseState::Unknown => "unknown",
            ResponseState::Changed => "changed",
            ResponseState::Unchanged => "unchanged",
            ResponseState::NotFound => "not_found",
            ResponseState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentResponse {
    #[serde(default)]
    pub state: ResponseState,
    #[serde(default)]
    pub message: String,
    /// Base64 payload (file contents, command output).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl AgentResponse {
    pub fn new(state: ResponseState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            content: String::new(),
            exit_code: None,
        }
    }

    pub fn with_content(mut self, bytes: &[u8]) -> Self {
        self.content = base64::engine::general_purpose::STANDARD.encode(bytes);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Decoded payload. Content that is not valid base64 is returned as-is.
    pub fn content_bytes(&self) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(self.content.as_bytes())
            .unwrap_or_else(|_| self.content.as_bytes().to_vec())
    }

    pub fn content_text(&self) -> String {
        String::from_utf8_lossy(&self.content_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_kind_tag() {
        let raw = serde_json::to_value(AgentRequest::ServiceRestart {
            name: "nginx".into(),
        })
        .expect("json");
        assert_eq!(raw["kind"], "service_restart");
        assert_eq!(raw["name"], "nginx");
    }

    #[test]
    fn unit_requests_parse_from_bare_tag() {
        let parsed: AgentRequest =
            serde_json::from_str(r#"{"kind":"system_reboot"}"#).expect("parse");
        assert_eq!(parsed, AgentRequest::SystemReboot);
    }

    #[test]
    fn response_defaults_missing_fields() {
        let parsed: AgentResponse = serde_json::from_str(r#"{"state":"changed"}"#).expect("parse");
        assert_eq!(parsed.state, ResponseState::Changed);
        assert!(parsed.message.is_empty());
        assert!(parsed.exit_code.is_none());
    }

    #[test]
    fn file_copy_encodes_local_content() {
        let request = AgentRequest::file_copy("a", "/tmp/b", Some(b"hi"), false, true);
        match request {
            AgentRequest::FileCopy { content, .. } => assert_eq!(content.as_deref(), Some("aGk=")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
