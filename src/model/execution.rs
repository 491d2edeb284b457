use super::agent::{AgentRequest, AgentResponse, ResponseState};
use crate::utils::text::indent_block;
use serde::Serialize;

/// What every target is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionUnit {
    /// A shell command line run over the channel's command path.
    Shell { command: String },
    /// A structured operation handled by the remote agent.
    Agent(AgentRequest),
}

impl ExecutionUnit {
    pub fn shell(command: impl Into<String>) -> Self {
        ExecutionUnit::Shell {
            command: command.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionUnit::Shell { .. } => "shell",
            ExecutionUnit::Agent(request) => request.kind(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ExecutionUnit::Shell { command } => command.clone(),
            ExecutionUnit::Agent(request) => request.describe(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { output: String },
    Failure { exit_indicator: String, output: String },
    Error { cause: String },
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        ExecutionOutcome::Success {
            output: output.into(),
        }
    }

    pub fn failure(exit_indicator: impl Into<String>, output: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            exit_indicator: exit_indicator.into(),
            output: output.into(),
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        ExecutionOutcome::Error {
            cause: cause.into(),
        }
    }

    pub fn class(&self) -> OutcomeClass {
        match self {
            ExecutionOutcome::Success { .. } => OutcomeClass::Success,
            ExecutionOutcome::Failure { .. } => OutcomeClass::Failure,
            ExecutionOutcome::Error { .. } => OutcomeClass::Error,
        }
    }

    /// Text shown under the target name in the report.
    pub fn body(&self) -> String {
        match self {
            ExecutionOutcome::Success { output } => indent_block(output, 4),
            ExecutionOutcome::Failure {
                exit_indicator,
                output,
            } => {
                let text = indent_block(output, 4);
                if text.is_empty() {
                    format!("    ({})", exit_indicator)
                } else {
                    format!("{}\n    ({})", text, exit_indicator)
                }
            }
            ExecutionOutcome::Error { cause } => indent_block(cause, 4),
        }
    }

    /// Classifies a command's exit status: zero is success, anything else failure.
    pub fn from_exit(exit_code: i64, output: String) -> Self {
        if exit_code == 0 {
            ExecutionOutcome::success(output)
        } else {
            ExecutionOutcome::failure(format!("exit status {}", exit_code), output)
        }
    }

    /// Classifies an agent response. `run_command` is judged by its exit
    /// code; everything else by the response state.
    pub fn from_agent(request: &AgentRequest, response: &AgentResponse) -> Self {
        let mut output = response.message.clone();
        if !response.content.is_empty() {
            let content = response.content_text();
            if output.is_empty() {
                output = content;
            } else {
                output = format!("{}\n{}", output, content);
            }
        }
        if let AgentRequest::RunCommand { .. } = request {
            if let Some(code) = response.exit_code {
                return Self::from_exit(i64::from(code), output);
            }
        }
        match response.state {
            ResponseState::Changed | ResponseState::Unknown => ExecutionOutcome::success(output),
            ResponseState::Unchanged | ResponseState::NotFound | ResponseState::Failed => {
                ExecutionOutcome::failure(response.state.as_str(), output)
            }
        }
    }
}
