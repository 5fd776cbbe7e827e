use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Configuration,
    Spawn,
    StageFailure,
    Timeout,
    Cancelled,
    Read,
    UnknownCommand,
    CommandDisabled,
}

impl ErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Spawn => "spawn_failed",
            Self::StageFailure => "stage_failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Read => "read_failed",
            Self::UnknownCommand => "unknown_command",
            Self::CommandDisabled => "command_disabled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("command '{command}' is misconfigured: {detail}")]
    Configuration { command: String, detail: String },

    #[error("command '{command}' failed to start '{program}': {detail}")]
    Spawn {
        command: String,
        program: String,
        detail: String,
    },

    #[error("command '{command}' stage {stage} exited with {}", describe_exit(.exit_code))]
    StageFailure {
        command: String,
        stage: usize,
        exit_code: Option<i32>,
    },

    #[error("command '{command}' exceeded {limit_ms}ms")]
    Timeout { command: String, limit_ms: u64 },

    #[error("command '{command}' was cancelled")]
    Cancelled { command: String },

    #[error("command '{command}' output could not be read: {detail}")]
    Read { command: String, detail: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command is disabled: {0}")]
    CommandDisabled(String),
}

impl EngineError {
    pub fn configuration(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Configuration {
            command: command.into(),
            detail: detail.into(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::Spawn { .. } => ErrorCode::Spawn,
            Self::StageFailure { .. } => ErrorCode::StageFailure,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Read { .. } => ErrorCode::Read,
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::CommandDisabled(_) => ErrorCode::CommandDisabled,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}
