/// What a stage should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Systemic problem; stop pulling new work until an operator resumes.
    PauseStage,
    /// File-specific problem; mark the one video failed and keep going.
    Continue,
}

/// Classifier verdict: action plus a machine code and a human reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub action: FailureAction,
    pub code: String,
    pub reason: String,
}

/// Normalized failure input: an exit code or one of the symbolic outcomes
/// the runner can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    Exit(i32),
    Timeout,
    /// The subprocess plumbing itself broke (spawn, pipe, wait).
    PortError,
    /// The tool exited 0 but the expected output file is missing.
    MissingOutput,
    /// An exception bubbled out of a handler; carries the message.
    Exception(String),
}

/// Classify a failure. Total: every input maps to exactly one verdict, and
/// exit codes we have not catalogued default to `Continue` so an unknown
/// code can never halt a stage.
pub fn classify(kind: &FailureKind) -> Classification {
    match kind {
        FailureKind::Exit(code) => classify_exit(*code),
        FailureKind::Timeout => Classification {
            action: FailureAction::PauseStage,
            code: "timeout".to_string(),
            reason: "Stage timeout elapsed before the process finished".to_string(),
        },
        FailureKind::PortError => Classification {
            action: FailureAction::PauseStage,
            code: "port_error".to_string(),
            reason: "Could not drive the external tool process".to_string(),
        },
        FailureKind::MissingOutput => Classification {
            action: FailureAction::Continue,
            code: "missing_output".to_string(),
            reason: "Tool exited 0 but the expected output file is missing".to_string(),
        },
        FailureKind::Exception(message) => classify_exception(message),
    }
}

fn classify_exit(code: i32) -> Classification {
    let (action, reason) = match code {
        // Systemic: pause the whole stage.
        137 => (
            FailureAction::PauseStage,
            "Process killed by system (likely OOM)",
        ),
        143 => (FailureAction::PauseStage, "Process terminated (SIGTERM)"),
        28 => (FailureAction::PauseStage, "No space left on device"),
        2 => (
            FailureAction::PauseStage,
            "Invalid command line arguments (configuration bug)",
        ),
        5 => (FailureAction::PauseStage, "I/O error"),
        110 => (FailureAction::PauseStage, "Network connection timed out"),

        // File-specific: mark this one failed and continue.
        1 => (FailureAction::Continue, "Encoding failed"),
        13 => (FailureAction::Continue, "Permission denied reading file"),
        22 => (FailureAction::Continue, "Invalid or unsupported file format"),
        69 => (FailureAction::Continue, "Unsupported codec"),

        _ => (FailureAction::Continue, "Unknown exit code"),
    };

    Classification {
        action,
        code: format!("exit_{}", code),
        reason: reason.to_string(),
    }
}

fn classify_exception(message: &str) -> Classification {
    let lower = message.to_lowercase();

    let action = if lower.contains("enomem") || lower.contains("memory") {
        FailureAction::PauseStage
    } else if lower.contains("enospc") {
        FailureAction::PauseStage
    } else if lower.contains("port") || lower.contains("process") {
        FailureAction::PauseStage
    } else {
        FailureAction::Continue
    };

    Classification {
        action,
        code: "exception".to_string(),
        reason: message.to_string(),
    }
}
