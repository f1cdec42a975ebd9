use std::{
    collections::VecDeque,
    sync::Mutex,
};

use crate::dependencies::{Command, CommandOutput, CommandRunner, DependencyError};

/// Scripted command runner: hands out queued responses in invocation order
/// and records every rendered command line. Invocations past the end of
/// the script succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    responses: Mutex<VecDeque<FakeResponse>>,
    journal: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
struct FakeResponse {
    code: i32,
    stdout: String,
    stderr: String,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response with the given exit code and output.
    pub fn push(&self, code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().push_back(FakeResponse {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
    }

    /// Queues a successful invocation producing `stdout`.
    pub fn push_ok(&self, stdout: &str) {
        self.push(0, stdout, "");
    }

    /// Rendered command lines in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn output(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered = command.render_command();
        self.journal.lock().unwrap().push(rendered.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeResponse {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        Ok(CommandOutput::simulated(
            command.dependency(),
            rendered,
            response.code,
            &response.stdout,
            &response.stderr,
        ))
    }
}
