//! Turns a model reply into sandboxed command execution.
//!
//! Fenced ```bash blocks are extracted and run one by one; blocks that are
//! actually JSON objects (a common mis-tag) are skipped with a marker. After
//! all blocks ran, blocker indicators are checked: a `BLOCKER` signal in the
//! store, or legacy `blockers.txt` / `recac_blockers.txt` content inside the
//! sandbox.

use recac_core::{signal, RecacError, RecacResult};
use recac_sandbox::{shell_argv, Sandbox};
use recac_store::Store;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Legacy blocker marker files checked inside the sandbox.
const BLOCKER_FILES: &[&str] = &["blockers.txt", "recac_blockers.txt"];

/// Result of processing one reply.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Aggregated stdout/stderr transcript of every block.
    pub transcript: String,
    /// Number of command blocks actually executed.
    pub executed: usize,
}

/// Extracts and executes command blocks from model output.
pub struct ResponseProcessor {
    bash_timeout: Duration,
    block_re: Regex,
}

impl ResponseProcessor {
    /// Processor with the given per-block timeout.
    pub fn new(bash_timeout: Duration) -> Self {
        // tolerant of trailing whitespace and a missing trailing newline
        #[allow(clippy::expect_used)]
        let block_re = Regex::new(r"(?s)```[ \t]*bash[ \t]*\r?\n(.*?)[ \t]*\r?\n?```")
            .expect("static regex");
        Self {
            bash_timeout,
            block_re,
        }
    }

    /// The configured per-block timeout.
    pub fn bash_timeout(&self) -> Duration {
        self.bash_timeout
    }

    /// Extract the bodies of all ```bash blocks, in order.
    pub fn extract_blocks(&self, reply: &str) -> Vec<String> {
        self.block_re
            .captures_iter(reply)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }

    /// Execute every block and check blocker indicators.
    pub async fn process(
        &self,
        sandbox: &Arc<dyn Sandbox>,
        store: &Arc<dyn Store>,
        project: &str,
        reply: &str,
    ) -> RecacResult<ProcessOutcome> {
        let mut transcript = String::new();
        let mut executed = 0;

        for body in self.extract_blocks(reply) {
            if is_json_object(&body) {
                debug!("skipping mis-tagged JSON block");
                transcript.push_str("--- Skipped JSON Block ---\n");
                continue;
            }

            let argv = shell_argv(&body);
            let result = sandbox.exec(&argv, self.bash_timeout).await?;
            executed += 1;

            transcript.push_str(&format!("$ {body}\n"));
            if result.timed_out {
                transcript.push_str(&format!(
                    "Command timed out after {} seconds\n--- Command Failed ---\n",
                    self.bash_timeout.as_secs()
                ));
                continue;
            }

            let output = result.combined_output();
            if !output.is_empty() {
                transcript.push_str(&output);
                if !output.ends_with('\n') {
                    transcript.push('\n');
                }
            }
            if !result.success() {
                transcript.push_str(&format!(
                    "--- Command Failed (exit {}) ---\n",
                    result.exit_code
                ));
            }
        }

        if let Some(value) = store.get_signal(project, signal::BLOCKER).await? {
            info!(project, "agent reported a blocker via signal");
            return Err(RecacError::Blocker(value));
        }
        for file in BLOCKER_FILES {
            if let Some(content) = sandbox.read_file(file).await? {
                if !content.trim().is_empty() {
                    info!(project, file, "agent reported a blocker via marker file");
                    return Err(RecacError::Blocker(content.trim().to_string()));
                }
            }
        }

        Ok(ProcessOutcome {
            transcript,
            executed,
        })
    }
}

fn is_json_object(body: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(body.trim()),
        Ok(serde_json::Value::Object(_))
    )
}

/// Collapse a trailing run of one repeated line (3 or more occurrences) to a
/// single occurrence plus a marker. Applying this twice yields the same
/// result as applying it once.
pub fn truncate_repetition(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let Some(last) = lines.last() else {
        return input.to_string();
    };
    if last.trim().is_empty() {
        return input.to_string();
    }

    let run = lines.iter().rev().take_while(|line| *line == last).count();
    if run < 3 {
        return input.to_string();
    }

    let mut out = lines[..lines.len() - run + 1].join("\n");
    out.push_str(&format!(
        "\n[output truncated: previous line repeated {run} times]"
    ));
    out
}
