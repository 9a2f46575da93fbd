//! Subprocess invocation for the command-line firewall backends.

use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of one tool invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs an external program to completion.
///
/// Backends only ever talk to the packet-filter tools through this trait so
/// that their argument vectors and output parsing can be exercised without
/// privileges.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs programs for real, under the C locale so diagnostics can be matched.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8")
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Replays canned outputs in order and records every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<VecDeque<CommandOutput>>,
        pub calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn reply(self, status: i32, stdout: &str, stderr: &str) -> Self {
            self.replies.lock().unwrap().push_back(CommandOutput {
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
            self
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or(CommandOutput {
                status: Some(0),
                ..CommandOutput::default()
            }))
        }
    }
}
