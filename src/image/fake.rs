use std::cell::RefCell;
use std::collections::HashMap;

use super::{AccessorError, CommandOutput, Image};

/// Scripted in-memory image for tests.
#[derive(Default)]
pub struct FakeImage {
    pub labels: HashMap<String, String>,
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: HashMap<String, Vec<String>>,
    /// Keyed by the space-joined argv.
    pub commands: HashMap<String, CommandOutput>,
    /// When false, `run_command` reports the capability as unavailable.
    pub has_runtime: bool,
    /// When false, `read_file` and `list_dir` report the capability as unavailable.
    pub has_direct_read: bool,
    /// Simulates a broken channel: every call fails non-recoverably.
    pub broken: bool,
    pub commits: RefCell<Vec<(String, String)>>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeImage {
    pub fn new() -> Self {
        Self {
            has_runtime: true,
            has_direct_read: true,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn with_dir(mut self, path: &str, entries: &[&str]) -> Self {
        self.dirs
            .insert(path.to_string(), entries.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_command(mut self, argv: &[&str], stdout: &str, exit_code: i32) -> Self {
        self.commands.insert(
            argv.join(" "),
            CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            },
        );
        self
    }

    pub fn without_runtime(mut self) -> Self {
        self.has_runtime = false;
        self
    }

    pub fn without_direct_read(mut self) -> Self {
        self.has_direct_read = false;
        self
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn check_channel(&self) -> Result<(), AccessorError> {
        if self.broken {
            return Err(AccessorError::CommandFailed {
                command: "fake".to_string(),
                exit_code: 125,
                stderr: "daemon unreachable".to_string(),
            });
        }
        Ok(())
    }

    fn check_direct_read(&self) -> Result<(), AccessorError> {
        self.check_channel()?;
        if !self.has_direct_read {
            return Err(AccessorError::Unavailable {
                capability: "file read",
                reason: "disabled in fake".to_string(),
            });
        }
        Ok(())
    }
}

impl Image for FakeImage {
    fn config_labels(&self) -> Result<HashMap<String, String>, AccessorError> {
        self.check_channel()?;
        self.calls.borrow_mut().push("config".to_string());
        Ok(self.labels.clone())
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, AccessorError> {
        self.check_direct_read()?;
        self.calls.borrow_mut().push(format!("read {path}"));
        Ok(self.files.get(path).cloned())
    }

    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, AccessorError> {
        self.check_direct_read()?;
        self.calls.borrow_mut().push(format!("list {path}"));
        Ok(self.dirs.get(path).map(|entries| {
            let mut entries = entries.clone();
            entries.sort();
            entries
        }))
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, AccessorError> {
        self.check_channel()?;
        let key = argv.join(" ");
        self.calls.borrow_mut().push(format!("run {key}"));
        if !self.has_runtime {
            return Err(AccessorError::Unavailable {
                capability: "command execution",
                reason: "disabled in fake".to_string(),
            });
        }
        match self.commands.get(&key) {
            Some(output) => Ok(output.clone()),
            None => Err(AccessorError::Unavailable {
                capability: "command execution",
                reason: format!("{} not found in image", argv.first().unwrap_or(&"")),
            }),
        }
    }

    fn commit_with_label(&self, key: &str, value: &str) -> Result<String, AccessorError> {
        self.check_channel()?;
        self.commits
            .borrow_mut()
            .push((key.to_string(), value.to_string()));
        Ok(format!("sha256:{}", "ab".repeat(32)))
    }
}
