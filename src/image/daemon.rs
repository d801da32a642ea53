//! Images held by a container daemon, driven through its CLI.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::process::{Command, Output};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{AccessorError, CommandOutput, Image};

/// Exit code the docker CLI uses when `docker run` itself fails.
const EXIT_RUN_FAILED: i32 = 125;
/// Exit codes for "found but not executable" and "not found" in the container.
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;
/// Command given to the helper container of an image with no default command.
const PLACEHOLDER_CMD: &str = "deplab-placeholder";

/// The parts of the image config that decide how a container starts.
#[derive(Debug, Default, Deserialize)]
struct StartConfig {
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
}

impl StartConfig {
    fn has_default_command(&self) -> bool {
        let present = |v: &Option<Vec<String>>| v.as_ref().is_some_and(|v| !v.is_empty());
        present(&self.cmd) || present(&self.entrypoint)
    }
}

/// An image held by a container daemon, driven through its CLI
/// (`docker`/`podman`).
///
/// Filesystem reads go through a created-but-never-started helper container,
/// which is also the base for the commit. It keeps the image's own start
/// command so the commit does not change it, and is removed on drop.
pub struct DaemonImage {
    cmd: String,
    reference: String,
    tag: Option<String>,
    start: StartConfig,
    container: RefCell<Option<String>>,
}

impl DaemonImage {
    /// Make sure `reference` is available locally, pulling it if needed.
    pub fn open(cmd: String, reference: String, tag: Option<String>) -> Result<Self, AccessorError> {
        let mut image = Self {
            cmd,
            reference,
            tag,
            start: StartConfig::default(),
            container: RefCell::new(None),
        };

        let inspect = image.cli(&["image", "inspect", "--format", "{{.Id}}", &image.reference])?;
        if !inspect.status.success() {
            info!("{} not present locally, pulling", image.reference);
            image.checked(&["pull", &image.reference])?;
        }

        let config = image.checked(&["image", "inspect", "--format", "{{json .Config}}", &image.reference])?;
        image.start = parse_start_config(&config).map_err(|source| AccessorError::Decode {
            what: format!("config of {}", image.reference),
            source,
        })?;

        Ok(image)
    }

    fn cli(&self, args: &[&str]) -> Result<Output, AccessorError> {
        debug!("{} {}", self.cmd, args.join(" "));
        Command::new(&self.cmd)
            .args(args)
            .output()
            .map_err(|source| AccessorError::Spawn {
                program: self.cmd.clone(),
                source,
            })
    }

    /// Run the CLI and turn a non-zero exit into an error.
    fn checked(&self, args: &[&str]) -> Result<Vec<u8>, AccessorError> {
        let output = self.cli(args)?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(output.stdout)
    }

    fn failure(&self, args: &[&str], output: &Output) -> AccessorError {
        AccessorError::CommandFailed {
            command: format!("{} {}", self.cmd, args.first().copied().unwrap_or_default()),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    fn container_id(&self) -> Result<String, AccessorError> {
        if let Some(id) = self.container.borrow().as_ref() {
            return Ok(id.clone());
        }

        let args = create_args(&self.reference, &self.start);
        let stdout = self.checked(&args)?;
        let id = String::from_utf8_lossy(&stdout).trim().to_string();
        debug!("created helper container {id}");
        *self.container.borrow_mut() = Some(id.clone());
        Ok(id)
    }

    /// `docker cp <cid>:<path> -` as a tar stream, or `None` when the path
    /// does not exist in the image.
    fn copy_out(&self, path: &str) -> Result<Option<Vec<u8>>, AccessorError> {
        let source = format!("{}:{path}", self.container_id()?);
        let args = ["cp", "-L", source.as_str(), "-"];
        let output = self.cli(&args)?;

        if output.status.success() {
            return Ok(Some(output.stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_path(&stderr) {
            debug!("{path} not found in {}", self.reference);
            return Ok(None);
        }
        Err(self.failure(&args, &output))
    }
}

fn is_missing_path(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("could not find the file") || stderr.contains("no such file or directory")
}

impl Image for DaemonImage {
    fn config_labels(&self) -> Result<HashMap<String, String>, AccessorError> {
        let stdout = self.checked(&[
            "image",
            "inspect",
            "--format",
            "{{json .Config.Labels}}",
            &self.reference,
        ])?;
        let labels: Option<HashMap<String, String>> =
            serde_json::from_slice(&stdout).map_err(|source| AccessorError::Decode {
                what: format!("labels of {}", self.reference),
                source,
            })?;
        Ok(labels.unwrap_or_default())
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, AccessorError> {
        match self.copy_out(path)? {
            Some(stream) => first_file_in_tar(&stream),
            None => Ok(None),
        }
    }

    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>, AccessorError> {
        match self.copy_out(path)? {
            Some(stream) => children_in_tar(&stream).map(Some),
            None => Ok(None),
        }
    }

    fn run_command(&self, argv: &[&str]) -> Result<CommandOutput, AccessorError> {
        let Some((program, rest)) = argv.split_first() else {
            return Err(AccessorError::Unavailable {
                capability: "command execution",
                reason: "empty command".to_string(),
            });
        };

        // Override the entrypoint so images with non-shell entrypoints still
        // run exactly `argv`.
        let mut args = vec!["run", "--rm", "--entrypoint", *program, self.reference.as_str()];
        args.extend_from_slice(rest);
        let output = self.cli(&args)?;
        let exit_code = output.status.code().unwrap_or(-1);

        match exit_code {
            EXIT_RUN_FAILED => Err(self.failure(&args, &output)),
            EXIT_NOT_EXECUTABLE | EXIT_NOT_FOUND => Err(AccessorError::Unavailable {
                capability: "command execution",
                reason: format!(
                    "'{program}' cannot be run in {}: {}",
                    self.reference,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
            _ => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                exit_code,
            }),
        }
    }

    fn commit_with_label(&self, key: &str, value: &str) -> Result<String, AccessorError> {
        let container = self.container_id()?;
        let changes = commit_changes(key, value, &self.start);
        let mut args = vec!["commit"];
        for change in &changes {
            args.extend(["--change", change.as_str()]);
        }
        args.push(container.as_str());
        if let Some(tag) = &self.tag {
            args.push(tag.as_str());
        }

        let stdout = self.checked(&args)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

impl Drop for DaemonImage {
    fn drop(&mut self) {
        if let Some(id) = self.container.get_mut().take() {
            if let Err(err) = self.checked(&["rm", "-f", &id]) {
                warn!("failed to remove helper container {id}: {err}");
            }
        }
    }
}

fn parse_start_config(json: &[u8]) -> Result<StartConfig, serde_json::Error> {
    let config: Option<StartConfig> = serde_json::from_slice(json)?;
    Ok(config.unwrap_or_default())
}

/// `create` arguments for the helper container. The image's own command is
/// kept whenever it has one; the placeholder is only there because `create`
/// refuses an image with nothing to run.
fn create_args<'a>(reference: &'a str, start: &StartConfig) -> Vec<&'a str> {
    let mut args = vec!["create", reference];
    if !start.has_default_command() {
        args.push(PLACEHOLDER_CMD);
    }
    args
}

/// `--change` instructions for the commit: the label, and clearing the
/// placeholder command again when one was needed.
fn commit_changes(key: &str, value: &str, start: &StartConfig) -> Vec<String> {
    let mut changes = vec![label_instruction(key, value)];
    if !start.has_default_command() {
        changes.push("CMD []".to_string());
    }
    changes
}

/// A Dockerfile `LABEL` instruction with the value quoted so JSON survives
/// and no variable expansion applies.
fn label_instruction(key: &str, value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' | '$' => {
                quoted.push('\\');
                quoted.push(c);
            }
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    format!("LABEL {key}={quoted}")
}

fn first_file_in_tar(stream: &[u8]) -> Result<Option<Vec<u8>>, AccessorError> {
    let mut archive = tar::Archive::new(Cursor::new(stream));
    let mut entries = archive
        .entries()
        .map_err(|e| AccessorError::Archive(format!("bad copy stream: {e}")))?;

    // A file copies out as a single entry; a directory as itself followed
    // by its contents.
    let Some(entry_result) = entries.next() else {
        return Ok(None);
    };
    let mut entry = entry_result.map_err(|e| AccessorError::Archive(format!("bad copy stream: {e}")))?;
    if !entry.header().entry_type().is_file() {
        return Ok(None);
    }
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|e| AccessorError::Archive(format!("bad copy stream: {e}")))?;
    Ok(Some(data))
}

fn children_in_tar(stream: &[u8]) -> Result<Vec<String>, AccessorError> {
    let mut archive = tar::Archive::new(Cursor::new(stream));
    let entries = archive
        .entries()
        .map_err(|e| AccessorError::Archive(format!("bad copy stream: {e}")))?;

    let mut names = Vec::new();
    for entry_result in entries {
        let entry = entry_result.map_err(|e| AccessorError::Archive(format!("bad copy stream: {e}")))?;
        let Ok(path) = entry.path() else { continue };
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        // The stream is rooted at the directory itself: `dir/`, `dir/child`.
        if parts.len() == 2 && !names.contains(&parts[1]) {
            names.push(parts[1].clone());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            let body = content.unwrap_or("");
            header.set_entry_type(if content.is_some() {
                tar::EntryType::Regular
            } else {
                tar::EntryType::Directory
            });
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_first_file_in_copy_stream() {
        let data = stream(&[("os-release", Some("NAME=\"Ubuntu\"\n"))]);
        assert_eq!(
            first_file_in_tar(&data).unwrap(),
            Some(b"NAME=\"Ubuntu\"\n".to_vec())
        );
    }

    #[test]
    fn test_directory_stream_has_no_file_at_top() {
        let data = stream(&[("status.d/", None)]);
        assert_eq!(first_file_in_tar(&data).unwrap(), None);
    }

    #[test]
    fn test_directory_is_not_read_as_its_first_file() {
        let data = stream(&[
            ("apt/", None),
            ("apt/sources.list", Some("deb http://archive.ubuntu.com/ubuntu bionic main\n")),
        ]);
        assert_eq!(first_file_in_tar(&data).unwrap(), None);
    }

    #[test]
    fn test_children_in_copy_stream() {
        let data = stream(&[
            ("status.d/", None),
            ("status.d/libc6", Some("Package: libc6\n")),
            ("status.d/base", Some("Package: base-files\n")),
            ("status.d/nested/", None),
            ("status.d/nested/deep", Some("x")),
        ]);
        assert_eq!(
            children_in_tar(&data).unwrap(),
            vec!["base".to_string(), "libc6".to_string(), "nested".to_string()]
        );
    }

    #[test]
    fn test_missing_path_detection() {
        assert!(is_missing_path(
            "Error: No such container:path: abc:/etc/os-release\nCould not find the file /etc/os-release in container abc"
        ));
        assert!(is_missing_path("lstat /var/lib/docker/x/etc/os-release: no such file or directory"));
        assert!(!is_missing_path("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn test_label_instruction_quotes_json() {
        assert_eq!(
            label_instruction("io.pivotal.metadata", r#"{"base":{"name":"Ubuntu"}}"#),
            r#"LABEL io.pivotal.metadata="{\"base\":{\"name\":\"Ubuntu\"}}""#
        );
    }

    #[test]
    fn test_label_instruction_blocks_variable_expansion() {
        assert_eq!(
            label_instruction("k", "deb http://example.com/$(ARCH) $VAR main"),
            r#"LABEL k="deb http://example.com/\$(ARCH) \$VAR main""#
        );
    }

    #[test]
    fn test_commit_keeps_the_image_command() {
        let start = parse_start_config(
            br#"{"Cmd":["nginx","-g","daemon off;"],"Entrypoint":null,"Labels":{"a":"b"}}"#,
        )
        .unwrap();

        assert_eq!(create_args("nginx:latest", &start), vec!["create", "nginx:latest"]);
        let changes = commit_changes("io.pivotal.metadata", "{}", &start);
        assert_eq!(changes, vec![r#"LABEL io.pivotal.metadata="{}""#.to_string()]);
    }

    #[test]
    fn test_entrypoint_only_image_needs_no_placeholder() {
        let start = parse_start_config(br#"{"Cmd":null,"Entrypoint":["/app"]}"#).unwrap();
        assert_eq!(create_args("app", &start), vec!["create", "app"]);
        assert_eq!(commit_changes("k", "v", &start).len(), 1);
    }

    #[test]
    fn test_placeholder_command_is_cleared_on_commit() {
        let start = parse_start_config(b"null").unwrap();
        assert_eq!(
            create_args("scratch-image", &start),
            vec!["create", "scratch-image", PLACEHOLDER_CMD]
        );
        assert_eq!(
            commit_changes("k", "v", &start),
            vec![r#"LABEL k="v""#.to_string(), "CMD []".to_string()]
        );
    }
}
