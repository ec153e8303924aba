//! Built-in tools: shell execution and file access.
//!
//! Every side effect routes through the security kernel first: commands
//! through [`validate_command_secure`] with a sanitised environment, paths
//! through the [`PathPolicy`]. The filesystem tools carry a dynamic
//! permission function — touching a sensitive path upgrades the call from
//! `Auto` to `Ask`, and the registry guarantees no user preference can
//! downgrade that verdict.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::CoreError;
use crate::security::{
    is_sensitive_path, sanitize_environment, validate_command_secure, OpenMode, PathPolicy,
};

use super::{
    ParamSchema, ParamType, PermissionFn, PermissionLevel, RiskLevel, Tool, ToolOutput, ToolParams,
};

/// Registry with the standard tool set rooted at `workdir`.
pub fn default_registry(workdir: PathBuf, policy: PathPolicy) -> super::ToolRegistry {
    let mut registry = super::ToolRegistry::new();
    registry.register(run_command_tool(workdir));
    registry.register(read_file_tool(policy.clone()));
    registry.register(write_file_tool(policy));
    registry
}

/// Dynamic permission for filesystem tools: sensitive paths demand `Ask`.
fn path_permission() -> PermissionFn {
    Arc::new(|params: &ToolParams| {
        let path = params.get("path").and_then(|v| v.as_str()).unwrap_or("");
        if is_sensitive_path(Path::new(path)) {
            PermissionLevel::Ask
        } else {
            PermissionLevel::Auto
        }
    })
}

/// `run_command` — execute a shell command in the working directory.
pub fn run_command_tool(workdir: PathBuf) -> Tool {
    Tool {
        name: "run_command".into(),
        description: "Run a shell command and return its output".into(),
        permission: PermissionLevel::Ask,
        permission_fn: None,
        risk: RiskLevel::High,
        schema: ParamSchema::new()
            .required("command", ParamType::String)
            .optional("timeout", ParamType::Number),
        run: Arc::new(move |params, token| {
            let workdir = workdir.clone();
            Box::pin(async move {
                let command = params
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                validate_command_secure(&command)?;

                let (program, args) = host_shell(&command);
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args)
                    .env_clear()
                    .envs(sanitize_environment())
                    .current_dir(&workdir)
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped())
                    .stdin(std::process::Stdio::null());
                let mut child = cmd
                    .spawn()
                    .map_err(|e| CoreError::Transport(format!("spawning shell: {e}")))?;

                // Drain both pipes concurrently with the wait so a chatty
                // process cannot deadlock on a full pipe buffer.
                let mut stdout_pipe = child.stdout.take().expect("stdout piped");
                let mut stderr_pipe = child.stderr.take().expect("stderr piped");
                let stdout_task = tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let _ = stdout_pipe.read_to_end(&mut buf).await;
                    buf
                });
                let stderr_task = tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let _ = stderr_pipe.read_to_end(&mut buf).await;
                    buf
                });

                let status = tokio::select! {
                    _ = token.cancelled() => {
                        let _ = child.kill().await;
                        return Err(CoreError::Cancelled);
                    }
                    status = child.wait() => {
                        status.map_err(|e| CoreError::Transport(format!("waiting on shell: {e}")))?
                    }
                };

                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();

                let mut output = String::from_utf8_lossy(&stdout).into_owned();
                if !stderr.is_empty() {
                    if !output.is_empty() && !output.ends_with('\n') {
                        output.push('\n');
                    }
                    output.push_str("[stderr]\n");
                    output.push_str(&String::from_utf8_lossy(&stderr));
                }

                let exit_code = status.code().unwrap_or(-1);
                debug!(exit_code, "shell command finished");
                Ok(ToolOutput { output, exit_code: Some(exit_code) })
            })
        }),
    }
}

/// Host shell invocation: `cmd /C` on Windows, `bash -c` elsewhere.
fn host_shell(command: &str) -> (&'static str, Vec<String>) {
    #[cfg(windows)]
    {
        ("cmd", vec!["/C".to_string(), command.to_string()])
    }
    #[cfg(not(windows))]
    {
        ("bash", vec!["-c".to_string(), command.to_string()])
    }
}

/// `read_file` — read a file through the path policy.
pub fn read_file_tool(policy: PathPolicy) -> Tool {
    Tool {
        name: "read_file".into(),
        description: "Read a file inside the allowed directories".into(),
        permission: PermissionLevel::Auto,
        permission_fn: Some(path_permission()),
        risk: RiskLevel::Low,
        schema: ParamSchema::new().required("path", ParamType::String),
        run: Arc::new(move |params, _token| {
            let policy = policy.clone();
            Box::pin(async move {
                let path = params
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                // Blocking filesystem work stays off the async worker.
                tokio::task::spawn_blocking(move || {
                    let (mut file, real) =
                        policy.open_secure(Path::new(&path), OpenMode::Read)?;
                    let mut content = String::new();
                    file.read_to_string(&mut content).map_err(|e| {
                        CoreError::Transport(format!("reading {}: {e}", real.display()))
                    })?;
                    Ok(ToolOutput { output: content, exit_code: None })
                })
                .await
                .map_err(|e| CoreError::Transport(format!("read worker: {e}")))?
            })
        }),
    }
}

/// `write_file` — create or overwrite a file through the path policy.
pub fn write_file_tool(policy: PathPolicy) -> Tool {
    Tool {
        name: "write_file".into(),
        description: "Create or overwrite a file inside the allowed directories".into(),
        permission: PermissionLevel::Ask,
        permission_fn: Some(path_permission()),
        risk: RiskLevel::Medium,
        schema: ParamSchema::new()
            .required("path", ParamType::String)
            .required("content", ParamType::String),
        run: Arc::new(move |params, _token| {
            let policy = policy.clone();
            Box::pin(async move {
                let path = params
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let content = params
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();

                tokio::task::spawn_blocking(move || {
                    let candidate = Path::new(&path);
                    if candidate.exists() {
                        // Existing file: the open-and-revalidate primitive
                        // holds the handle the write goes through.
                        let (file, real) = policy.open_secure(candidate, OpenMode::Write)?;
                        file.set_len(0).map_err(|e| {
                            CoreError::Transport(format!("truncating {}: {e}", real.display()))
                        })?;
                        use std::io::Write as _;
                        let mut file = file;
                        file.write_all(content.as_bytes()).map_err(|e| {
                            CoreError::Transport(format!("writing {}: {e}", real.display()))
                        })?;
                        Ok(ToolOutput {
                            output: format!("wrote {} bytes to {}", content.len(), real.display()),
                            exit_code: None,
                        })
                    } else {
                        // New file: validate the parent directory instead —
                        // a nonexistent path has nothing to resolve.
                        let parent = candidate.parent().ok_or_else(|| {
                            CoreError::PathTraversal(format!("{path}: no parent directory"))
                        })?;
                        let real_parent = policy.validate(parent)?;
                        let target = real_parent.join(
                            candidate
                                .file_name()
                                .ok_or_else(|| CoreError::PathTraversal(path.clone()))?,
                        );
                        std::fs::write(&target, content.as_bytes()).map_err(|e| {
                            CoreError::Transport(format!("writing {}: {e}", target.display()))
                        })?;
                        Ok(ToolOutput {
                            output: format!("created {}", target.display()),
                            exit_code: None,
                        })
                    }
                })
                .await
                .map_err(|e| CoreError::Transport(format!("write worker: {e}")))?
            })
        }),
    }
}
