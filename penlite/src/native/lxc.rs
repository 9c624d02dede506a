//! Subprocess backend driving the host `lxc-*` userspace tools.
//!
//! Each native operation maps to one tool invocation with piped stdio;
//! the exit status becomes the [`NativeStatus`] code and captured stderr
//! the detail. The subprocess boundary means a crashing native call can
//! never take the controller down with it.
//!
//! Calls block on the child process by design — the instance worker runs
//! them under `spawn_blocking`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::errors::{PenliteError, PenliteResult};
use crate::native::{NativeHandle, NativeOp, NativeRuntime, NativeStatus, ObservedState};
use crate::options::InstanceConfig;

/// Default container path used by the lxc tools.
const DEFAULT_LXC_PATH: &str = "/var/lib/lxc";

/// Native runtime backed by the host's lxc tool suite.
pub struct LxcCommandRuntime {
    lxc_path: PathBuf,
}

impl LxcCommandRuntime {
    /// Runtime using the system default container path.
    pub fn new() -> Self {
        Self {
            lxc_path: PathBuf::from(DEFAULT_LXC_PATH),
        }
    }

    /// Runtime rooted at a custom container path (`lxc-* -P`).
    pub fn with_path(lxc_path: impl Into<PathBuf>) -> Self {
        Self {
            lxc_path: lxc_path.into(),
        }
    }
}

impl Default for LxcCommandRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntime for LxcCommandRuntime {
    fn open(&self, name: &str, config: &InstanceConfig) -> PenliteResult<Box<dyn NativeHandle>> {
        // Opening a session costs one probe: the tool suite must be
        // present and answering before any lifecycle call is attempted.
        let probe = run_tool("lxc-info", &["--version".to_string()]);
        if !probe.success() {
            return Err(PenliteError::NativeCallFailed {
                op: "open".to_string(),
                code: probe.code,
                detail: probe
                    .detail
                    .or_else(|| Some("lxc tools not available on this host".to_string())),
            });
        }

        Ok(Box::new(LxcHandle {
            name: name.to_string(),
            lxc_path: self.lxc_path.clone(),
            config: config.clone(),
        }))
    }
}

/// One instance's session with the lxc tools.
struct LxcHandle {
    name: String,
    lxc_path: PathBuf,
    config: InstanceConfig,
}

impl LxcHandle {
    fn base_args(&self, extra: &[String]) -> Vec<String> {
        let mut args = vec![
            "-P".to_string(),
            self.lxc_path.display().to_string(),
            "-n".to_string(),
            self.name.clone(),
        ];
        args.extend(extra.iter().cloned());
        args
    }

    fn create(&self) -> NativeStatus {
        let mut extra = vec!["-t".to_string()];
        extra.push(
            self.config
                .template
                .clone()
                .unwrap_or_else(|| "download".to_string()),
        );
        if !self.config.template_args.is_empty() {
            extra.push("--".to_string());
            extra.extend(self.config.template_args.iter().cloned());
        }

        let status = run_tool("lxc-create", &self.base_args(&extra));
        if !status.success() {
            return status;
        }

        // Declared limits/mounts/network are passed through verbatim by
        // appending to the container's native config file.
        let lines = render_config_lines(&self.config);
        if lines.is_empty() {
            return status;
        }
        match append_config(&self.lxc_path.join(&self.name).join("config"), &lines) {
            Ok(()) => status,
            Err(e) => NativeStatus::failed(-1, format!("writing instance config: {}", e)),
        }
    }

    fn stop(&self) -> NativeStatus {
        run_tool(
            "lxc-stop",
            &self.base_args(&[
                "-t".to_string(),
                self.config.stop_timeout_secs.to_string(),
            ]),
        )
    }
}

impl NativeHandle for LxcHandle {
    fn invoke(&mut self, op: NativeOp) -> NativeStatus {
        tracing::debug!(instance = %self.name, op = %op, "invoking lxc tool");
        match op {
            NativeOp::Create => self.create(),
            NativeOp::Start => run_tool("lxc-start", &self.base_args(&["-d".to_string()])),
            NativeOp::Stop => self.stop(),
            NativeOp::Freeze => run_tool("lxc-freeze", &self.base_args(&[])),
            NativeOp::Unfreeze => run_tool("lxc-unfreeze", &self.base_args(&[])),
            NativeOp::Destroy => run_tool("lxc-destroy", &self.base_args(&["-f".to_string()])),
        }
    }

    fn observe(&mut self) -> PenliteResult<ObservedState> {
        let output = Command::new("lxc-info")
            .args(self.base_args(&["-s".to_string(), "-H".to_string()]))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PenliteError::NativeCallFailed {
                op: "observe".to_string(),
                code: -1,
                detail: Some(format!("spawning lxc-info: {}", e)),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            // A missing container is a normal answer, not a failed query.
            if stderr.contains("doesn't exist") || stderr.contains("not defined") {
                return Ok(ObservedState::Missing);
            }
            return Err(PenliteError::NativeCallFailed {
                op: "observe".to_string(),
                code: output.status.code().unwrap_or(-1),
                detail: Some(stderr.trim().to_string()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_observed_state(&stdout).ok_or_else(|| PenliteError::NativeCallFailed {
            op: "observe".to_string(),
            code: -1,
            detail: Some(format!("unrecognized lxc-info state: {}", stdout.trim())),
        })
    }

    fn close(&mut self) {
        // Subprocess sessions hold no persistent native resources; each
        // tool invocation stands alone.
        tracing::trace!(instance = %self.name, "lxc session closed");
    }
}

/// Run one lxc tool to completion with piped stdio.
fn run_tool(tool: &str, args: &[String]) -> NativeStatus {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) if output.status.success() => NativeStatus::ok(),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            NativeStatus::failed(output.status.code().unwrap_or(-1), stderr.trim())
        }
        Err(e) => NativeStatus::failed(127, format!("spawning {}: {}", tool, e)),
    }
}

/// Map `lxc-info -sH` output to an observed state.
fn parse_observed_state(stdout: &str) -> Option<ObservedState> {
    match stdout.trim() {
        "RUNNING" => Some(ObservedState::Running),
        "FROZEN" | "FREEZING" => Some(ObservedState::Frozen),
        "STOPPED" => Some(ObservedState::Stopped),
        // Transitional native states count as running for supervision.
        "STARTING" | "STOPPING" | "THAWED" | "ABORTING" => Some(ObservedState::Running),
        _ => None,
    }
}

/// Render the passthrough config entries as native config lines.
fn render_config_lines(config: &InstanceConfig) -> Vec<String> {
    let mut lines = Vec::new();
    for (key, value) in &config.limits {
        lines.push(format!("lxc.cgroup2.{} = {}", key, value));
    }
    for mount in &config.mounts {
        lines.push(format!("lxc.mount.entry = {}", mount));
    }
    if let Some(network) = &config.network {
        lines.push(format!("lxc.net.0.type = {}", network));
    }
    lines
}

fn append_config(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lxc_info_states() {
        assert_eq!(parse_observed_state("RUNNING\n"), Some(ObservedState::Running));
        assert_eq!(parse_observed_state("STOPPED"), Some(ObservedState::Stopped));
        assert_eq!(parse_observed_state("FROZEN"), Some(ObservedState::Frozen));
        assert_eq!(parse_observed_state("STARTING"), Some(ObservedState::Running));
        assert_eq!(parse_observed_state("GARBAGE"), None);
    }

    #[test]
    fn renders_passthrough_config() {
        let mut config = InstanceConfig::with_template("busybox");
        config
            .limits
            .insert("memory.max".to_string(), "256M".to_string());
        config
            .mounts
            .push("/srv/data data none bind 0 0".to_string());
        config.network = Some("veth".to_string());

        let lines = render_config_lines(&config);
        assert_eq!(
            lines,
            vec![
                "lxc.cgroup2.memory.max = 256M",
                "lxc.mount.entry = /srv/data data none bind 0 0",
                "lxc.net.0.type = veth",
            ]
        );
    }

    #[test]
    fn empty_config_renders_nothing() {
        assert!(render_config_lines(&InstanceConfig::default()).is_empty());
    }
}
