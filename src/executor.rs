//! Runs the external toolchain inside a sandbox directory.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe, setsid, Pid};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BuildLimits, ToolchainConfig};
use crate::error::JobError;
use crate::job::{Artifact, PackagePath};

/// Drives one toolchain configuration. Shared by all workers.
#[derive(Debug, Clone)]
pub struct BuildExecutor {
    config: ToolchainConfig,
}

impl BuildExecutor {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    /// Arguments after the program: `get [-insecure] <package>`.
    pub fn toolchain_args(&self, package: &PackagePath, insecure: bool) -> Vec<String> {
        let mut args = self.config.leading_args().to_vec();
        args.extend(self.config.build_args.iter().cloned());
        if insecure {
            args.push(self.config.insecure_flag.clone());
        }
        args.push(package.as_str().to_string());
        args
    }

    /// Build `package` in `sandbox`, returning the combined stdout+stderr.
    ///
    /// The process runs in its own session so that cancellation and timeouts
    /// can take down everything it spawned.
    pub async fn run_toolchain(
        &self,
        sandbox: &Path,
        package: &PackagePath,
        insecure: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, JobError> {
        let program = self.config.program().to_string();
        let args = self.toolchain_args(package, insecure);
        let env = isolated_environment(std::env::vars_os(), &self.config.workspace_var, sandbox);
        info!(program = %program, args = ?args, "Running toolchain");

        let (output_rx, output_tx) = pipe().map_err(|e| launch_error(&program, e.into()))?;
        let stderr_tx = output_tx
            .try_clone()
            .map_err(|e| launch_error(&program, e))?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(sandbox)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_tx))
            .stderr(Stdio::from(stderr_tx))
            .kill_on_drop(true);
        let limits = self.config.limits;
        // SAFETY: only async-signal-safe syscalls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                setsid()?;
                apply_limits(&limits)?;
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // The command holds the write ends of the pipe; the reader only sees
        // EOF once every copy is closed.
        drop(cmd);
        let mut child = spawned.map_err(|e| launch_error(&program, e))?;
        let pid = child.id();
        debug!(pid = ?pid, "Toolchain spawned");

        let max_log = self.config.max_log_bytes;
        let reader = tokio::task::spawn_blocking(move || read_output(output_rx, max_log));

        let status: Result<ExitStatus, String> = tokio::select! {
            status = child.wait() => status.map_err(|e| format!("wait: {}", e)),
            _ = cancel.cancelled() => {
                kill_group(pid);
                let _ = child.wait().await;
                info!("Toolchain killed: request cancelled");
                return Err(JobError::Cancelled);
            }
            _ = tokio::time::sleep(self.config.timeout) => {
                kill_group(pid);
                let _ = child.wait().await;
                Err(format!("timed out after {}s", self.config.timeout.as_secs()))
            }
        };

        let log = match reader.await {
            Ok(Ok(log)) => log,
            Ok(Err(e)) => format!("read toolchain output: {}\n", e).into_bytes(),
            Err(e) => format!("read toolchain output: {}\n", e).into_bytes(),
        };

        match status {
            Ok(status) if status.success() => {
                debug!(output_len = log.len(), "Toolchain succeeded");
                Ok(log)
            }
            Ok(status) => Err(JobError::Build {
                reason: status.to_string(),
                log,
            }),
            Err(reason) => Err(JobError::Build { reason, log }),
        }
    }

    /// Where the toolchain installs the binary for `package`.
    pub fn artifact_path(&self, sandbox: &Path, package: &PackagePath) -> PathBuf {
        sandbox
            .join(&self.config.output_dir)
            .join(package.binary_name())
    }

    /// Open the built binary for reading.
    pub async fn resolve_artifact(
        &self,
        sandbox: &Path,
        package: &PackagePath,
    ) -> Result<Artifact, JobError> {
        let path = self.artifact_path(sandbox, package);
        let missing = |source: io::Error| JobError::ArtifactMissing {
            path: path.clone(),
            source,
        };

        let file = tokio::fs::File::open(&path).await.map_err(missing)?;
        let metadata = file.metadata().await.map_err(missing)?;
        if !metadata.is_file() {
            return Err(missing(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }

        Ok(Artifact {
            file,
            len: metadata.len(),
            name: package.binary_name().to_string(),
        })
    }
}

/// Copy `base`, pointing `workspace_var` at `sandbox`.
pub fn isolated_environment<I>(base: I, workspace_var: &str, sandbox: &Path) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = base
        .into_iter()
        .filter(|(key, _)| key != workspace_var)
        .collect();
    env.push((OsString::from(workspace_var), sandbox.as_os_str().to_owned()));
    env
}

/// Capture the toolchain's version and environment report.
///
/// Runs once at startup; the service cannot describe itself without it.
pub fn toolchain_info(config: &ToolchainConfig) -> io::Result<Vec<u8>> {
    let mut info = capture(config, &config.version_args)?;
    info.extend(capture(config, &config.env_args)?);
    Ok(info)
}

fn capture(config: &ToolchainConfig, args: &[String]) -> io::Result<Vec<u8>> {
    let output = std::process::Command::new(config.program())
        .args(config.leading_args())
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "{} {}: {}",
            config.program(),
            args.join(" "),
            output.status
        )));
    }
    let mut combined = output.stdout;
    combined.extend(output.stderr);
    Ok(combined)
}

fn apply_limits(limits: &BuildLimits) -> nix::Result<()> {
    if let Some(secs) = limits.cpu_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs)?;
    }
    if let Some(kb) = limits.address_space_kb {
        let bytes = kb.saturating_mul(1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(kb) = limits.file_size_kb {
        let bytes = kb.saturating_mul(1024);
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if let Some(n) = limits.open_files {
        setrlimit(Resource::RLIMIT_NOFILE, n, n)?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)
}

/// Read everything the toolchain writes, keeping at most `max` bytes.
fn read_output(fd: OwnedFd, max: usize) -> io::Result<Vec<u8>> {
    let mut file = File::from(fd);
    let mut log = Vec::new();
    (&mut file).take(max as u64).read_to_end(&mut log)?;
    // Keep draining so the toolchain never blocks on a full pipe.
    let dropped = io::copy(&mut file, &mut io::sink())?;
    if dropped > 0 {
        log.extend_from_slice(format!("\n[{} bytes of output truncated]\n", dropped).as_bytes());
    }
    Ok(log)
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, error = %e, "Failed to kill toolchain process group");
    }
}

fn launch_error(program: &str, e: io::Error) -> JobError {
    JobError::Build {
        reason: format!("launch {}: {}", program, e),
        log: Vec::new(),
    }
}
