//! External encoder process.
//!
//! The hardware encoder is driven by a command line tool (e.g. `rpicam-vid`
//! or `ffmpeg`) that writes the encoded stream straight to the segment file.
//! Starting a segment spawns the command with `{path}` substituted; stopping
//! interrupts it and waits for it to flush. An encoder that exits on its own
//! mid-segment, or that has to be killed, is reported as an error.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const PATH_PLACEHOLDER: &str = "{path}";
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct CommandEncoder {
    argv: Vec<String>,
    stop_grace: Duration,
    running: Option<Running>,
}

struct Running {
    child: Child,
    path: PathBuf,
}

impl CommandEncoder {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!("encoder command cannot be empty"));
        }
        if !argv.iter().any(|arg| arg.contains(PATH_PLACEHOLDER)) {
            return Err(anyhow!(
                "encoder command must contain a {} placeholder",
                PATH_PLACEHOLDER
            ));
        }
        Ok(Self {
            argv,
            stop_grace: DEFAULT_STOP_GRACE,
            running: None,
        })
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self, path: &Path) -> Result<()> {
        if let Some(running) = &self.running {
            return Err(anyhow!(
                "encoder already writing {}",
                running.path.display()
            ));
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("segment path {} is not valid UTF-8", path.display()))?;
        let args: Vec<String> = self
            .argv
            .iter()
            .map(|arg| arg.replace(PATH_PLACEHOLDER, path_str))
            .collect();
        let child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn encoder {}", args[0]))?;
        log::debug!(
            "CommandEncoder: pid {} writing {}",
            child.id(),
            path.display()
        );
        self.running = Some(Running {
            child,
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Error if the encoder died while it should be writing.
    pub fn check_alive(&mut self) -> Result<()> {
        let Some(running) = &mut self.running else {
            return Ok(());
        };
        if let Some(status) = running.child.try_wait()? {
            let path = running.path.clone();
            self.running = None;
            return Err(anyhow!(
                "encoder exited unexpectedly ({}) while writing {}",
                status,
                path.display()
            ));
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Err(anyhow!("encoder is not running"));
        };
        if let Some(status) = running.child.try_wait()? {
            return Err(anyhow!(
                "encoder exited before stop ({}) while writing {}",
                status,
                running.path.display()
            ));
        }

        interrupt(&running.child)?;
        let deadline = Instant::now() + self.stop_grace;
        loop {
            if let Some(status) = running.child.try_wait()? {
                log::debug!(
                    "CommandEncoder: finished {} ({})",
                    running.path.display(),
                    status
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        running.child.kill()?;
        running.child.wait()?;
        Err(anyhow!(
            "encoder did not stop within {:?}; {} may be truncated",
            self.stop_grace,
            running.path.display()
        ))
    }
}

impl Drop for CommandEncoder {
    fn drop(&mut self) {
        if let Some(running) = &mut self.running {
            let _ = running.child.kill();
            let _ = running.child.wait();
        }
    }
}

#[cfg(target_os = "linux")]
fn interrupt(child: &Child) -> Result<()> {
    let pid = libc::pid_t::try_from(child.id()).map_err(|_| anyhow!("encoder pid out of range"))?;
    // SAFETY: kill(2) with a pid we spawned and still own (not yet reaped).
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        return Err(anyhow::Error::new(std::io::Error::last_os_error()).context("signal encoder"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn interrupt(_child: &Child) -> Result<()> {
    // No portable interrupt; the grace loop falls through to kill().
    Ok(())
}
