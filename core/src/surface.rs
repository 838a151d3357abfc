//! The primary management surface: the systemd units an operator would
//! reach for first to turn the guard off.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::fsutil;
use crate::install::{self, WATCHDOG_UNIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Enabled,
    /// Installed but disabled, stopped or masked.
    Disabled,
    /// A unit file is gone.
    Removed,
}

impl fmt::Display for SurfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SurfaceState::Enabled => "enabled",
            SurfaceState::Disabled => "disabled",
            SurfaceState::Removed => "removed",
        })
    }
}

pub trait ManagementSurface: Send + Sync {
    fn state(&self) -> Result<SurfaceState>;

    /// Reinstall, unmask, enable and start whatever is missing.
    fn reassert(&self) -> Result<()>;

    /// Stop and disable everything, watchdog included. Used by uninstall.
    fn retire(&self) -> Result<()>;

    fn describe(&self) -> String;
}

pub struct SystemdSurface {
    config: GuardConfig,
    config_path: PathBuf,
    systemctl: PathBuf,
}

impl SystemdSurface {
    pub fn new(config: GuardConfig, config_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            config_path: config_path.into(),
            systemctl: PathBuf::from("systemctl"),
        }
    }

    fn systemctl(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.systemctl)
            .args(args)
            .output()
            .map_err(|e| GuardError::Command {
                command: format!("systemctl {}", args.join(" ")),
                detail: e.to_string(),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn checked(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.systemctl)
            .args(args)
            .output()
            .map_err(|e| GuardError::Command {
                command: format!("systemctl {}", args.join(" ")),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(GuardError::Command {
                command: format!("systemctl {}", args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn units(&self) -> &[String] {
        &self.config.watchdog.units
    }
}

impl ManagementSurface for SystemdSurface {
    fn state(&self) -> Result<SurfaceState> {
        let mut state = SurfaceState::Enabled;
        for unit in self.units() {
            if !self.config.install.systemd_dir.join(unit).exists() {
                tracing::debug!("{unit} has no unit file");
                return Ok(SurfaceState::Removed);
            }
            let enabled = self.systemctl(&["is-enabled", unit])?;
            let active = self.systemctl(&["is-active", unit])?;
            if !matches!(enabled.as_str(), "enabled" | "enabled-runtime" | "static")
                || active != "active"
            {
                tracing::debug!("{unit}: is-enabled={enabled} is-active={active}");
                state = SurfaceState::Disabled;
            }
        }
        Ok(state)
    }

    fn reassert(&self) -> Result<()> {
        let mut reinstalled = false;
        for file in install::unit_files(&self.config, &self.config_path) {
            if !file.path.exists() {
                tracing::warn!("reinstalling {}", file.path.display());
                fsutil::atomic_write(&file.path, file.contents.as_bytes())?;
                reinstalled = true;
            }
        }
        if reinstalled {
            self.checked(&["daemon-reload"])?;
        }

        let units: Vec<&str> = self.units().iter().map(String::as_str).collect();
        let mut unmask = vec!["unmask"];
        unmask.extend(&units);
        self.checked(&unmask)?;
        let mut enable = vec!["enable", "--now"];
        enable.extend(&units);
        self.checked(&enable)?;
        Ok(())
    }

    fn retire(&self) -> Result<()> {
        let mut args = vec!["disable", "--now"];
        args.extend(self.units().iter().map(String::as_str));
        args.push(WATCHDOG_UNIT);
        self.checked(&args)
    }

    fn describe(&self) -> String {
        self.units().join(", ")
    }
}
