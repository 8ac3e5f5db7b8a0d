//! Loader image programmers.
//!
//! Before the module can be reached, the board's host MCU runs a bridge
//! sketch. Flashing it is delegated to an external tool (bossac, avrdude,
//! ...) described by a command template.

use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::result::ExecOutput;

/// Placeholder replaced with the serial port.
pub const PORT_PLACEHOLDER: &str = "{serial.port.file}";

/// Placeholder replaced with the loader image path.
pub const LOADER_PLACEHOLDER: &str = "{loader.sketch}";

/// Placeholder replaced with the tool directory.
pub const TOOL_DIR_PLACEHOLDER: &str = "{tool_dir}";

/// Flashes the loader image onto the board.
pub trait Programmer {
    /// Flash `loader` through `port`, returning the captured output.
    fn flash(&self, loader: &Path, port: &str) -> Result<ExecOutput>;
}

/// Programmer running a command template as a child process.
#[derive(Debug, Clone)]
pub struct CommandProgrammer {
    template: String,
    tool_dir: Option<PathBuf>,
}

impl CommandProgrammer {
    /// Create a programmer from a template such as
    /// `bossac --port={serial.port.file} -U -e -w -R "{loader.sketch}"`.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            tool_dir: None,
        }
    }

    /// Set the value substituted for `{tool_dir}`.
    #[must_use]
    pub fn with_tool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_dir = Some(dir.into());
        self
    }

    /// Expand the template into program and arguments.
    pub fn command_line(&self, loader: &Path, port: &str) -> Result<Vec<String>> {
        let mut line = self.template.clone();
        if let Some(dir) = &self.tool_dir {
            line = line.replace(TOOL_DIR_PLACEHOLDER, &dir.display().to_string());
        }
        line = line
            .replace(PORT_PLACEHOLDER, port)
            .replace(LOADER_PLACEHOLDER, &loader.display().to_string());

        let args = split_quoted(&line)?;
        if args.is_empty() {
            return Err(Error::Programmer("empty programmer command".into()));
        }
        Ok(args)
    }
}

impl Programmer for CommandProgrammer {
    fn flash(&self, loader: &Path, port: &str) -> Result<ExecOutput> {
        let args = self.command_line(loader, port)?;
        info!("Flashing loader {} on {port}", loader.display());
        debug!("uploading with command: {args:?}");

        let output = Command::new(&args[0])
            .args(&args[1..])
            .output()
            .map_err(|e| Error::Programmer(format!("could not run {}: {e}", args[0])))?;

        let captured = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !output.status.success() {
            return Err(Error::Programmer(format!(
                "{} exited with {}: {}",
                args[0],
                output.status,
                captured.stderr.trim()
            )));
        }
        Ok(captured)
    }
}

/// Split a command line on whitespace, keeping `"`-quoted runs together.
pub fn split_quoted(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            },
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            },
            c => {
                current.push(c);
                in_word = true;
            },
        }
    }

    if quoted {
        return Err(Error::Programmer(format!("unbalanced quotes in: {line}")));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}
