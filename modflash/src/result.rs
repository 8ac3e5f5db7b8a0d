//! Upload results.

/// Prefix announcing the installed firmware version in device output.
pub const VERSION_PREFIX: &str = "Firmware version installed: ";

/// Captured output of an external step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Append a line to stdout.
    pub fn say(&mut self, line: impl AsRef<str>) {
        self.stdout.push_str(line.as_ref());
        self.stdout.push('\n');
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlashResult {
    /// Output of the loader programmer.
    pub programmer: ExecOutput,
    /// Output of the module flash engine.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub flasher: Option<ExecOutput>,
    /// Firmware version found in the device output.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub version: Option<String>,
}

/// Find the version announced with [`VERSION_PREFIX`] in `output`.
pub fn parse_firmware_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(VERSION_PREFIX)?;
        let version = rest.trim();
        (!version.is_empty()).then(|| version.to_string())
    })
}
