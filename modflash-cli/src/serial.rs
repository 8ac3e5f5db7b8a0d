//! Serial port selection.
//!
//! An explicit `--port` (or `MODFLASH_PORT`) wins, then `[connection] port`
//! from the config file. Otherwise the attached ports are listed: a single
//! candidate is used directly, several are offered in a prompt.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    modflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Fail instead of prompting when the choice is ambiguous.
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select the serial port to upload through.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port) = &options.port {
        return Ok(port.clone());
    }

    if let Some(port) = &config.connection.port {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    let ports = NativePortEnumerator::list_ports()?;
    match ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = &ports[0];
            info!("Auto-selected port: {}", port.name);
            Ok(port.name.clone())
        },
        Ordering::Less => Err(usage_err(
            "No serial ports found. Connect the board or pass --port",
        )),
        Ordering::Greater if options.non_interactive => Err(usage_err(
            "multiple serial ports found; pass --port to choose one",
        )),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(&ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "multiple serial ports found and no terminal to choose from; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port prompt failed")
            }
        },
    }
}

/// One-line description of a port for listings and prompts.
pub fn port_label(port: &PortInfo) -> String {
    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{vid_pid}{product}", port.name)
}

fn select_port_interactive(ports: &[PortInfo]) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let labels: Vec<String> = ports.iter().map(port_label).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}
