//! Flash, certificate upload and version query command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use modflash::{
    Backoff, CancelToken, CommandProgrammer, FlashResult, NativeSessionFactory, RetryPolicy,
    SerialTouch, Transfer, UploadPlan, Uploader,
};
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, UploadArgs, get_port, use_fancy_output};

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    args: &UploadArgs,
    firmware: &Path,
    read_version: bool,
    cancel: &CancelToken,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = std::fs::read(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;

    let port = get_port(cli, config)?;
    let mut plan = upload_plan(args, config, &port);
    plan.firmware = Some(image);
    plan.read_version = read_version;

    let result = run_upload(cli, config, args, &plan, cancel)?;
    report(cli, args.json, &result, "Firmware flashed")
}

/// Read the installed firmware version without changing anything.
pub(crate) fn cmd_get_version(
    cli: &Cli,
    config: &Config,
    args: &UploadArgs,
    cancel: &CancelToken,
) -> Result<()> {
    let port = get_port(cli, config)?;
    let mut plan = upload_plan(args, config, &port);
    plan.read_version = true;

    let result = run_upload(cli, config, args, &plan, cancel)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let version = result
        .version
        .context("The module did not report a firmware version")?;
    println!("{}{version}", modflash::result::VERSION_PREFIX);
    Ok(())
}

/// Build the plan shared by every device command.
pub(crate) fn upload_plan(args: &UploadArgs, config: &Config, port: &str) -> UploadPlan {
    let mut plan = UploadPlan::new(args.module, port);
    plan.loader.clone_from(&args.loader);
    plan.touch = args.touch || config.upload.touch;
    plan
}

/// Retry policy from flags and config.
pub(crate) fn retry_policy(args: &UploadArgs, config: &Config) -> RetryPolicy {
    let mut policy = args
        .retries
        .or(config.upload.retries)
        .map_or_else(RetryPolicy::default, RetryPolicy::with_retries);
    if let Some(delay) = config.retry_delay() {
        policy = policy.with_backoff(Backoff::Fixed(delay));
    }
    policy
}

/// Programmer for the loader image, if one is needed.
pub(crate) fn programmer(args: &UploadArgs, config: &Config) -> Result<Option<CommandProgrammer>> {
    if args.loader.is_none() {
        return Ok(None);
    }
    let template = args
        .programmer
        .clone()
        .or_else(|| config.programmer.command.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "--loader needs a programmer command (--programmer or [programmer] command)"
                    .to_string(),
            )
        })?;

    let mut programmer = CommandProgrammer::new(template);
    if let Some(dir) = &config.programmer.tool_dir {
        programmer = programmer.with_tool_dir(dir);
    }
    Ok(Some(programmer))
}

/// Run `plan` with a progress bar, retrying per the configured policy.
pub(crate) fn run_upload(
    cli: &Cli,
    config: &Config,
    args: &UploadArgs,
    plan: &UploadPlan,
    cancel: &CancelToken,
) -> Result<FlashResult> {
    if let Some(loader) = &plan.loader {
        if !loader.is_file() {
            return Err(CliError::Usage(format!("loader image not found: {}", loader.display())).into());
        }
    }

    let programmer = programmer(args, config)?;
    let touch = SerialTouch::new().with_wait_for_port(config.upload.touch_wait.unwrap_or(true));
    let sessions = NativeSessionFactory;

    let mut uploader = Uploader::new(&sessions, cancel.clone())
        .with_touch(&touch)
        .with_policy(retry_policy(args, config));
    if let Some(programmer) = &programmer {
        uploader = uploader.with_programmer(programmer);
    }
    if let Some(settle) = config.settle_delay() {
        uploader = uploader.with_settle_delay(settle);
    }

    if !cli.quiet {
        eprintln!(
            "{} Using {} on {}",
            style("🔌").cyan(),
            plan.module,
            plan.port
        );
    }

    let pb = progress_bar(cli.quiet);
    let mut current = None;
    let outcome = uploader.run(plan, &mut |transfer, percent| {
        if current != Some(transfer) {
            current = Some(transfer);
            pb.reset();
            pb.set_message(match transfer {
                Transfer::Firmware => "Flashing firmware",
                Transfer::Certificates => "Flashing certificates",
            });
        }
        pb.set_position(u64::from(percent));
    });

    match outcome {
        Ok(result) => {
            pb.finish_with_message("Done");
            Ok(result)
        },
        Err(modflash::Error::Cancelled) => {
            pb.abandon();
            Err(CliError::Cancelled("Operation cancelled".to_string()).into())
        },
        Err(e) => {
            pb.abandon();
            Err(anyhow::Error::new(e).context(format!("Upload to {} failed", plan.module)))
        },
    }
}

/// Progress bar on stderr, hidden when quiet or not on a terminal.
pub(crate) fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Print the upload result as JSON on stdout or as text on stderr.
pub(crate) fn report(cli: &Cli, json: bool, result: &FlashResult, done: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if let Some(version) = &result.version {
        println!("{}{version}", modflash::result::VERSION_PREFIX);
    }
    if !cli.quiet {
        eprintln!("\n{} {done}", style("🎉").green().bold());
    }
    Ok(())
}
