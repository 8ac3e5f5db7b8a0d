//! Certificate upload and offline encoding.

use anyhow::{Context, Result};
use console::style;
use log::info;
use modflash::{CancelToken, Certificate, CertificateLayout, Module, cert, encode_region};
use std::path::Path;
use std::time::Duration;

use crate::commands::flash::{report, run_upload, upload_plan};
use crate::config::Config;
use crate::{Cli, CertSourceArgs, CliError, UploadArgs, get_port};

/// Layout for `module`, honouring an explicit override.
pub(crate) fn resolve_layout(
    module: Module,
    layout: Option<CertificateLayout>,
) -> Result<CertificateLayout> {
    let default = module.certificate_layout().ok_or_else(|| {
        CliError::Usage(format!("{module} does not take a certificate bundle"))
    })?;
    Ok(layout.unwrap_or(default))
}

/// Load every certificate named by `sources`, files first.
pub(crate) fn collect_certificates(sources: &CertSourceArgs) -> Result<Vec<Certificate>> {
    if sources.files.is_empty() && sources.urls.is_empty() {
        return Err(CliError::Usage(
            "no certificates given; use --file or --url".to_string(),
        )
        .into());
    }

    let mut certificates = Vec::new();
    for path in &sources.files {
        let loaded = cert::load_file(path)
            .with_context(|| format!("Failed to load certificates from {}", path.display()))?;
        info!("Loaded {} certificate(s) from {}", loaded.len(), path.display());
        certificates.extend(loaded);
    }

    let timeout = Duration::from_secs(sources.timeout);
    for address in &sources.urls {
        let fetched = cert::fetch_from_host(address, timeout)
            .with_context(|| format!("Failed to fetch the root certificate of {address}"))?;
        info!("Fetched root certificate of {address}");
        certificates.push(fetched);
    }
    Ok(certificates)
}

/// Encode the certificate region for `module`.
pub(crate) fn build_region(module: Module, sources: &CertSourceArgs) -> Result<Vec<u8>> {
    let layout = resolve_layout(module, sources.layout)?;
    let certificates = collect_certificates(sources)?;
    let region = encode_region(&certificates, layout).context("Failed to encode certificates")?;

    if let Some(limit) = module.certificates_limit() {
        if region.len() > limit {
            return Err(modflash::Error::CertificatesTooLarge {
                size: region.len(),
                limit,
            }
            .into());
        }
    }
    info!(
        "Encoded {} certificate(s) as {layout} ({} bytes)",
        certificates.len(),
        region.len()
    );
    Ok(region)
}

/// Certificates command implementation.
pub(crate) fn cmd_certificates(
    cli: &Cli,
    config: &Config,
    args: &UploadArgs,
    sources: &CertSourceArgs,
    cancel: &CancelToken,
) -> Result<()> {
    let region = build_region(args.module, sources)?;

    let port = get_port(cli, config)?;
    let mut plan = upload_plan(args, config, &port);
    plan.certificates = Some(region);

    let result = run_upload(cli, config, args, &plan, cancel)?;
    report(cli, args.json, &result, "Certificates flashed")
}

/// Encode-certificates command implementation.
pub(crate) fn cmd_encode_certificates(
    cli: &Cli,
    module: Module,
    sources: &CertSourceArgs,
    output: &Path,
) -> Result<()> {
    let region = build_region(module, sources)?;
    std::fs::write(output, &region)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Wrote {} bytes to {}",
            style("✓").green(),
            region.len(),
            style(output.display()).yellow()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../modflash/tests/fixtures")
            .join(name)
    }

    fn sources(files: Vec<PathBuf>) -> CertSourceArgs {
        CertSourceArgs {
            files,
            urls: Vec::new(),
            layout: None,
            timeout: 10,
        }
    }

    #[test]
    fn test_resolve_layout() {
        assert_eq!(
            resolve_layout(Module::Winc, None).unwrap(),
            CertificateLayout::HeaderRecords
        );
        assert_eq!(
            resolve_layout(Module::Nina, Some(CertificateLayout::Pem)).unwrap(),
            CertificateLayout::Pem
        );
        let err = resolve_layout(Module::Sara, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_no_sources_is_usage_error() {
        let err = collect_certificates(&sources(Vec::new())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_build_region_from_files() {
        let region = build_region(
            Module::Winc,
            &sources(vec![fixture("root-rsa.pem"), fixture("bundle.pem")]),
        )
        .unwrap();
        assert_eq!(&region[..16], &modflash::cert::START_PATTERN);
        assert_eq!(&region[16..20], &3u32.to_le_bytes());
    }

    #[test]
    fn test_build_region_missing_file() {
        assert!(build_region(Module::Nina, &sources(vec![fixture("absent.pem")])).is_err());
    }
}
