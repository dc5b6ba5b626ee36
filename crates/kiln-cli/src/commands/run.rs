//! Lifecycle run over the selected backends

use std::time::Duration;

use crate::RunArgs;
use anyhow::{Context, Result, bail};
use kiln_compute::{BackendKind, SessionConfig, run_backend};
use tracing::info;

/// Backends selected by `--backend`, in driver order.
fn select(backend: &str) -> Result<Vec<BackendKind>> {
    if backend.eq_ignore_ascii_case("all") {
        return Ok(BackendKind::ALL.to_vec());
    }
    backend
        .split(',')
        .map(|name| name.trim().parse::<BackendKind>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Invalid --backend '{backend}'"))
}

/// Environment first, flags on top.
fn config(args: &RunArgs) -> SessionConfig {
    let mut config = SessionConfig::from_env();
    let width = args.width.unwrap_or(config.width);
    let height = args.height.unwrap_or(config.height);
    let channels = args.channels.unwrap_or(config.channels);
    config = config.with_dimensions(width, height, channels);
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(dir) = &args.kernels {
        config = config.with_kernel_dir(dir);
    }
    if let Some(ms) = args.fence_timeout_ms {
        config = config.with_fence_timeout(Duration::from_millis(ms));
    }
    if let Some(eps) = args.tolerance {
        config = config.with_tolerance(eps);
    }
    config
}

pub fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let kinds = select(&args.backend)?;
    let config = config(&args);

    if verbose {
        println!(
            "Image {}x{}x{}, seed {}, kernels {}",
            config.width,
            config.height,
            config.channels,
            config.generator.seed(),
            config.kernel_dir.display()
        );
    }

    let mut failed = Vec::new();
    for kind in kinds {
        match run_backend(kind, &config) {
            Ok(report) => {
                println!("{}", report.pass_line());
                if verbose {
                    println!("  states: {:?}", report.states);
                    println!("  released {} handles", report.released);
                }
            }
            Err(err) => {
                println!("{} FAIL during {}: {}", kind.api_name(), err.step, err.source);
                if verbose {
                    println!("  states: {:?}", err.states);
                    println!("  released {} handles", err.released);
                }
                failed.push(kind);
            }
        }
    }

    if !failed.is_empty() {
        let names: Vec<_> = failed.iter().map(|k| k.name()).collect();
        bail!("{} backend(s) failed: {}", failed.len(), names.join(", "));
    }
    info!("all selected backends passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_all() {
        assert_eq!(select("all").unwrap(), BackendKind::ALL.to_vec());
        assert_eq!(select("ALL").unwrap().len(), 3);
    }

    #[test]
    fn test_select_list() {
        assert_eq!(
            select("explicit, stream").unwrap(),
            vec![BackendKind::Explicit, BackendKind::Stream]
        );
        assert!(select("metal").is_err());
    }
}
