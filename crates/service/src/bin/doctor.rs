use anyhow::{bail, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use usercore_common::AppConfig;
use usercore_service::{run_probes, CoreComponents};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/usercore.yaml".to_string());

    info!(config_path = %config_path, "checking shared-state backends");

    let config = AppConfig::load(&config_path)?;

    let components = match CoreComponents::connect(&config).await {
        Ok(components) => components,
        Err(e) => {
            error!(error = %e, url = %redacted(&config.store.url), "cannot reach key-value store");
            return Err(e.into());
        }
    };

    let report = run_probes(&components, &config).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.health.store_reachable || !report.lock_round_trip {
        bail!("shared-state probes failed");
    }
    Ok(())
}

/// Store URL with any password masked, for logging.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
