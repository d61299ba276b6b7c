use std::env;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: String,
    diabetes_model_loaded: bool,
    cnn_model_loaded: bool,
}

fn check(url: &str) -> Result<()> {
    let url = Url::parse(url).with_context(|| format!("Invalid URL {url}"))?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        bail!("Request failed with status {}", response.status());
    }

    let health: Health = response.json()?;
    if health.status != "ok" || !health.diabetes_model_loaded || !health.cnn_model_loaded {
        bail!("Service is degraded: {health:?}");
    }
    Ok(())
}

fn main() -> ExitCode {
    let Some(url) = env::args().nth(1) else {
        eprintln!("Usage: health_predictor_probe <health-url>");
        return ExitCode::from(2);
    };

    match check(&url) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
