use anyhow::{ensure, Result};
use clap_serde_derive::ClapSerde;

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(5000)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Path to the ONNX export of the diabetes classifier
    #[default("models/diabetes_model.onnx".to_string())]
    #[arg(long, env)]
    pub(crate) diabetes_model_path: String,

    /// Path to the ONNX export of the brain tumour CNN
    #[default("models/cnn_brain_tumour.onnx".to_string())]
    #[arg(long, env)]
    pub(crate) cnn_model_path: String,

    /// Input width of the tumour CNN
    #[default(224)]
    #[arg(long, env)]
    pub(crate) image_width: u32,

    /// Input height of the tumour CNN
    #[default(224)]
    #[arg(long, env)]
    pub(crate) image_height: u32,

    /// Index of the "tumour" class in a multi-class CNN output, fixed by the class ordering used during training
    #[default(1)]
    #[arg(long, env)]
    pub(crate) tumour_class_index: usize,

    /// Diabetes probability below which the legacy form reports a low risk
    #[default(0.05)]
    #[arg(long, env)]
    pub(crate) legacy_alert_threshold: f32,

    /// Upper bound for request bodies, in bytes
    #[default(10_000_000)]
    #[arg(long, env)]
    pub(crate) max_upload_bytes: usize,

    /// OTLP collector endpoint, telemetry export is disabled when empty
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otlp_endpoint: String,

    /// Keep logging to the console while exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.image_width > 0 && self.image_height > 0,
            "Image dimensions must be non-zero, got {}x{}",
            self.image_width,
            self.image_height
        );
        ensure!(
            (0.0..=1.0).contains(&self.legacy_alert_threshold),
            "legacy_alert_threshold must lie in [0, 1], got {}",
            self.legacy_alert_threshold
        );
        Ok(())
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.otlp_endpoint.trim()).filter(|endpoint| !endpoint.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_models() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert_eq!((config.image_width, config.image_height), (224, 224));
        assert_eq!(config.tumour_class_index, 1);
        assert!(config.otlp_endpoint().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let opt: <Config as ClapSerde>::Opt =
            toml::from_str("port = 8080\nimage_width = 150\nimage_height = 150\n").unwrap();
        let config = Config::from(opt);
        assert_eq!(config.port, 8080);
        assert_eq!(config.image_width, 150);
        assert_eq!(config.address, "0.0.0.0");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.legacy_alert_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
