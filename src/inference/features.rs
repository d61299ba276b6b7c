use serde_json::{Map, Value};

use crate::error::PredictionError;

/// Number of inputs the diabetes classifier was trained on
pub const FEATURE_COUNT: usize = 8;

/// Column order of the diabetes classifier. Changing it without retraining the model silently
/// produces wrong predictions.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "gender_male",
    "age",
    "hypertension",
    "heart_disease",
    "smoking_current",
    "bmi",
    "hba1c",
    "glucose",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f32; FEATURE_COUNT]);

impl FeatureVector {
    /// Builds a vector from values that are already in model column order. Each value is held to the
    /// same finite, non-negative rule as a JSON record.
    pub fn from_positional(values: &[f32]) -> Result<Self, PredictionError> {
        let values: [f32; FEATURE_COUNT] = values.try_into().map_err(|_| {
            PredictionError::validation(
                "features",
                format!("expected {FEATURE_COUNT} values, got {}", values.len()),
            )
        })?;
        for (name, value) in FEATURE_NAMES.iter().zip(values) {
            check_measurement(name, value)?;
        }
        Ok(FeatureVector(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
}

impl Gender {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            "" | "unknown" => Gender::Unknown,
            _ => Gender::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmokingHistory {
    Never,
    Former,
    Current,
    Unknown,
}

impl SmokingHistory {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "never" => SmokingHistory::Never,
            "former" => SmokingHistory::Former,
            "current" | "smoker" | "yes" => SmokingHistory::Current,
            _ => SmokingHistory::Unknown,
        }
    }
}

/// Typed view of a diabetes prediction request, every field already defaulted
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub gender: Gender,
    pub age: f32,
    pub hypertension: bool,
    pub heart_disease: bool,
    pub smoking_history: SmokingHistory,
    pub bmi: f32,
    pub hba1c: f32,
    pub glucose: f32,
}

impl PredictionRequest {
    /// Reads a loosely typed JSON record. Missing or null fields fall back to 0, false or unknown.
    pub fn from_record(record: &Map<String, Value>) -> Result<Self, PredictionError> {
        Ok(PredictionRequest {
            gender: Gender::parse(&read_text(record, "gender")?),
            age: read_number(record, "age")?,
            hypertension: read_flag(record, "hypertension")?,
            heart_disease: read_flag(record, "heart_disease")?,
            smoking_history: SmokingHistory::parse(&read_text(record, "smoking_history")?),
            bmi: read_number(record, "bmi")?,
            hba1c: read_number(record, "hba1c")?,
            glucose: read_number(record, "glucose")?,
        })
    }

    pub fn to_features(&self) -> FeatureVector {
        FeatureVector([
            indicator(self.gender == Gender::Male),
            self.age,
            indicator(self.hypertension),
            indicator(self.heart_disease),
            indicator(self.smoking_history == SmokingHistory::Current),
            self.bmi,
            self.hba1c,
            self.glucose,
        ])
    }
}

/// Maps a raw diabetes record to the model's feature vector, see [`FEATURE_NAMES`] for the order.
pub fn standardize(record: &Map<String, Value>) -> Result<FeatureVector, PredictionError> {
    Ok(PredictionRequest::from_record(record)?.to_features())
}

fn indicator(flag: bool) -> f32 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn field<'a>(record: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    record.get(name).filter(|value| !value.is_null())
}

fn read_number(record: &Map<String, Value>, name: &str) -> Result<f32, PredictionError> {
    let number = match field(record, name) {
        None => return Ok(0.0),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| PredictionError::validation(name, "number is out of range"))?,
        Some(Value::Bool(b)) => f64::from(indicator(*b)),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| {
            PredictionError::validation(name, format!("'{s}' is not a number"))
        })?,
        Some(other) => {
            return Err(PredictionError::validation(
                name,
                format!("expected a number, got {other}"),
            ))
        }
    };

    check_measurement(name, number as f32)
}

/// Values that overflow `f32` become infinite here and are rejected with the rest.
fn check_measurement(name: &str, value: f32) -> Result<f32, PredictionError> {
    if !value.is_finite() {
        return Err(PredictionError::validation(name, "must be a finite number"));
    }
    if value < 0.0 {
        return Err(PredictionError::validation(
            name,
            format!("must not be negative, got {value}"),
        ));
    }
    Ok(value)
}

fn read_flag(record: &Map<String, Value>, name: &str) -> Result<bool, PredictionError> {
    match field(record, name) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Ok(true),
            "false" | "no" | "n" | "0" | "off" | "" => Ok(false),
            _ => Err(PredictionError::validation(
                name,
                format!("'{s}' is not a yes/no value"),
            )),
        },
        Some(other) => Err(PredictionError::validation(
            name,
            format!("expected a boolean, got {other}"),
        )),
    }
}

fn read_text(record: &Map<String, Value>, name: &str) -> Result<String, PredictionError> {
    match field(record, name) {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PredictionError::validation(
            name,
            format!("expected a string, got {other}"),
        )),
    }
}
