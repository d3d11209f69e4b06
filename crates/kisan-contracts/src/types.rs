use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Response language for every advisor call. Controls the natural-language
/// content only, never the response schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Hi,
    Mr,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Hi => "hi",
            Language::Mr => "mr",
        }
    }

    /// English name of the language, used when building prompts.
    pub fn english_name(self) -> &'static str {
        match self {
            Language::En => "English",
            Language::Hi => "Hindi",
            Language::Mr => "Marathi",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::En
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Language::En),
            "hi" => Ok(Language::Hi),
            "mr" => Ok(Language::Mr),
            other => anyhow::bail!("unknown language '{other}' (expected en, hi, or mr)"),
        }
    }
}

/// Live farm metrics: average NDVI in `[0, 1]` plus soil moisture percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FarmStatus {
    pub ndvi_avg: f64,
    pub soil_moisture: i64,
}

/// One sample of the trailing historical window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub date: String,
    pub ndvi: f64,
    pub soil_moisture: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub detail: String,
    pub priority: Priority,
}

/// Structured recommendation set derived from current farm metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub overall_assessment: String,
    pub recommendations: Vec<Suggestion>,
}

/// Result of a multimodal image (or map-plot) analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub analysis_text: String,
    pub estimated_ndvi: f64,
    pub estimated_soil_moisture: i64,
}

impl ImageAnalysis {
    pub fn estimated_status(&self) -> FarmStatus {
        FarmStatus {
            ndvi_avg: self.estimated_ndvi,
            soil_moisture: self.estimated_soil_moisture,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindDirection {
    N,
    Ne,
    E,
    Se,
    S,
    Sw,
    W,
    Nw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionIcon {
    Sunny,
    Cloudy,
    Rain,
    Storm,
}

/// Weather snapshot shared by the mock "current" source and the AI
/// "forecast" origin. Callers treat both origins as interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature_celsius: i64,
    pub condition_text: String,
    pub condition_icon: ConditionIcon,
    pub feels_like_celsius: i64,
    pub high_celsius: i64,
    pub low_celsius: i64,
    pub temp_24h_change: f64,
    pub qpf_mm: f64,
    pub thunderstorm_probability_percent: i64,
    pub rain_probability_percent: i64,
    pub wind_chill_celsius: i64,
    pub heat_index_celsius: i64,
    pub visibility_km: i64,
    pub cloud_cover_percent: i64,
    pub wind_kph: i64,
    pub wind_gust_kph: i64,
    pub wind_direction_cardinal: WindDirection,
    pub relative_humidity_percent: i64,
    pub dew_point_celsius: f64,
    pub uv_index: i64,
    pub air_pressure_hpa: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn language_round_trips_codes() {
        for (code, language) in [("en", Language::En), ("hi", Language::Hi), ("mr", Language::Mr)] {
            assert_eq!(code.parse::<Language>().unwrap(), language);
            assert_eq!(language.code(), code);
            assert_eq!(serde_json::to_value(language).unwrap(), json!(code));
        }
        assert!("de".parse::<Language>().is_err());
    }

    #[test]
    fn insight_report_parses_wire_shape() {
        let raw = json!({
            "overall_assessment": "Crop cover is healthy.",
            "recommendations": [
                {"title": "Irrigate", "detail": "Run drip lines tonight.", "priority": "High"},
                {"title": "Scout", "detail": "Check the north block.", "priority": "Medium"},
                {"title": "Mulch", "detail": "Retain moisture.", "priority": "Low"}
            ]
        });
        let report: InsightReport = serde_json::from_value(raw).unwrap();
        assert_eq!(report.recommendations.len(), 3);
        assert_eq!(report.recommendations[0].priority, Priority::High);
    }

    #[test]
    fn insight_report_rejects_unknown_priority() {
        let raw = json!({
            "overall_assessment": "ok",
            "recommendations": [
                {"title": "t", "detail": "d", "priority": "Urgent"}
            ]
        });
        assert!(serde_json::from_value::<InsightReport>(raw).is_err());
    }

    #[test]
    fn wind_direction_uses_cardinal_strings() {
        assert_eq!(serde_json::to_value(WindDirection::Ne).unwrap(), json!("NE"));
        let parsed: WindDirection = serde_json::from_value(json!("SW")).unwrap();
        assert_eq!(parsed, WindDirection::Sw);
    }

    #[test]
    fn image_analysis_maps_to_status() {
        let analysis = ImageAnalysis {
            analysis_text: "Looks lush.".to_string(),
            estimated_ndvi: 0.82,
            estimated_soil_moisture: 71,
        };
        let status = analysis.estimated_status();
        assert_eq!(status.ndvi_avg, 0.82);
        assert_eq!(status.soil_moisture, 71);
    }
}
