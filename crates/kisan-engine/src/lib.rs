use std::env;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Days, Utc};
use kisan_contracts::chat::{ChatLog, ChatMessage, Role};
use kisan_contracts::events::{EventPayload, EventWriter};
use kisan_contracts::insight::InsightTracker;
use kisan_contracts::plot::PlotSession;
use kisan_contracts::types::{
    Coordinates, FarmStatus, HistoricalPoint, ImageAnalysis, InsightReport, Language,
    WeatherSnapshot,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const GREETING_TEXT: &str = "Hello! I am your Agri Assistant. How can I help you today?";
pub const APOLOGY_TEXT: &str = "Sorry, I encountered an error. Please try again.";
pub const RETRY_PROMPT: &str = "Could not generate advice right now. Please try again.";
pub const LOCATION_ADVISORY: &str = "Location unavailable; advice will not be region specific.";

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Tunables shared by the engine. The upstream behavior had no request
/// timeouts at all; the defaults here close that gap.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            request_timeout_s: 30.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
        }
    }
}

/// System-level persona handed to the conversational service. The
/// language selector controls the reply language only.
pub fn persona(language: Language) -> String {
    format!(
        "You are a helpful and friendly agricultural assistant for farmers in India. \
         Your name is \"Agri Assistant\". Answer questions concisely about crops, soil, \
         weather, and modern farm management. Always respond in {}.",
        language.english_name()
    )
}

/// The generative backend behind every AI feature: structured insight
/// generation, multimodal image analysis, map-plot analysis, the AI
/// weather forecast, and streamed chat.
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    fn suggest(
        &self,
        status: FarmStatus,
        language: Language,
        coordinates: Option<Coordinates>,
    ) -> Result<InsightReport>;

    fn analyze_image(&self, bytes: &[u8], mime: &str, language: Language) -> Result<ImageAnalysis>;

    fn analyze_plot(&self, language: Language) -> Result<ImageAnalysis>;

    fn forecast(&self, city: &str, language: Language) -> Result<WeatherSnapshot>;

    /// Streams the reply to `message`; `on_fragment` is invoked once per
    /// incremental fragment, in arrival order.
    fn chat(
        &self,
        persona: &str,
        history: &[ChatMessage],
        message: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<()>;
}

/// Picks the Gemini advisor when an API key is configured, otherwise the
/// deterministic offline advisor.
pub fn default_advisor(config: &EngineConfig) -> Box<dyn Advisor> {
    if GeminiAdvisor::is_configured() {
        Box::new(GeminiAdvisor::new(config.clone()))
    } else {
        Box::new(DryrunAdvisor)
    }
}

// ---------------------------------------------------------------------------
// Gemini advisor
// ---------------------------------------------------------------------------

pub struct GeminiAdvisor {
    api_base: String,
    model: String,
    config: EngineConfig,
    http: HttpClient,
}

impl GeminiAdvisor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            api_base: non_empty_env("KISAN_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: non_empty_env("KISAN_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            config,
            http: HttpClient::new(),
        }
    }

    pub fn is_configured() -> bool {
        Self::api_key().is_some()
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/models/{}:{verb}", self.api_base, self.model)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        payload: &Value,
    ) -> Result<HttpResponse> {
        let max_retries = self.config.transport_retries;
        for attempt in 0..=max_retries {
            let response = self
                .http
                .post(endpoint)
                .query(query)
                .timeout(Duration::from_secs_f64(self.config.request_timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    let delay_s = self.config.retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        unreachable!("transport retry loop always returns a response or error")
    }

    /// One structured-completion round trip: JSON response mime plus a
    /// response schema, returning the concatenated candidate text.
    fn generate_structured(&self, parts: Vec<Value>, schema: Value) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint("generateContent");
        let payload = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            },
        });
        let response =
            self.post_with_transport_retries(&endpoint, &[("key", api_key.as_str())], &payload)?;
        let response_payload = response_json_or_error("Gemini", response)?;
        candidate_text(&response_payload)
    }
}

impl Advisor for GeminiAdvisor {
    fn name(&self) -> &str {
        "gemini"
    }

    fn suggest(
        &self,
        status: FarmStatus,
        language: Language,
        coordinates: Option<Coordinates>,
    ) -> Result<InsightReport> {
        let text = self.generate_structured(
            vec![json!({"text": suggest_prompt(status, language, coordinates)})],
            insight_schema(),
        )?;
        parse_structured(&text)
    }

    fn analyze_image(&self, bytes: &[u8], mime: &str, language: Language) -> Result<ImageAnalysis> {
        let parts = vec![
            json!({"inlineData": {"mimeType": mime, "data": BASE64.encode(bytes)}}),
            json!({"text": image_prompt(language)}),
        ];
        let text = self.generate_structured(parts, analysis_schema())?;
        parse_structured(&text)
    }

    fn analyze_plot(&self, language: Language) -> Result<ImageAnalysis> {
        let text = self.generate_structured(
            vec![json!({"text": plot_prompt(language)})],
            analysis_schema(),
        )?;
        parse_structured(&text)
    }

    fn forecast(&self, city: &str, language: Language) -> Result<WeatherSnapshot> {
        let text = self.generate_structured(
            vec![json!({"text": forecast_prompt(city, language)})],
            weather_schema(),
        )?;
        parse_structured(&text)
    }

    fn chat(
        &self,
        persona: &str,
        history: &[ChatMessage],
        message: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint("streamGenerateContent");

        let mut contents: Vec<Value> = history
            .iter()
            .map(|entry| {
                json!({
                    "role": match entry.role {
                        Role::User => "user",
                        Role::Model => "model",
                    },
                    "parts": [{"text": entry.text}],
                })
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": message}]}));

        let payload = json!({
            "systemInstruction": {"parts": [{"text": persona}]},
            "contents": contents,
        });
        let response = self.post_with_transport_retries(
            &endpoint,
            &[("alt", "sse"), ("key", api_key.as_str())],
            &payload,
        )?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Gemini stream request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }

        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.context("Gemini stream read failed")?;
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let chunk: Value =
                serde_json::from_str(data).context("Gemini stream returned invalid JSON chunk")?;
            if let Some(text) = chunk_text(&chunk) {
                on_fragment(&text);
            }
        }
        Ok(())
    }
}

/// Concatenated text parts of the first candidate.
fn candidate_text(payload: &Value) -> Result<String> {
    let text = chunk_text(payload).unwrap_or_default();
    if text.trim().is_empty() {
        bail!("Gemini returned no candidate text");
    }
    Ok(text)
}

fn chunk_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Typed parse of advisor output. Failing to parse — or parsing into the
/// wrong shape, wrong enum values included — is treated exactly like a
/// transport failure by the orchestrators.
fn parse_structured<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text.trim()).context("advisor returned invalid JSON payload")
}

fn suggest_prompt(
    status: FarmStatus,
    language: Language,
    coordinates: Option<Coordinates>,
) -> String {
    let location_context = coordinates
        .map(|coords| {
            format!(
                "The farm is located near latitude {:.4} and longitude {:.4}. Provide \
                 regionally-specific advice if possible, considering common crops and \
                 conditions for this part of India. ",
                coords.latitude, coords.longitude
            )
        })
        .unwrap_or_default();
    format!(
        "Act as an expert agricultural advisor for a modern farmer in India. The farm's \
         current average NDVI is {:.2} and the soil moisture is {}%. {}Based on this data, \
         provide a brief, one-paragraph \"overall_assessment\" of the farm's health. Then \
         provide 3 actionable, concise recommendations in a \"recommendations\" array. Each \
         recommendation has a \"title\", a \"detail\" explaining the action, and a \
         \"priority\" ('High', 'Medium', or 'Low'). Your entire response MUST be in {}.",
        status.ndvi_avg,
        status.soil_moisture,
        location_context,
        language.english_name()
    )
}

fn image_prompt(language: Language) -> String {
    format!(
        "You are an expert agricultural satellite imagery analyst. The user has uploaded a \
         satellite image of their farm in India. Analyze it to assess plant health. Respond \
         with a single JSON object: \"analysis_text\" (a one or two paragraph assessment with \
         actionable suggestions for fertilizers, irrigation adjustments, and issues to watch \
         for, written in {}), \"estimated_ndvi\" (float, 0.1 to 0.9), and \
         \"estimated_soil_moisture\" (integer percent, 20 to 90).",
        language.english_name()
    )
}

fn plot_prompt(language: Language) -> String {
    format!(
        "You are an expert agricultural satellite imagery analyst. A user has selected a plot \
         of land on a map for analysis in India; assume a typical farm plot in a lush, green \
         area. Respond with a single JSON object: \"analysis_text\" (a one or two paragraph \
         assessment with actionable suggestions, written in {}), \"estimated_ndvi\" (float, \
         0.7 to 0.9), and \"estimated_soil_moisture\" (integer percent, 60 to 80).",
        language.english_name()
    )
}

fn forecast_prompt(city: &str, language: Language) -> String {
    format!(
        "Provide a detailed current weather forecast for {city}, India as a single JSON \
         object. The condition_text should be in {}. The condition_icon must be one of \
         'Sunny', 'Cloudy', 'Rain', 'Storm'. The wind_direction_cardinal must be one of 'N', \
         'NE', 'E', 'SE', 'S', 'SW', 'W', 'NW'. All numerical values are integers except \
         temp_24h_change, qpf_mm, and dew_point_celsius, which can be floats.",
        language.english_name()
    )
}

fn insight_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "overall_assessment": {"type": "STRING"},
            "recommendations": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "title": {"type": "STRING"},
                        "detail": {"type": "STRING"},
                        "priority": {"type": "STRING", "enum": ["High", "Medium", "Low"]},
                    },
                },
            },
        },
    })
}

fn analysis_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "analysis_text": {"type": "STRING"},
            "estimated_ndvi": {"type": "NUMBER"},
            "estimated_soil_moisture": {"type": "INTEGER"},
        },
    })
}

fn weather_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "temperature_celsius": {"type": "INTEGER"},
            "condition_text": {"type": "STRING"},
            "condition_icon": {"type": "STRING", "enum": ["Sunny", "Cloudy", "Rain", "Storm"]},
            "feels_like_celsius": {"type": "INTEGER"},
            "high_celsius": {"type": "INTEGER"},
            "low_celsius": {"type": "INTEGER"},
            "temp_24h_change": {"type": "NUMBER"},
            "qpf_mm": {"type": "NUMBER"},
            "thunderstorm_probability_percent": {"type": "INTEGER"},
            "rain_probability_percent": {"type": "INTEGER"},
            "wind_chill_celsius": {"type": "INTEGER"},
            "heat_index_celsius": {"type": "INTEGER"},
            "visibility_km": {"type": "INTEGER"},
            "cloud_cover_percent": {"type": "INTEGER"},
            "wind_kph": {"type": "INTEGER"},
            "wind_gust_kph": {"type": "INTEGER"},
            "wind_direction_cardinal": {
                "type": "STRING",
                "enum": ["N", "NE", "E", "SE", "S", "SW", "W", "NW"],
            },
            "relative_humidity_percent": {"type": "INTEGER"},
            "dew_point_celsius": {"type": "NUMBER"},
            "uv_index": {"type": "INTEGER"},
            "air_pressure_hpa": {"type": "INTEGER"},
        },
    })
}

// ---------------------------------------------------------------------------
// Dryrun advisor
// ---------------------------------------------------------------------------

/// Deterministic offline advisor. Used when no API key is present so the
/// whole dashboard stays usable without network access.
pub struct DryrunAdvisor;

impl Advisor for DryrunAdvisor {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn suggest(
        &self,
        status: FarmStatus,
        language: Language,
        coordinates: Option<Coordinates>,
    ) -> Result<InsightReport> {
        let location_note = coordinates
            .map(|coords| format!(" near ({:.2}, {:.2})", coords.latitude, coords.longitude))
            .unwrap_or_default();
        Ok(InsightReport {
            overall_assessment: format!(
                "[{}] The farm{location_note} shows NDVI {:.2} with {}% soil moisture; overall \
                 vegetation cover is {} and no acute stress is indicated.",
                language.code(),
                status.ndvi_avg,
                status.soil_moisture,
                if status.ndvi_avg >= 0.6 { "healthy" } else { "thin" },
            ),
            recommendations: vec![
                kisan_contracts::types::Suggestion {
                    title: "Adjust irrigation".to_string(),
                    detail: format!(
                        "Soil moisture is at {}%; schedule drip cycles to hold 55-70%.",
                        status.soil_moisture
                    ),
                    priority: kisan_contracts::types::Priority::High,
                },
                kisan_contracts::types::Suggestion {
                    title: "Scout weak patches".to_string(),
                    detail: "Walk the lowest-NDVI blocks and check for pest or nutrient stress."
                        .to_string(),
                    priority: kisan_contracts::types::Priority::Medium,
                },
                kisan_contracts::types::Suggestion {
                    title: "Mulch row middles".to_string(),
                    detail: "Organic mulch will slow evaporation ahead of the dry weeks."
                        .to_string(),
                    priority: kisan_contracts::types::Priority::Low,
                },
            ],
        })
    }

    fn analyze_image(&self, bytes: &[u8], _mime: &str, language: Language) -> Result<ImageAnalysis> {
        let digest = Sha256::digest(bytes);
        let ndvi = round2(0.1 + (f64::from(digest[0]) / 255.0) * 0.8);
        let moisture = 20 + i64::from(digest[1]) % 71;
        Ok(ImageAnalysis {
            analysis_text: format!(
                "[{}] Canopy reflectance suggests moderate vigor. Split the next nitrogen dose, \
                 irrigate the paler blocks first, and re-check for early pest stress in a week.",
                language.code()
            ),
            estimated_ndvi: ndvi,
            estimated_soil_moisture: moisture,
        })
    }

    fn analyze_plot(&self, language: Language) -> Result<ImageAnalysis> {
        Ok(ImageAnalysis {
            analysis_text: format!(
                "[{}] The selected plot sits in a lush, well-watered area. Maintain the current \
                 irrigation schedule and watch the field edges for nutrient tail-off.",
                language.code()
            ),
            estimated_ndvi: 0.78,
            estimated_soil_moisture: 68,
        })
    }

    fn forecast(&self, city: &str, language: Language) -> Result<WeatherSnapshot> {
        let digest = Sha256::digest(city.to_ascii_lowercase().as_bytes());
        let base_temp = 26 + i64::from(digest[0]) % 8;
        Ok(WeatherSnapshot {
            temperature_celsius: base_temp,
            condition_text: format!("[{}] Partly cloudy", language.code()),
            condition_icon: kisan_contracts::types::ConditionIcon::Sunny,
            feels_like_celsius: base_temp + 1,
            high_celsius: base_temp + 4,
            low_celsius: base_temp - 5,
            temp_24h_change: -0.5,
            qpf_mm: 0.2,
            thunderstorm_probability_percent: i64::from(digest[2]) % 20,
            rain_probability_percent: i64::from(digest[3]) % 40,
            wind_chill_celsius: base_temp - 1,
            heat_index_celsius: base_temp + 2,
            visibility_km: 8 + i64::from(digest[4]) % 7,
            cloud_cover_percent: i64::from(digest[5]) % 100,
            wind_kph: 5 + i64::from(digest[6]) % 20,
            wind_gust_kph: 25 + i64::from(digest[7]) % 20,
            wind_direction_cardinal: kisan_contracts::types::WindDirection::Sw,
            relative_humidity_percent: 30 + i64::from(digest[8]) % 50,
            dew_point_celsius: f64::from(digest[9] % 10) + 12.0,
            uv_index: i64::from(digest[10]) % 11,
            air_pressure_hpa: 1000 + i64::from(digest[11]) % 20,
        })
    }

    fn chat(
        &self,
        _persona: &str,
        _history: &[ChatMessage],
        message: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let reply = format!(
            "Offline assistant here. Regarding \"{}\": keep soil moisture steady, scout weekly, \
             and time field work around the next rain window.",
            truncate_text(message, 80)
        );
        for word in reply.split_inclusive(' ') {
            on_fragment(word);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Data sources
// ---------------------------------------------------------------------------

pub trait FarmStatusSource: Send {
    fn fetch(&mut self) -> Result<FarmStatus>;
}

/// Mock sensor feed. Owns its drift state explicitly — there is no
/// ambient "last known status" singleton anywhere.
pub struct SensorFeed {
    ndvi: f64,
    moisture: f64,
    rng: StdRng,
}

impl Default for SensorFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorFeed {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            ndvi: 0.78,
            moisture: 62.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Trailing 30-day window ending today, one point per day.
    pub fn historical_series(&mut self) -> Vec<HistoricalPoint> {
        let today = Utc::now().date_naive();
        (0u64..30)
            .rev()
            .map(|offset| {
                let date = today - Days::new(offset);
                HistoricalPoint {
                    date: date.format("%b %-d").to_string(),
                    ndvi: round2(0.65 + self.rng.gen::<f64>() * 0.2),
                    soil_moisture: 50 + self.rng.gen_range(0..25),
                }
            })
            .collect()
    }
}

impl FarmStatusSource for SensorFeed {
    fn fetch(&mut self) -> Result<FarmStatus> {
        self.ndvi += (self.rng.gen::<f64>() - 0.5) * 0.02;
        self.moisture += (self.rng.gen::<f64>() - 0.5) * 2.0;
        self.ndvi = self.ndvi.clamp(0.2, 0.9);
        self.moisture = self.moisture.clamp(30.0, 85.0);
        Ok(FarmStatus {
            ndvi_avg: round2(self.ndvi),
            soil_moisture: self.moisture.round() as i64,
        })
    }
}

/// Mock "current" weather. The "forecast" mode lives on the advisor
/// instead; both return the same shape.
pub struct WeatherFeed {
    rng: StdRng,
}

impl Default for WeatherFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl WeatherFeed {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn current(&mut self, _city: &str) -> WeatherSnapshot {
        use kisan_contracts::types::{ConditionIcon, WindDirection};

        let conditions = [
            ("Sunny", ConditionIcon::Sunny),
            ("Mostly Sunny", ConditionIcon::Sunny),
            ("Partly Cloudy", ConditionIcon::Cloudy),
            ("Cloudy", ConditionIcon::Cloudy),
            ("Rain", ConditionIcon::Rain),
            ("Storm", ConditionIcon::Storm),
        ];
        let directions = [
            WindDirection::N,
            WindDirection::Ne,
            WindDirection::E,
            WindDirection::Se,
            WindDirection::S,
            WindDirection::Sw,
            WindDirection::W,
            WindDirection::Nw,
        ];
        let (condition_text, condition_icon) = conditions[self.rng.gen_range(0..conditions.len())];
        let base_temp = 28 + self.rng.gen_range(0..5) + self.rng.gen_range(-1..=1);
        let humidity = 30 + self.rng.gen_range(0..50);
        WeatherSnapshot {
            temperature_celsius: base_temp,
            condition_text: condition_text.to_string(),
            condition_icon,
            feels_like_celsius: base_temp + if self.rng.gen::<bool>() { 1 } else { -1 },
            high_celsius: base_temp + 4,
            low_celsius: base_temp - 5,
            temp_24h_change: ((self.rng.gen::<f64>() * 4.0 - 2.0) * 10.0).round() / 10.0,
            qpf_mm: (self.rng.gen::<f64>() * 20.0).round() / 10.0,
            thunderstorm_probability_percent: self.rng.gen_range(0..20),
            rain_probability_percent: self.rng.gen_range(0..40),
            wind_chill_celsius: base_temp - self.rng.gen_range(0..3),
            heat_index_celsius: base_temp + self.rng.gen_range(0..3),
            visibility_km: 5 + self.rng.gen_range(0..10),
            cloud_cover_percent: self.rng.gen_range(0..100),
            wind_kph: 5 + self.rng.gen_range(0..20),
            wind_gust_kph: 25 + self.rng.gen_range(0..20),
            wind_direction_cardinal: directions[self.rng.gen_range(0..directions.len())],
            relative_humidity_percent: humidity,
            dew_point_celsius: round2(base_temp as f64 - (100.0 - humidity as f64) / 5.0),
            uv_index: self.rng.gen_range(0..11),
            air_pressure_hpa: 1000 + self.rng.gen_range(0..20),
        }
    }
}

// ---------------------------------------------------------------------------
// Status store + poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Poll,
    Analysis,
}

/// Shared "current farm status" value.
///
/// Writes carry their source. Analysis writes are authoritative: each one
/// bumps a generation counter, and a poll result is applied only when no
/// analysis landed after that poll began, so a slow poll can never clobber
/// a fresher analysis. `close` makes every further write a no-op, which is
/// the liveness guard for results resolving after shutdown.
#[derive(Debug, Default)]
pub struct StatusStore {
    inner: Mutex<StatusInner>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct StatusInner {
    current: Option<FarmStatus>,
    analysis_generation: u64,
    last_source: Option<StatusSource>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<FarmStatus> {
        self.inner.lock().ok().and_then(|inner| inner.current)
    }

    pub fn last_source(&self) -> Option<StatusSource> {
        self.inner.lock().ok().and_then(|inner| inner.last_source)
    }

    /// Generation snapshot taken before a poll fetch begins.
    pub fn poll_token(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.analysis_generation)
            .unwrap_or(0)
    }

    /// Applies a background poll result unless an analysis write landed
    /// after `token` was taken or the store has been closed.
    pub fn record_poll(&self, token: u64, status: FarmStatus) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.analysis_generation != token {
            return false;
        }
        inner.current = Some(status);
        inner.last_source = Some(StatusSource::Poll);
        true
    }

    /// Authoritative write from a completed analysis.
    pub fn record_analysis(&self, status: FarmStatus) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.analysis_generation += 1;
        inner.current = Some(status);
        inner.last_source = Some(StatusSource::Analysis);
        true
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Background poll loop on a fixed wall-clock interval. Fetch failures
/// are logged and swallowed; the prior in-memory value is retained.
pub struct StatusPoller {
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn spawn(
        store: Arc<StatusStore>,
        mut source: Box<dyn FarmStatusSource>,
        events: EventWriter,
        interval: Duration,
    ) -> Self {
        let handle = thread::spawn(move || loop {
            if store.is_closed() {
                break;
            }
            let token = store.poll_token();
            match source.fetch() {
                Ok(status) => {
                    if !store.record_poll(token, status) && !store.is_closed() {
                        let mut payload = EventPayload::new();
                        payload.insert("reason".to_string(), Value::String("stale".to_string()));
                        let _ = events.emit("poll_discarded", payload);
                    }
                }
                Err(err) => {
                    let _ = events.emit("poll_failed", error_payload("status_poll", &err));
                }
            }

            // Sleep in short slices so close() stops the thread promptly.
            let deadline = Instant::now() + interval;
            while Instant::now() < deadline {
                if store.is_closed() {
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Location lookup
// ---------------------------------------------------------------------------

pub trait LocatePosition {
    /// `Ok(None)` means no position source is available; `Err` means the
    /// lookup was attempted and refused or failed. Neither is fatal to an
    /// insight request.
    fn locate(&self) -> Result<Option<Coordinates>>;
}

/// Reads `KISAN_LATITUDE`/`KISAN_LONGITUDE`. Unset is "unavailable";
/// unparsable values count as a failed lookup.
pub struct EnvLocator;

impl LocatePosition for EnvLocator {
    fn locate(&self) -> Result<Option<Coordinates>> {
        let (Some(lat), Some(lon)) = (
            non_empty_env("KISAN_LATITUDE"),
            non_empty_env("KISAN_LONGITUDE"),
        ) else {
            return Ok(None);
        };
        let latitude: f64 = lat
            .parse()
            .with_context(|| format!("invalid KISAN_LATITUDE '{lat}'"))?;
        let longitude: f64 = lon
            .parse()
            .with_context(|| format!("invalid KISAN_LONGITUDE '{lon}'"))?;
        Ok(Some(Coordinates {
            latitude,
            longitude,
        }))
    }
}

// ---------------------------------------------------------------------------
// Orchestrators
// ---------------------------------------------------------------------------

/// Drives the insight request lifecycle for the recommendations feature:
/// prerequisite guard, optional location leg, structured advisor call.
pub struct InsightFlow {
    language: Language,
    tracker: InsightTracker<InsightReport>,
}

impl InsightFlow {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            tracker: InsightTracker::new(),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    pub fn tracker(&self) -> &InsightTracker<InsightReport> {
        &self.tracker
    }

    /// Runs one request cycle. Returns false when the action was rejected
    /// (missing prerequisite snapshot, or a request already in flight).
    pub fn run(
        &mut self,
        store: &StatusStore,
        locator: &dyn LocatePosition,
        advisor: &dyn Advisor,
        events: &EventWriter,
    ) -> bool {
        let Some(status) = store.current() else {
            // Prerequisite missing: silently rejected, diagnostics only.
            let mut payload = EventPayload::new();
            payload.insert(
                "reason".to_string(),
                Value::String("no_status_snapshot".to_string()),
            );
            let _ = events.emit("insights_rejected", payload);
            return false;
        };
        if !self.tracker.begin() {
            return false;
        }

        let (coordinates, advisory) = match locator.locate() {
            Ok(coordinates) => (coordinates, None),
            Err(err) => {
                let _ = events.emit("locate_failed", error_payload("insights", &err));
                (None, Some(LOCATION_ADVISORY.to_string()))
            }
        };
        let coordinates = self.tracker.location_resolved(coordinates, advisory);

        match advisor.suggest(status, self.language, coordinates) {
            Ok(report) => {
                let mut payload = EventPayload::new();
                payload.insert(
                    "recommendations".to_string(),
                    Value::Number(report.recommendations.len().into()),
                );
                let _ = events.emit("insights_ready", payload);
                self.tracker.succeed(report);
            }
            Err(err) => {
                let _ = events.emit("advisor_failed", error_payload("insights", &err));
                self.tracker.fail();
            }
        }
        true
    }
}

/// Image-analysis lifecycle: same machine, no location leg, results
/// cached by image digest and written to the status store as
/// authoritative.
pub struct ImageAnalysisFlow {
    language: Language,
    tracker: InsightTracker<ImageAnalysis>,
    cache: Option<AnalysisCache>,
}

impl ImageAnalysisFlow {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            tracker: InsightTracker::new(),
            cache: None,
        }
    }

    pub fn with_cache(language: Language, cache: AnalysisCache) -> Self {
        Self {
            language,
            tracker: InsightTracker::new(),
            cache: Some(cache),
        }
    }

    pub fn set_language(&mut self, language: Language) {
        self.language = language;
    }

    pub fn tracker(&self) -> &InsightTracker<ImageAnalysis> {
        &self.tracker
    }

    pub fn run(
        &mut self,
        bytes: &[u8],
        mime: &str,
        store: &StatusStore,
        advisor: &dyn Advisor,
        events: &EventWriter,
    ) -> bool {
        if !self.tracker.begin() {
            return false;
        }
        // Uploads carry no location leg.
        self.tracker.location_resolved(None, None);

        let key = image_cache_key(bytes, self.language);
        if let Some(hit) = self.cache.as_mut().and_then(|cache| cache.get(&key)) {
            store.record_analysis(hit.estimated_status());
            let mut payload = EventPayload::new();
            payload.insert("key".to_string(), Value::String(key));
            let _ = events.emit("image_analysis_cached", payload);
            self.tracker.succeed(hit);
            return true;
        }

        match advisor.analyze_image(bytes, mime, self.language) {
            Ok(analysis) => {
                if let Some(cache) = self.cache.as_mut() {
                    if let Err(err) = cache.put(&key, &analysis) {
                        let _ =
                            events.emit("cache_write_failed", error_payload("image_analysis", &err));
                    }
                }
                store.record_analysis(analysis.estimated_status());
                let _ = events.emit("image_analyzed", EventPayload::new());
                self.tracker.succeed(analysis);
            }
            Err(err) => {
                let _ = events.emit("advisor_failed", error_payload("image_analysis", &err));
                self.tracker.fail();
            }
        }
        true
    }
}

/// Map-plot analysis: guarded by plot closure, result written to the
/// status store as authoritative, outcome surfaced through the session
/// banner (which auto-dismisses; failures show the generic retry text).
pub fn analyze_plot_session(
    session: &mut PlotSession,
    language: Language,
    store: &StatusStore,
    advisor: &dyn Advisor,
    events: &EventWriter,
    now: Instant,
) -> bool {
    if !session.is_plot_defined() {
        return false;
    }
    match advisor.analyze_plot(language) {
        Ok(analysis) => {
            store.record_analysis(analysis.estimated_status());
            let mut payload = EventPayload::new();
            payload.insert(
                "estimated_ndvi".to_string(),
                json!(analysis.estimated_ndvi),
            );
            let _ = events.emit("plot_analyzed", payload);
            session.set_banner(analysis.analysis_text, now);
        }
        Err(err) => {
            let _ = events.emit("advisor_failed", error_payload("plot_analysis", &err));
            session.set_banner(RETRY_PROMPT, now);
        }
    }
    true
}

/// Conversational session. Language is fixed at start; switching language
/// restarts the conversation context rather than translating history.
pub struct ChatSession {
    id: String,
    language: Language,
    log: ChatLog,
    awaiting: bool,
}

impl ChatSession {
    pub fn start(language: Language) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            language,
            log: ChatLog::seeded(GREETING_TEXT),
            awaiting: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.log.messages()
    }

    pub fn is_awaiting(&self) -> bool {
        self.awaiting
    }

    /// Drops the history and reseeds the greeting under `language`.
    pub fn restart(&mut self, language: Language) {
        self.language = language;
        self.log = ChatLog::seeded(GREETING_TEXT);
        self.awaiting = false;
    }

    /// Opens a turn: appends the user entry plus the streaming placeholder
    /// and marks the send in flight. Rejected (returns false) for blank
    /// input or while a prior turn is still open. Hosts that drive the
    /// stream themselves pair this with `append_fragment`/`close_turn`;
    /// `send` wraps all three around a blocking advisor call.
    pub fn open_turn(&mut self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() || self.awaiting {
            return false;
        }
        self.awaiting = true;
        self.log.push_user(trimmed);
        self.log.open_model_entry();
        true
    }

    /// Feeds one streamed fragment into the open turn's placeholder.
    /// Rejected when no turn is open.
    pub fn append_fragment(&mut self, fragment: &str) -> bool {
        self.awaiting && self.log.append_to_last(fragment)
    }

    /// Closes the open turn; an incomplete stream closes out with the
    /// apology policy. No-op when no turn is open.
    pub fn close_turn(&mut self, completed: bool) {
        if !self.awaiting {
            return;
        }
        if !completed {
            self.log.close_with_apology(APOLOGY_TEXT);
        }
        self.awaiting = false;
    }

    /// One blocking send/stream cycle. Rejected (returns false) for blank
    /// input or while a prior turn is still in flight.
    pub fn send(&mut self, text: &str, advisor: &dyn Advisor, events: &EventWriter) -> bool {
        let history: Vec<ChatMessage> = self.log.messages().to_vec();
        let trimmed = text.trim().to_string();
        if !self.open_turn(&trimmed) {
            return false;
        }

        let system = persona(self.language);
        let log = &mut self.log;
        let result = advisor.chat(&system, &history, &trimmed, &mut |fragment| {
            log.append_to_last(fragment);
        });

        match &result {
            Ok(()) => {
                let mut payload = EventPayload::new();
                payload.insert("messages".to_string(), Value::Number(self.log.len().into()));
                let _ = events.emit("chat_turn", payload);
            }
            Err(err) => {
                let _ = events.emit("chat_failed", error_payload("chat", err));
            }
        }
        self.close_turn(result.is_ok());
        true
    }
}

// ---------------------------------------------------------------------------
// Analysis cache
// ---------------------------------------------------------------------------

pub fn image_cache_key(bytes: &[u8], language: Language) -> String {
    let digest = Sha256::digest(bytes);
    format!("{}:{}", hex::encode(digest), language.code())
}

/// JSON-object file keyed by image digest + language, so re-analyzing
/// the same photo is free. Flush merges with what is on disk, which
/// keeps a concurrent second writer's keys intact.
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty: bool,
    dirty_keys: Vec<String>,
}

impl AnalysisCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty: false,
            dirty_keys: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<ImageAnalysis> {
        let payload = self.ensure_loaded();
        let value = payload.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn put(&mut self, key: &str, analysis: &ImageAnalysis) -> Result<()> {
        let snapshot = serde_json::to_value(analysis)?;
        let payload = self.ensure_loaded();
        if payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        payload.insert(key.to_string(), snapshot);
        self.dirty = true;
        if !self.dirty_keys.contains(&key.to_string()) {
            self.dirty_keys.push(key.to_string());
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.payload.is_none() || !self.dirty || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty = false;
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        self.payload = Some(read_json_object(&self.path).unwrap_or_default());
        self.payload.as_mut().expect("cache payload initialized")
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_payload(feature: &str, err: &anyhow::Error) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert("feature".to_string(), Value::String(feature.to_string()));
    payload.insert(
        "error".to_string(),
        Value::String(error_chain_text(err, 512)),
    );
    payload
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;
    use kisan_contracts::insight::InsightState;
    use kisan_contracts::plot::{DrawTool, Point};
    use kisan_contracts::types::Priority;

    use super::*;

    fn test_events(dir: &tempfile::TempDir) -> EventWriter {
        EventWriter::new(dir.path().join("events.jsonl"), "test-session")
    }

    fn sample_report() -> InsightReport {
        InsightReport {
            overall_assessment: "Healthy cover.".to_string(),
            recommendations: vec![kisan_contracts::types::Suggestion {
                title: "Irrigate".to_string(),
                detail: "Tonight.".to_string(),
                priority: Priority::High,
            }],
        }
    }

    fn sample_analysis() -> ImageAnalysis {
        ImageAnalysis {
            analysis_text: "Lush plot.".to_string(),
            estimated_ndvi: 0.8,
            estimated_soil_moisture: 70,
        }
    }

    /// Advisor whose outcomes are scripted per call; records the
    /// coordinates it was handed.
    struct ScriptedAdvisor {
        suggest_ok: bool,
        plot_ok: bool,
        image_ok: bool,
        chat_fragments: Vec<&'static str>,
        chat_fails_after: Option<usize>,
        last_coordinates: Mutex<Option<Option<Coordinates>>>,
        image_calls: AtomicUsize,
    }

    impl ScriptedAdvisor {
        fn ok() -> Self {
            Self {
                suggest_ok: true,
                plot_ok: true,
                image_ok: true,
                chat_fragments: vec!["Water ", "weekly."],
                chat_fails_after: None,
                last_coordinates: Mutex::new(None),
                image_calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                suggest_ok: false,
                plot_ok: false,
                image_ok: false,
                chat_fragments: Vec::new(),
                chat_fails_after: Some(0),
                last_coordinates: Mutex::new(None),
                image_calls: AtomicUsize::new(0),
            }
        }
    }

    impl Advisor for ScriptedAdvisor {
        fn name(&self) -> &str {
            "scripted"
        }

        fn suggest(
            &self,
            _status: FarmStatus,
            _language: Language,
            coordinates: Option<Coordinates>,
        ) -> Result<InsightReport> {
            *self.last_coordinates.lock().unwrap() = Some(coordinates);
            if self.suggest_ok {
                Ok(sample_report())
            } else {
                Err(anyhow!("advisor returned invalid JSON payload"))
            }
        }

        fn analyze_image(
            &self,
            _bytes: &[u8],
            _mime: &str,
            _language: Language,
        ) -> Result<ImageAnalysis> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            if self.image_ok {
                Ok(sample_analysis())
            } else {
                Err(anyhow!("image analysis failed"))
            }
        }

        fn analyze_plot(&self, _language: Language) -> Result<ImageAnalysis> {
            if self.plot_ok {
                Ok(sample_analysis())
            } else {
                Err(anyhow!("plot analysis failed"))
            }
        }

        fn forecast(&self, _city: &str, _language: Language) -> Result<WeatherSnapshot> {
            DryrunAdvisor.forecast("Nashik", Language::En)
        }

        fn chat(
            &self,
            _persona: &str,
            _history: &[ChatMessage],
            _message: &str,
            on_fragment: &mut dyn FnMut(&str),
        ) -> Result<()> {
            for (idx, fragment) in self.chat_fragments.iter().enumerate() {
                if self.chat_fails_after == Some(idx) {
                    return Err(anyhow!("stream dropped"));
                }
                on_fragment(fragment);
            }
            match self.chat_fails_after {
                Some(n) if n >= self.chat_fragments.len() => Err(anyhow!("stream dropped")),
                _ => Ok(()),
            }
        }
    }

    struct FixedLocator(Coordinates);

    impl LocatePosition for FixedLocator {
        fn locate(&self) -> Result<Option<Coordinates>> {
            Ok(Some(self.0))
        }
    }

    struct DeniedLocator;

    impl LocatePosition for DeniedLocator {
        fn locate(&self) -> Result<Option<Coordinates>> {
            Err(anyhow!("permission denied"))
        }
    }

    #[test]
    fn insight_flow_passes_coordinates_through() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        store.record_poll(store.poll_token(), FarmStatus { ndvi_avg: 0.7, soil_moisture: 60 });

        let advisor = ScriptedAdvisor::ok();
        let locator = FixedLocator(Coordinates {
            latitude: 19.99,
            longitude: 73.78,
        });
        let mut flow = InsightFlow::new(Language::En);
        assert!(flow.run(&store, &locator, &advisor, &events));

        assert!(matches!(flow.tracker().state(), InsightState::Success(_)));
        let seen = advisor.last_coordinates.lock().unwrap().clone();
        assert_eq!(
            seen,
            Some(Some(Coordinates {
                latitude: 19.99,
                longitude: 73.78
            }))
        );
    }

    #[test]
    fn insight_flow_rejects_without_status_snapshot() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let advisor = ScriptedAdvisor::ok();
        let mut flow = InsightFlow::new(Language::En);

        assert!(!flow.run(&store, &EnvLocator, &advisor, &events));
        assert_eq!(flow.tracker().state(), &InsightState::Idle);
    }

    #[test]
    fn location_denial_is_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        store.record_poll(store.poll_token(), FarmStatus { ndvi_avg: 0.7, soil_moisture: 60 });

        let advisor = ScriptedAdvisor::ok();
        let mut flow = InsightFlow::new(Language::Hi);
        assert!(flow.run(&store, &DeniedLocator, &advisor, &events));

        assert!(matches!(flow.tracker().state(), InsightState::Success(_)));
        let seen = advisor.last_coordinates.lock().unwrap().clone();
        assert_eq!(seen, Some(None));
    }

    #[test]
    fn malformed_advisor_response_lands_in_error_and_preserves_status() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let before = FarmStatus {
            ndvi_avg: 0.55,
            soil_moisture: 48,
        };
        store.record_poll(store.poll_token(), before);

        let advisor = ScriptedAdvisor::failing();
        let mut flow = InsightFlow::new(Language::En);
        assert!(flow.run(&store, &EnvLocator, &advisor, &events));

        assert_eq!(flow.tracker().state(), &InsightState::Error);
        assert_eq!(store.current(), Some(before));

        // Retry restarts the same sequence from the top.
        let retry_advisor = ScriptedAdvisor::ok();
        assert!(flow.run(&store, &EnvLocator, &retry_advisor, &events));
        assert!(matches!(flow.tracker().state(), InsightState::Success(_)));
    }

    #[test]
    fn analysis_write_wins_over_stale_poll() {
        let store = StatusStore::new();
        let poll_value = FarmStatus {
            ndvi_avg: 0.5,
            soil_moisture: 50,
        };
        let analysis_value = FarmStatus {
            ndvi_avg: 0.8,
            soil_moisture: 70,
        };

        // Poll begins, then an analysis lands before the poll result does.
        let token = store.poll_token();
        assert!(store.record_analysis(analysis_value));
        assert!(!store.record_poll(token, poll_value));
        assert_eq!(store.current(), Some(analysis_value));
        assert_eq!(store.last_source(), Some(StatusSource::Analysis));

        // The next poll cycle takes a fresh token and applies normally.
        let token = store.poll_token();
        assert!(store.record_poll(token, poll_value));
        assert_eq!(store.current(), Some(poll_value));
    }

    #[test]
    fn analysis_overwrites_polled_status() {
        let store = StatusStore::new();
        store.record_poll(store.poll_token(), FarmStatus { ndvi_avg: 0.5, soil_moisture: 50 });
        store.record_analysis(FarmStatus {
            ndvi_avg: 0.8,
            soil_moisture: 70,
        });
        assert_eq!(
            store.current(),
            Some(FarmStatus {
                ndvi_avg: 0.8,
                soil_moisture: 70
            })
        );
    }

    #[test]
    fn closed_store_ignores_late_writes() {
        let store = StatusStore::new();
        let token = store.poll_token();
        store.close();
        assert!(!store.record_poll(token, FarmStatus { ndvi_avg: 0.5, soil_moisture: 50 }));
        assert!(!store.record_analysis(FarmStatus {
            ndvi_avg: 0.8,
            soil_moisture: 70
        }));
        assert_eq!(store.current(), None);
    }

    #[test]
    fn poller_applies_results_and_stops_on_close() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = Arc::new(StatusStore::new());
        let source = Box::new(SensorFeed::with_seed(7));

        let poller = StatusPoller::spawn(
            Arc::clone(&store),
            source,
            events,
            Duration::from_millis(10),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.current().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(store.current().is_some());

        store.close();
        poller.join();
    }

    struct FailingSource;

    impl FarmStatusSource for FailingSource {
        fn fetch(&mut self) -> Result<FarmStatus> {
            Err(anyhow!("sensor offline"))
        }
    }

    #[test]
    fn poll_failures_are_logged_and_swallowed() {
        let temp = tempfile::tempdir().unwrap();
        let events_path = temp.path().join("events.jsonl");
        let events = EventWriter::new(&events_path, "test-session");
        let store = Arc::new(StatusStore::new());

        let poller = StatusPoller::spawn(
            Arc::clone(&store),
            Box::new(FailingSource),
            events,
            Duration::from_millis(10),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while !events_path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        store.close();
        poller.join();

        let content = std::fs::read_to_string(&events_path).unwrap();
        let first: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], json!("poll_failed"));
        assert_eq!(store.current(), None);
    }

    #[test]
    fn plot_analysis_requires_a_defined_plot() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let advisor = ScriptedAdvisor::ok();
        let mut session = PlotSession::default();
        session.select_tool(DrawTool::Polygon);
        session.click(Point::new(10.0, 10.0));

        assert!(!analyze_plot_session(
            &mut session,
            Language::En,
            &store,
            &advisor,
            &events,
            Instant::now(),
        ));
        assert_eq!(store.current(), None);
    }

    #[test]
    fn plot_analysis_sets_banner_and_writes_status() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let advisor = ScriptedAdvisor::ok();
        let mut session = PlotSession::default();
        session.select_tool(DrawTool::Polygon);
        session.click(Point::new(10.0, 10.0));
        session.click(Point::new(40.0, 10.0));
        session.click(Point::new(40.0, 40.0));
        session.click(Point::new(11.0, 10.0));
        assert!(session.is_plot_defined());

        let now = Instant::now();
        assert!(analyze_plot_session(
            &mut session,
            Language::En,
            &store,
            &advisor,
            &events,
            now,
        ));
        assert_eq!(session.banner_text(now), Some("Lush plot."));
        assert_eq!(
            store.current(),
            Some(FarmStatus {
                ndvi_avg: 0.8,
                soil_moisture: 70
            })
        );

        // Failure path shows the generic retry prompt instead.
        let failing = ScriptedAdvisor::failing();
        assert!(analyze_plot_session(
            &mut session,
            Language::En,
            &store,
            &failing,
            &events,
            now,
        ));
        assert_eq!(session.banner_text(now), Some(RETRY_PROMPT));
    }

    #[test]
    fn chat_send_streams_into_the_trailing_entry() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let advisor = ScriptedAdvisor::ok();
        let mut session = ChatSession::start(Language::En);

        assert!(session.send("How often should I water?", &advisor, &events));
        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text, GREETING_TEXT);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[2].text, "Water weekly.");
        assert!(!session.is_awaiting());
    }

    #[test]
    fn chat_rejects_blank_and_overlapping_sends() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let advisor = ScriptedAdvisor::ok();
        let mut session = ChatSession::start(Language::En);

        assert!(!session.send("   ", &advisor, &events));
        assert_eq!(session.messages().len(), 1);

        // A turn opened by a streaming host stays in flight until closed;
        // a send arriving meanwhile is rejected without touching the log.
        assert!(session.open_turn("first question"));
        assert!(session.is_awaiting());
        assert!(!session.send("second question", &advisor, &events));
        assert_eq!(session.messages().len(), 3);

        assert!(session.append_fragment("Half an "));
        assert!(session.append_fragment("inch weekly."));
        session.close_turn(true);
        assert!(!session.is_awaiting());
        assert_eq!(session.messages()[2].text, "Half an inch weekly.");
        assert!(!session.append_fragment("stray"));

        assert!(session.send("hello", &advisor, &events));
        assert_eq!(session.messages().len(), 5);
    }

    #[test]
    fn chat_failure_before_any_fragment_replaces_placeholder() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let advisor = ScriptedAdvisor::failing();
        let mut session = ChatSession::start(Language::En);

        assert!(session.send("hello", &advisor, &events));
        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].text, APOLOGY_TEXT);
        assert!(!session.is_awaiting());
    }

    #[test]
    fn chat_failure_mid_stream_keeps_partial_and_appends_apology() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let advisor = ScriptedAdvisor {
            chat_fragments: vec!["Partial "],
            chat_fails_after: Some(1),
            ..ScriptedAdvisor::ok()
        };
        let mut session = ChatSession::start(Language::En);

        assert!(session.send("hello", &advisor, &events));
        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].text, "Partial ");
        assert_eq!(messages[3].text, APOLOGY_TEXT);
    }

    #[test]
    fn chat_restart_drops_history_and_reseeds() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let advisor = ScriptedAdvisor::ok();
        let mut session = ChatSession::start(Language::En);
        session.send("hello", &advisor, &events);
        assert_eq!(session.messages().len(), 3);

        session.restart(Language::Mr);
        assert_eq!(session.language(), Language::Mr);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].text, GREETING_TEXT);
    }

    #[test]
    fn image_flow_caches_by_digest_and_language() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let advisor = ScriptedAdvisor::ok();
        let cache = AnalysisCache::new(temp.path().join("analysis_cache.json"));
        let mut flow = ImageAnalysisFlow::with_cache(Language::En, cache);

        let bytes = b"fake-image-bytes";
        assert!(flow.run(bytes, "image/jpeg", &store, &advisor, &events));
        assert_eq!(advisor.image_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(flow.tracker().state(), InsightState::Success(_)));

        // Second run hits the cache and skips the provider.
        assert!(flow.run(bytes, "image/jpeg", &store, &advisor, &events));
        assert_eq!(advisor.image_calls.load(Ordering::SeqCst), 1);

        // A different language is a different key.
        flow.set_language(Language::Hi);
        assert!(flow.run(bytes, "image/jpeg", &store, &advisor, &events));
        assert_eq!(advisor.image_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn image_flow_failure_lands_in_error() {
        let temp = tempfile::tempdir().unwrap();
        let events = test_events(&temp);
        let store = StatusStore::new();
        let advisor = ScriptedAdvisor::failing();
        let mut flow = ImageAnalysisFlow::new(Language::En);

        assert!(flow.run(b"bytes", "image/png", &store, &advisor, &events));
        assert_eq!(flow.tracker().state(), &InsightState::Error);
        assert_eq!(store.current(), None);
    }

    #[test]
    fn analysis_cache_round_trips_typed_values() {
        let temp = tempfile::tempdir().unwrap();
        let mut cache = AnalysisCache::new(temp.path().join("cache.json"));
        let key = image_cache_key(b"photo", Language::En);
        assert!(cache.get(&key).is_none());

        cache.put(&key, &sample_analysis()).unwrap();
        assert_eq!(cache.get(&key), Some(sample_analysis()));

        // A second instance sees the flushed value.
        let mut reloaded = AnalysisCache::new(temp.path().join("cache.json"));
        assert_eq!(reloaded.get(&key), Some(sample_analysis()));
    }

    #[test]
    fn sensor_feed_stays_in_range() {
        let mut feed = SensorFeed::with_seed(42);
        for _ in 0..200 {
            let status = feed.fetch().unwrap();
            assert!((0.2..=0.9).contains(&status.ndvi_avg));
            assert!((30..=85).contains(&status.soil_moisture));
        }
    }

    #[test]
    fn historical_series_has_thirty_points() {
        let mut feed = SensorFeed::with_seed(42);
        let series = feed.historical_series();
        assert_eq!(series.len(), 30);
        for point in &series {
            assert!((0.65..=0.85).contains(&point.ndvi));
            assert!((50..75).contains(&point.soil_moisture));
        }
    }

    #[test]
    fn dryrun_advisor_is_deterministic() {
        let status = FarmStatus {
            ndvi_avg: 0.7,
            soil_moisture: 60,
        };
        let first = DryrunAdvisor.suggest(status, Language::En, None).unwrap();
        let second = DryrunAdvisor.suggest(status, Language::En, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.recommendations.len(), 3);

        let a = DryrunAdvisor
            .analyze_image(b"same-bytes", "image/png", Language::En)
            .unwrap();
        let b = DryrunAdvisor
            .analyze_image(b"same-bytes", "image/png", Language::En)
            .unwrap();
        assert_eq!(a, b);
        assert!((0.1..=0.9).contains(&a.estimated_ndvi));
        assert!((20..=90).contains(&a.estimated_soil_moisture));
    }

    #[test]
    fn dryrun_chat_streams_fragments() {
        let mut collected = String::new();
        DryrunAdvisor
            .chat("persona", &[], "water?", &mut |fragment| {
                collected.push_str(fragment);
            })
            .unwrap();
        assert!(collected.contains("water?"));
    }

    #[test]
    fn candidate_text_concatenates_parts() {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}]}
            }]
        });
        assert_eq!(candidate_text(&payload).unwrap(), "{\"a\":1}");

        let empty = json!({"candidates": []});
        assert!(candidate_text(&empty).is_err());
    }

    #[test]
    fn parse_structured_rejects_non_json_text() {
        let err = parse_structured::<InsightReport>("I am not JSON").unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn parse_structured_rejects_wrong_enum_values() {
        let raw = r#"{"overall_assessment":"ok","recommendations":[{"title":"t","detail":"d","priority":"Urgent"}]}"#;
        assert!(parse_structured::<InsightReport>(raw).is_err());
    }

    #[test]
    fn weather_feed_produces_sane_snapshot() {
        let mut feed = WeatherFeed::with_seed(9);
        let snapshot = feed.current("Nashik");
        assert!((27..=34).contains(&snapshot.temperature_celsius));
        assert!((30..80).contains(&snapshot.relative_humidity_percent));
        assert!((0..11).contains(&snapshot.uv_index));
    }
}
