use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kisan_contracts::chat::{parse_command, ShellCommand, SHELL_HELP};
use kisan_contracts::events::EventWriter;
use kisan_contracts::insight::InsightState;
use kisan_contracts::plot::{DrawTool, PlotSession, Point};
use kisan_contracts::types::{ImageAnalysis, InsightReport, Language, WeatherSnapshot};
use kisan_engine::{
    analyze_plot_session, default_advisor, Advisor, AnalysisCache, ChatSession, EngineConfig,
    EnvLocator, FarmStatusSource, ImageAnalysisFlow, InsightFlow, SensorFeed, StatusPoller,
    StatusStore, WeatherFeed,
};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "kisan", version, about = "Farm dashboard engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive assistant shell with a background status poller.
    Chat(ChatArgs),
    /// One-shot farm insight report.
    Insights(CommonArgs),
    /// Analyze a satellite image of the farm.
    Analyze(AnalyzeArgs),
    /// Weather for a city (mock source, or the advisor with --ai).
    Forecast(ForecastArgs),
    /// Current sensor status plus the trailing 30-day series.
    Status(StatusArgs),
    /// Replay plot-capture gestures from a JSON file and analyze the plot.
    Plot(PlotArgs),
}

#[derive(Debug, Parser)]
struct CommonArgs {
    #[arg(long, default_value = "en")]
    language: Language,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    /// Path to a JPEG or PNG of the farm.
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    cache: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct ForecastArgs {
    #[arg(long)]
    city: String,
    /// Delegate to the AI advisor instead of the mock source.
    #[arg(long)]
    ai: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    /// Keep polling on the standard interval instead of reading once.
    #[arg(long)]
    watch: bool,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct PlotArgs {
    /// JSON array of gestures, e.g.
    /// `[{"op":"tool","tool":"polygon"},{"op":"click","x":10,"y":10}]`.
    #[arg(long)]
    gestures: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("kisan error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Insights(args) => run_insights(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Forecast(args) => run_forecast(args),
        Command::Status(args) => run_status(args),
        Command::Plot(args) => run_plot(args),
    }
}

fn event_writer(common: &CommonArgs) -> EventWriter {
    let path = common
        .events
        .clone()
        .unwrap_or_else(|| PathBuf::from("events.jsonl"));
    EventWriter::new(path, Uuid::new_v4().to_string())
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let config = EngineConfig::default();
    let events = event_writer(&args.common);
    let advisor = default_advisor(&config);
    let store = Arc::new(StatusStore::new());
    let poller = StatusPoller::spawn(
        Arc::clone(&store),
        Box::new(SensorFeed::new()),
        events.clone(),
        config.poll_interval,
    );

    let mut chat = ChatSession::start(args.common.language);
    let mut insights = InsightFlow::new(args.common.language);
    let locator = EnvLocator;

    let stdin = io::stdin();
    let mut line = String::new();

    println!(
        "Agri Assistant shell ({} advisor). Type /help for commands.",
        advisor.name()
    );
    println!("{}", kisan_engine::GREETING_TEXT);

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        match parse_command(input) {
            ShellCommand::Noop => continue,
            ShellCommand::Help => {
                println!("Commands: {}", SHELL_HELP.join(" "));
            }
            ShellCommand::Quit => break,
            ShellCommand::Clear => {
                chat.restart(chat.language());
                println!("{}", kisan_engine::GREETING_TEXT);
            }
            ShellCommand::Status => match store.current() {
                Some(status) => println!(
                    "NDVI {:.2}, soil moisture {}%",
                    status.ndvi_avg, status.soil_moisture
                ),
                None => println!("No status snapshot yet; the poller runs every 30s."),
            },
            ShellCommand::Insights => {
                if !insights.run(&store, &locator, advisor.as_ref(), &events) {
                    println!("Insights unavailable: no status snapshot yet.");
                    continue;
                }
                if let Some(advisory) = insights.tracker().advisory() {
                    println!("Note: {advisory}");
                }
                match insights.tracker().state() {
                    InsightState::Success(report) => print_report(report),
                    InsightState::Error => println!("{}", kisan_engine::RETRY_PROMPT),
                    _ => {}
                }
            }
            ShellCommand::SetLanguage { code } => match code.parse::<Language>() {
                Ok(language) => {
                    // Switching language restarts the conversation context.
                    chat.restart(language);
                    insights.set_language(language);
                    println!("Language set to {}.", language.english_name());
                    println!("{}", kisan_engine::GREETING_TEXT);
                }
                Err(err) => println!("{err}"),
            },
            ShellCommand::Analyze { path } => {
                if path.is_empty() {
                    println!("/analyze requires an image path");
                    continue;
                }
                match analyze_image_file(
                    &PathBuf::from(path),
                    None,
                    chat.language(),
                    &store,
                    advisor.as_ref(),
                    &events,
                ) {
                    Ok(analysis) => print_analysis(&analysis),
                    Err(err) => println!("Analysis failed: {err:#}"),
                }
            }
            ShellCommand::Forecast { city } => {
                if city.is_empty() {
                    println!("/forecast requires a city");
                    continue;
                }
                match advisor.forecast(&city, chat.language()) {
                    Ok(snapshot) => print_weather(&city, &snapshot),
                    Err(err) => println!("Forecast failed: {err:#}"),
                }
            }
            ShellCommand::Unknown { command } => {
                println!("Unknown command /{command}. Type /help for commands.");
            }
            ShellCommand::Prompt { text } => {
                let echo = EchoAdvisor {
                    inner: advisor.as_ref(),
                };
                if !chat.send(&text, &echo, &events) {
                    continue;
                }
                println!();
                // A failed stream closes out with the apology entry, which
                // never went through the echo path.
                if let Some(last) = chat.messages().last() {
                    if last.text == kisan_engine::APOLOGY_TEXT {
                        println!("{}", last.text);
                    }
                }
            }
        }
    }

    store.close();
    poller.join();
    Ok(())
}

/// Mirrors chat fragments to stdout as they arrive, then forwards them
/// to the session's accumulator.
struct EchoAdvisor<'a> {
    inner: &'a dyn Advisor,
}

impl Advisor for EchoAdvisor<'_> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn suggest(
        &self,
        status: kisan_contracts::types::FarmStatus,
        language: Language,
        coordinates: Option<kisan_contracts::types::Coordinates>,
    ) -> Result<InsightReport> {
        self.inner.suggest(status, language, coordinates)
    }

    fn analyze_image(&self, bytes: &[u8], mime: &str, language: Language) -> Result<ImageAnalysis> {
        self.inner.analyze_image(bytes, mime, language)
    }

    fn analyze_plot(&self, language: Language) -> Result<ImageAnalysis> {
        self.inner.analyze_plot(language)
    }

    fn forecast(&self, city: &str, language: Language) -> Result<WeatherSnapshot> {
        self.inner.forecast(city, language)
    }

    fn chat(
        &self,
        persona: &str,
        history: &[kisan_contracts::chat::ChatMessage],
        message: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<()> {
        self.inner.chat(persona, history, message, &mut |fragment| {
            print!("{fragment}");
            let _ = io::stdout().flush();
            on_fragment(fragment);
        })
    }
}

fn run_insights(args: CommonArgs) -> Result<i32> {
    let config = EngineConfig::default();
    let events = event_writer(&args);
    let advisor = default_advisor(&config);
    let store = StatusStore::new();

    // One-shot mode takes a single sensor reading instead of polling.
    let mut feed = SensorFeed::new();
    let status = feed.fetch()?;
    store.record_poll(store.poll_token(), status);

    let mut flow = InsightFlow::new(args.language);
    if !flow.run(&store, &EnvLocator, advisor.as_ref(), &events) {
        bail!("insight request rejected");
    }
    if let Some(advisory) = flow.tracker().advisory() {
        println!("Note: {advisory}");
    }
    match flow.tracker().state() {
        InsightState::Success(report) => {
            print_report(report);
            Ok(0)
        }
        _ => {
            eprintln!("{}", kisan_engine::RETRY_PROMPT);
            Ok(1)
        }
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let config = EngineConfig::default();
    let events = event_writer(&args.common);
    let advisor = default_advisor(&config);
    let store = StatusStore::new();

    let analysis = analyze_image_file(
        &args.image,
        args.cache,
        args.common.language,
        &store,
        advisor.as_ref(),
        &events,
    )?;
    print_analysis(&analysis);
    Ok(0)
}

fn analyze_image_file(
    path: &PathBuf,
    cache: Option<PathBuf>,
    language: Language,
    store: &StatusStore,
    advisor: &dyn Advisor,
    events: &EventWriter,
) -> Result<ImageAnalysis> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    let format = image::guess_format(&bytes)
        .with_context(|| format!("{} is not a recognized image", path.display()))?;
    let mime = format.to_mime_type();

    let mut flow = match cache {
        Some(cache_path) => ImageAnalysisFlow::with_cache(language, AnalysisCache::new(cache_path)),
        None => ImageAnalysisFlow::new(language),
    };
    if !flow.run(&bytes, mime, store, advisor, events) {
        bail!("image analysis rejected");
    }
    match flow.tracker().result() {
        Some(analysis) => Ok(analysis.clone()),
        None => bail!("image analysis failed"),
    }
}

fn run_forecast(args: ForecastArgs) -> Result<i32> {
    let snapshot = if args.ai {
        let config = EngineConfig::default();
        let advisor = default_advisor(&config);
        advisor.forecast(&args.city, args.common.language)?
    } else {
        WeatherFeed::new().current(&args.city)
    };
    print_weather(&args.city, &snapshot);
    Ok(0)
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let mut feed = SensorFeed::new();
    let status = feed.fetch()?;
    println!(
        "NDVI {:.2}, soil moisture {}%",
        status.ndvi_avg, status.soil_moisture
    );

    println!("Last 30 days:");
    for point in feed.historical_series() {
        println!(
            "  {:<8} NDVI {:.2}  moisture {}%",
            point.date, point.ndvi, point.soil_moisture
        );
    }

    if args.watch {
        let config = EngineConfig::default();
        let events = event_writer(&args.common);
        let store = Arc::new(StatusStore::new());
        store.record_poll(store.poll_token(), status);
        let _poller = StatusPoller::spawn(
            Arc::clone(&store),
            Box::new(feed),
            events,
            config.poll_interval,
        );
        let mut last_seen = Some(status);
        // Runs until interrupted.
        loop {
            std::thread::sleep(std::time::Duration::from_millis(500));
            let current = store.current();
            if current != last_seen {
                if let Some(status) = current {
                    println!(
                        "NDVI {:.2}, soil moisture {}%",
                        status.ndvi_avg, status.soil_moisture
                    );
                }
                last_seen = current;
            }
        }
    }
    Ok(0)
}

fn run_plot(args: PlotArgs) -> Result<i32> {
    let config = EngineConfig::default();
    let events = event_writer(&args.common);
    let advisor = default_advisor(&config);
    let store = StatusStore::new();

    let raw = fs::read_to_string(&args.gestures)
        .with_context(|| format!("failed to read {}", args.gestures.display()))?;
    let gestures: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.gestures.display()))?;

    let mut session = PlotSession::default();
    replay_gestures(&mut session, &gestures)?;

    if !session.is_plot_defined() {
        println!("No plot defined after replay.");
        return Ok(1);
    }
    if !session.points().is_empty() {
        println!("Plot: polygon with {} vertices", session.points().len());
    } else if let Some(rect) = session.rectangle() {
        println!(
            "Plot: rectangle {:.1}x{:.1} at ({:.1}, {:.1})",
            rect.width, rect.height, rect.x, rect.y
        );
    }

    let now = Instant::now();
    analyze_plot_session(
        &mut session,
        args.common.language,
        &store,
        advisor.as_ref(),
        &events,
        now,
    );
    if let Some(text) = session.banner_text(now) {
        println!("{text}");
    }
    if let Some(status) = store.current() {
        println!(
            "Estimated NDVI {:.2}, soil moisture {}%",
            status.ndvi_avg, status.soil_moisture
        );
    }
    Ok(0)
}

/// Applies one gesture object per array element to the session.
fn replay_gestures(session: &mut PlotSession, gestures: &Value) -> Result<()> {
    let Some(items) = gestures.as_array() else {
        bail!("gesture file must be a JSON array");
    };
    for (index, item) in items.iter().enumerate() {
        let op = item
            .get("op")
            .and_then(Value::as_str)
            .with_context(|| format!("gesture {index} has no \"op\""))?;
        match op {
            "tool" => {
                let tool = match item.get("tool").and_then(Value::as_str) {
                    Some("polygon") => DrawTool::Polygon,
                    Some("rectangle") => DrawTool::Rectangle,
                    Some("none") | None => DrawTool::None,
                    Some(other) => bail!("gesture {index}: unknown tool \"{other}\""),
                };
                session.select_tool(tool);
            }
            "click" => session.click(gesture_point(item, index)?),
            "down" => session.pointer_down(gesture_point(item, index)?),
            "move" => session.pointer_move(gesture_point(item, index)?),
            "up" => session.pointer_up(),
            "clear" => session.clear(),
            other => bail!("gesture {index}: unknown op \"{other}\""),
        }
    }
    Ok(())
}

fn gesture_point(item: &Value, index: usize) -> Result<Point> {
    let x = item
        .get("x")
        .and_then(Value::as_f64)
        .with_context(|| format!("gesture {index} has no numeric \"x\""))?;
    let y = item
        .get("y")
        .and_then(Value::as_f64)
        .with_context(|| format!("gesture {index} has no numeric \"y\""))?;
    Ok(Point::new(x, y))
}

fn print_report(report: &InsightReport) {
    println!("{}", report.overall_assessment);
    for suggestion in &report.recommendations {
        println!(
            "  [{:?}] {}: {}",
            suggestion.priority, suggestion.title, suggestion.detail
        );
    }
}

fn print_analysis(analysis: &ImageAnalysis) {
    println!("{}", analysis.analysis_text);
    println!(
        "Estimated NDVI {:.2}, soil moisture {}%",
        analysis.estimated_ndvi, analysis.estimated_soil_moisture
    );
}

fn print_weather(city: &str, snapshot: &WeatherSnapshot) {
    println!(
        "{city}: {}°C, {} (feels like {}°C)",
        snapshot.temperature_celsius, snapshot.condition_text, snapshot.feels_like_celsius
    );
    println!(
        "  High {}°C / Low {}°C, 24h change {:+.1}°C",
        snapshot.high_celsius, snapshot.low_celsius, snapshot.temp_24h_change
    );
    println!(
        "  Rain {}% (storms {}%), precip {:.1}mm, humidity {}%, dew point {:.1}°C",
        snapshot.rain_probability_percent,
        snapshot.thunderstorm_probability_percent,
        snapshot.qpf_mm,
        snapshot.relative_humidity_percent,
        snapshot.dew_point_celsius
    );
    println!(
        "  Wind {} km/h {:?} (gusts {} km/h), visibility {} km, cloud cover {}%",
        snapshot.wind_kph,
        snapshot.wind_direction_cardinal,
        snapshot.wind_gust_kph,
        snapshot.visibility_km,
        snapshot.cloud_cover_percent
    );
    println!(
        "  UV index {}, pressure {} hPa",
        snapshot.uv_index, snapshot.air_pressure_hpa
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn gesture_replay_builds_a_closed_polygon() {
        let gestures = json!([
            {"op": "tool", "tool": "polygon"},
            {"op": "click", "x": 10.0, "y": 10.0},
            {"op": "click", "x": 40.0, "y": 10.0},
            {"op": "click", "x": 40.0, "y": 40.0},
            {"op": "click", "x": 11.0, "y": 10.0},
        ]);
        let mut session = PlotSession::default();
        replay_gestures(&mut session, &gestures).unwrap();
        assert!(session.is_plot_defined());
        assert_eq!(session.points().len(), 3);
    }

    #[test]
    fn gesture_replay_builds_a_rectangle() {
        let gestures = json!([
            {"op": "tool", "tool": "rectangle"},
            {"op": "down", "x": 10.0, "y": 10.0},
            {"op": "move", "x": 30.0, "y": 25.0},
            {"op": "up"},
        ]);
        let mut session = PlotSession::default();
        replay_gestures(&mut session, &gestures).unwrap();
        assert!(session.is_plot_defined());
        let rect = session.rectangle().unwrap();
        assert_eq!(rect.width, 20.0);
        assert_eq!(rect.height, 15.0);
    }

    #[test]
    fn gesture_replay_rejects_malformed_input() {
        let mut session = PlotSession::default();
        assert!(replay_gestures(&mut session, &json!({"op": "tool"})).is_err());
        assert!(replay_gestures(&mut session, &json!([{"op": "warp"}])).is_err());
        assert!(
            replay_gestures(&mut session, &json!([{"op": "click", "x": 1.0}])).is_err()
        );
    }
}
