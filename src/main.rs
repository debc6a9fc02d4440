use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::Parser;
use stormwatch_core::Config;
use stormwatch_weather::{
    open_backend, CacheStore, ForecastPipeline, LocationRequest, OpenMeteoClient, Phase,
    PipelineSnapshot,
};

/// Forecast and hazard signals for a fixed point
#[derive(Parser)]
#[command(name = "stormwatch", about = "Forecast and hazard signals for a fixed point")]
struct Cli {
    /// Latitude in decimal degrees (defaults to the configured location)
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<String>,

    /// Longitude in decimal degrees (defaults to the configured location)
    #[arg(long, allow_hyphen_values = true)]
    lon: Option<String>,

    /// Ignore the cache because the location just changed
    #[arg(long)]
    location_changed: bool,

    /// Keep running and refresh at the top of every hour until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    stormwatch_core::init()?;
    let cli = Cli::parse();

    let (config, _) = Config::load_validated(cli.config.as_deref())?;

    let lat = cli.lat.unwrap_or_else(|| config.location.latitude.clone());
    let lon = cli.lon.unwrap_or_else(|| config.location.longitude.clone());
    check_coordinate(&lat, "latitude", 90.0)?;
    check_coordinate(&lon, "longitude", 180.0)?;
    let request = LocationRequest::new(lat, lon).with_location_changed(cli.location_changed);

    let backend = open_backend(&config.cache, &config.config_dir);
    let client =
        OpenMeteoClient::from_config(&config.weather).context("Failed to create HTTP client")?;
    let pipeline = ForecastPipeline::new(client, CacheStore::new(backend));

    tracing::info!("Stormwatch started for {}, {}", request.lat, request.lon);
    let snapshot = pipeline.activate(request).await;
    print_snapshot(&snapshot);

    if !cli.watch {
        if let Some(message) = snapshot.error_message() {
            anyhow::bail!("{}", message);
        }
        return Ok(());
    }

    let refresh =
        pipeline.spawn_hourly_refresh(Duration::from_secs(config.weather.poll_interval_secs));
    let mut updates = pipeline.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if !snapshot.is_loading {
                    print_snapshot(&snapshot);
                }
            }
        }
    }

    refresh.shutdown().await;
    Ok(())
}

fn check_coordinate(value: &str, name: &str, limit: f64) -> Result<()> {
    let parsed: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {name}: {value:?}"))?;
    if !parsed.is_finite() || parsed.abs() > limit {
        anyhow::bail!("Invalid {}: {} is outside [-{}, {}]", name, value, limit, limit);
    }
    Ok(())
}

fn print_snapshot(snapshot: &PipelineSnapshot) {
    if let Some(request) = &snapshot.request {
        println!("\nForecast for {}, {}", request.lat, request.lon);
    }
    if let Some(updated) = snapshot.last_updated {
        println!("  Updated: {}", updated.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }

    if let Some(forecast) = &snapshot.forecast {
        for day in forecast {
            let date = Local
                .timestamp_opt(day.time, 0)
                .single()
                .map(|d| d.format("%a %d %b").to_string())
                .unwrap_or_else(|| day.time.to_string());
            println!(
                "  {:<10} {:<14} {:>5.1}°C / {:>5.1}°C  UV {:>4.1}  wind {:>5.1} km/h  rain {:>3.0}%",
                date,
                day.condition().description(),
                day.temperature_max,
                day.temperature_min,
                day.uv_index_max,
                day.wind_speed_max,
                day.precipitation_probability,
            );
        }
    }

    if let Some(signals) = &snapshot.signals {
        let hazards = signals.active_hazards();
        if hazards.is_empty() {
            println!("  No hazards in the next 24 hours");
        }
        for hazard in hazards {
            println!("  Hazard: {}", hazard.description());
        }

        let rain = &signals.precipitation;
        if rain.total_mm > 0.0 {
            let hours = rain.duration_mask.iter().filter(|&&h| h).count();
            println!(
                "  Precipitation: {:.1} mm{} over {} h",
                rain.total_mm,
                if rain.is_underestimate { "+" } else { "" },
                hours
            );
        }
    }

    if snapshot.phase == Phase::Failed {
        if let Some(message) = snapshot.error_message() {
            println!("  Error: {} (showing last known forecast)", message);
        }
    }
}
