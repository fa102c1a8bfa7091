use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use detour_detect::engine::{self, BatchReport};
use detour_detect::export::detours_to_geojson;
use detour_detect::query::{active_detours, detour_history};
use detour_detect::{
    DetourSettings, DetourState, RouteShapes, RouteStops, ServiceAlert, StateSnapshot, Stop,
    StopIndex, VehicleUpdate,
};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Geojson,
}

/// Replays recorded vehicle-position polls through the detour engine.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON object mapping route id to its shape variants
    #[arg(long)]
    shapes: PathBuf,
    /// JSON lines, one `{"timestamp": ..., "vehicles": [...]}` poll per line
    #[arg(long)]
    batches: PathBuf,
    #[arg(long)]
    settings: Option<PathBuf>,
    /// JSON array of service alerts correlated after every sweep
    #[arg(long)]
    alerts: Option<PathBuf>,
    #[arg(long, requires = "route_stops")]
    stops: Option<PathBuf>,
    /// JSON object mapping route id to the ids of the stops it serves
    #[arg(long, requires = "stops")]
    route_stops: Option<PathBuf>,
    /// Run the expiry sweep and alert correlation every N polls
    #[arg(long, default_value_t = 1)]
    sweep_every: usize,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
    /// Resume from a state snapshot written by a previous run
    #[arg(long)]
    snapshot_in: Option<PathBuf>,
    #[arg(long)]
    snapshot_out: Option<PathBuf>,
}

#[derive(Deserialize)]
struct Batch {
    timestamp: DateTime<Utc>,
    vehicles: Vec<VehicleUpdate>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayOutput {
    totals: BatchReport,
    active: Vec<detour_detect::Detour>,
    history: Vec<detour_detect::ArchivedDetour>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

fn add_reports(total: &mut BatchReport, r: &BatchReport) {
    total.updates += r.updates;
    total.ignored += r.ignored;
    total.untracked += r.untracked;
    total.off_route += r.off_route;
    total.completed_paths += r.completed_paths;
    total.pending_inserted += r.pending_inserted;
    total.detours_created += r.detours_created;
    total.detours_merged += r.detours_merged;
    total.detours_cleared += r.detours_cleared;
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => DetourSettings::from_path(path)?,
        None => DetourSettings::default(),
    };
    let shapes: RouteShapes = read_json(&args.shapes)?;
    let alerts: Option<Vec<ServiceAlert>> = args.alerts.as_deref().map(read_json).transpose()?;
    let stops = match (&args.stops, &args.route_stops) {
        (Some(stops_path), Some(route_stops)) => {
            let stops: Vec<Stop> = read_json(stops_path)?;
            let route_stops: RouteStops = read_json(route_stops)?;
            let index = StopIndex::new(stops);
            if index.is_empty() {
                warn!(
                    "No usable stops in {}, detours will not list affected stops",
                    stops_path.display()
                );
            } else {
                info!("Indexed {} stops for {} routes", index.len(), route_stops.len());
            }
            Some((index, route_stops))
        }
        _ => None,
    };
    let state = match &args.snapshot_in {
        Some(path) => DetourState::restore(read_json::<StateSnapshot>(path)?),
        None => DetourState::new(),
    };
    info!(
        "Loaded shapes for {} routes, {} tracked vehicles restored",
        shapes.len(),
        state.tracked_vehicles()
    );

    let file = File::open(&args.batches)
        .with_context(|| format!("opening {}", args.batches.display()))?;
    let mut totals = BatchReport::default();
    let mut last_time = None;
    let sweep_every = args.sweep_every.max(1);

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let batch: Batch = serde_json::from_str(&line)
            .with_context(|| format!("{} line {}", args.batches.display(), line_no + 1))?;

        let report = engine::process_batch(&state, &settings, &shapes, &batch.vehicles, batch.timestamp);
        add_reports(&mut totals, &report);
        last_time = Some(batch.timestamp);

        if (line_no + 1) % sweep_every == 0 {
            engine::tick(&state, &settings, batch.timestamp);
            if let Some(alerts) = &alerts {
                engine::correlate(&state, &settings, alerts, batch.timestamp);
            }
        }
    }

    if let Some(now) = last_time {
        engine::tick(&state, &settings, now);
        if let Some(alerts) = &alerts {
            engine::correlate(&state, &settings, alerts, now);
        }
    }
    if let Some((index, route_stops)) = &stops {
        engine::enrich(&state, &settings, index, route_stops);
    }

    let active = active_detours(&state);
    info!(
        "Replay done: {} updates, {} active detours, {} pending paths",
        totals.updates,
        active.len(),
        state.pending_path_count()
    );

    let stdout = std::io::stdout();
    match args.format {
        OutputFormat::Json => {
            let output = ReplayOutput {
                totals,
                active,
                history: detour_history(&state, None, settings.history_cap),
            };
            serde_json::to_writer_pretty(stdout.lock(), &output)?;
        }
        OutputFormat::Geojson => {
            serde_json::to_writer_pretty(stdout.lock(), &detours_to_geojson(&active))?;
        }
    }
    println!();

    if let Some(path) = &args.snapshot_out {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &state.snapshot())?;
        info!("Wrote snapshot to {}", path.display());
    }
    Ok(())
}
