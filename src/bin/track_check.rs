use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::{Duration, Instant};

use gridwalk::dwell::{DwellTracker, Observation};
use gridwalk::grid::{self, Grid};
use gridwalk::position::TrackReplay;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: track_check <grid.geojson> <track.ndjson> [min_dwell_s]");
        std::process::exit(1);
    }

    let raw = tokio::fs::read_to_string(&args[1])
        .await
        .with_context(|| format!("failed to read grid {}", args[1]))?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("grid is not JSON")?;
    let grid = Grid::from_geojson(&value).context("invalid grid")?;

    let track = TrackReplay::open(Path::new(&args[2])).await?;

    let min_dwell_s: u64 = match args.get(3) {
        Some(s) => s.parse().with_context(|| format!("invalid min_dwell_s: {s}"))?,
        None => 10,
    };

    println!("Grid: {} cells from {}", grid.len(), args[1]);
    println!("Track: {} points from {}", track.len(), args[2]);
    println!("Minimum dwell: {min_dwell_s}s");
    println!();

    let mut tracker = DwellTracker::new(Duration::from_secs(min_dwell_s));
    let start = Instant::now();
    let wall_start = Utc::now();
    let mut last_point = None;
    let mut confirmed = 0usize;

    for (offset, fix) in track.fixes() {
        let now = start + offset;

        // The deadline falls between two samples: confirm at the deadline.
        if let (Some(deadline), Some(at)) = (tracker.deadline(), last_point)
            && deadline <= now
            && let Some(visit) = tracker.fire(deadline, at)
        {
            confirmed += 1;
            println!(
                "{:>8.1}s  VISIT    {} (dwell {}s)",
                (deadline - start).as_secs_f64(),
                visit.cell_id,
                (visit.confirmed_at - visit.entered_at).num_seconds()
            );
        }

        let wall = wall_start
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
        let cell = grid::locate(fix.point(), &grid);
        if let Observation::Entered { cell_id, cancelled } = tracker.observe(cell, now, wall) {
            if let Some(c) = cancelled {
                println!(
                    "{:>8.1}s  left     {} early",
                    offset.as_secs_f64(),
                    c.cell_id
                );
            }
            match cell_id {
                Some(id) => println!("{:>8.1}s  entered  {id}", offset.as_secs_f64()),
                None => println!("{:>8.1}s  outside grid", offset.as_secs_f64()),
            }
        }
        last_point = Some(fix.point());
    }

    println!();
    println!("{confirmed} visit(s) confirmed");
    Ok(())
}
