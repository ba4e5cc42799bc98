//! Pipeline Autotune - Demo Entry Point
//!
//! Runs a synthetic pipeline whose map stage sleeps per element, lets the
//! autotuner size it, and prints the final metrics report as JSON.
//!
//! Usage: `autotune-demo [CONFIG] [ELEMENTS]`

use anyhow::{Context, Result};
use pipeline_autotune::{
    logging,
    metrics::MemorySink,
    prelude::*,
    AutotuneConfig,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Simulated cost of the map stage per element.
const MAP_COST: Duration = Duration::from_millis(5);

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let elements: i64 = match args.next() {
        Some(n) => n.parse().context("ELEMENTS must be an integer")?,
        None => 400,
    };

    let config = AutotuneConfig::load_from(config_path.as_deref())
        .and_then(AutotuneConfig::with_env_overrides)
        .context("Failed to load autotune config")?;
    let _log_guard = logging::init_tracing(&config.logging)?;

    tracing::info!(
        "Starting autotune demo: {} elements, algorithm {}",
        elements,
        config.algorithm
    );

    let sink = MemorySink::new();
    let options = AutotuneOptions::from(&config).with_sink(sink.clone());
    let dataset = Range::new(0, elements)
        .parallel_map(|x| {
            std::thread::sleep(MAP_COST);
            Ok(x * x)
        })
        .prefetch()
        .autotune(options)?;

    let ctx = IteratorContext::default();
    let mut it = dataset.make_iterator(&ctx)?;
    let started = Instant::now();
    let mut produced = 0u64;
    while it.get_next(&ctx)?.is_some() {
        produced += 1;
        if produced % 100 == 0 {
            tracing::info!(
                "{} elements in {:?}, parameters {:?}",
                produced,
                started.elapsed(),
                it.model().parameter_vector()
            );
        }
    }

    tracing::info!(
        "Finished {} elements in {:?} after {} optimization cycles",
        produced,
        started.elapsed(),
        it.optimization_cycles()
    );
    tracing::debug!("Final model:\n{}", it.model().debug_string());

    let report = sink.latest().unwrap_or_else(|| it.model().report());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
