//! CLI command implementations

use crate::output::{self, OutputFormat};
use crate::sim::{self, SimOptions};
use flick_core::engine::{HlsManifestLoader, ManifestLoader};
use flick_core::FlickConfig;
use std::path::PathBuf;
use url::Url;

/// Simulate a feed session
pub async fn simulate(options: SimOptions, format: &str) -> anyhow::Result<()> {
    let report = sim::run(options).await?;

    match OutputFormat::from(format) {
        OutputFormat::Json => {
            println!("{}", output::to_json(&report));
            return Ok(());
        }
        OutputFormat::Table => {
            for (i, step) in report.steps.iter().enumerate() {
                println!("\nStep {}: {} (current: {:?})", i + 1, step.step, step.stats.current_index);
                println!("{}", output::slot_table(&step.stats.slots));
            }
        }
        OutputFormat::Text => {
            for (i, step) in report.steps.iter().enumerate() {
                println!("\nStep {}: {} (current: {:?})", i + 1, step.step, step.stats.current_index);
                println!("{}", output::slot_lines(&step.stats.slots));
            }
        }
    }

    if let Some(last) = report.steps.last() {
        let stats = &last.stats;
        println!("\nFinal state:");
        println!("  Engine: {}", stats.engine);
        println!(
            "  Memory: {} resident, {} decoded, {:.0}/{:.0} MB",
            stats.memory.resident, stats.memory.decoded, stats.memory.total_estimated_mb, stats.memory.ceiling_mb
        );
        println!(
            "  Preload: {} queued, {} in flight, {} loaded, {} cancelled",
            stats.preload.queued, stats.preload.in_flight, stats.preload.loaded, stats.preload.cancelled
        );
        if stats.preload_bandwidth_bps > 0 {
            println!("  Preload bandwidth: {}", output::format_bitrate(stats.preload_bandwidth_bps));
        }
        println!("  Network: {}", stats.network.class);
    }

    println!("\nEvents:");
    for (kind, count) in &report.events {
        println!("  {kind}: {count}");
    }

    if !report.sessions.is_empty() {
        println!("\nSessions:");
        for session in &report.sessions {
            let startup = session
                .startup_time_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} startup={} watch={}ms QoE={:.1}",
                session.video_id, startup, session.watch_time_ms, session.qoe_score
            );
        }
    }

    Ok(())
}

/// Print the quality ladder of an HLS manifest
pub async fn probe(manifest_url: &str, format: &str) -> anyhow::Result<()> {
    let url = Url::parse(manifest_url)?;
    let loader = HlsManifestLoader::new()?;
    let levels = loader.load_levels(&url).await?;

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", output::to_json(&levels)),
        OutputFormat::Table => {
            println!("Quality ladder for {}:", manifest_url);
            println!("{}", output::level_table(&levels));
        }
        OutputFormat::Text => {
            println!("Quality ladder for {}:", manifest_url);
            for (i, level) in levels.iter().enumerate() {
                println!("  {}. {} - {}", i, level.label, output::format_bitrate(level.bitrate_bps));
            }
        }
    }

    if levels.is_empty() {
        println!("No variants found; the playlist is probably a media playlist");
    }
    Ok(())
}

/// Print the default config, or validate a file and print it resolved
pub fn config(validate: Option<PathBuf>, format: &str) -> anyhow::Result<()> {
    let config = match validate {
        Some(path) => {
            let config = FlickConfig::load(&path)?;
            eprintln!("{}: valid", path.display());
            config
        }
        None => FlickConfig::default(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Table => println!("{}", output::settings_table(&output::flatten_settings(&config))),
        OutputFormat::Text => {
            for (key, value) in output::flatten_settings(&config) {
                println!("  {key} = {value}");
            }
        }
    }
    Ok(())
}
