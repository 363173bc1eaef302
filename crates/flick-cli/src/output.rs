//! Output formatting for CLI

use flick_core::pool::SlotInfo;
use flick_core::QualityLevel;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Pretty JSON, falling back to an empty object
pub fn to_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Tabled)]
struct SlotRow {
    #[tabled(rename = "Slot")]
    slot: String,
    #[tabled(rename = "Index")]
    index: String,
    #[tabled(rename = "Video")]
    video: String,
    #[tabled(rename = "Tier")]
    tier: String,
    #[tabled(rename = "Slot State")]
    state: String,
    #[tabled(rename = "Player")]
    player: String,
}

impl From<&SlotInfo> for SlotRow {
    fn from(info: &SlotInfo) -> Self {
        let dash = || "-".to_string();
        Self {
            slot: info.slot.to_string(),
            index: info.index.map(|i| i.to_string()).unwrap_or_else(dash),
            video: info.video_id.as_ref().map(|v| v.to_string()).unwrap_or_else(dash),
            tier: info.tier.map(|t| t.to_string()).unwrap_or_else(dash),
            state: info.state.to_string(),
            player: info.player_state.to_string(),
        }
    }
}

pub fn slot_table(slots: &[SlotInfo]) -> String {
    let rows: Vec<SlotRow> = slots.iter().map(SlotRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

/// One line per slot, for plain text output
pub fn slot_lines(slots: &[SlotInfo]) -> String {
    slots
        .iter()
        .map(|info| {
            let row = SlotRow::from(info);
            format!(
                "  {} index={} video={} tier={} slot={} player={}",
                row.slot, row.index, row.video, row.tier, row.state, row.player
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Tabled)]
struct LevelRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Height")]
    height: u32,
    #[tabled(rename = "Bitrate")]
    bitrate: String,
}

pub fn level_table(levels: &[QualityLevel]) -> String {
    let rows: Vec<LevelRow> = levels
        .iter()
        .enumerate()
        .map(|(position, level)| LevelRow {
            position,
            label: level.label.clone(),
            height: level.height,
            bitrate: format_bitrate(level.bitrate_bps),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct SettingRow {
    #[tabled(rename = "Setting")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Flatten a serialized value into dotted `section.key` pairs
pub fn flatten_settings<T: Serialize>(data: &T) -> Vec<(String, String)> {
    fn walk(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, String)>) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(&path, child, out);
                }
            }
            other => out.push((prefix.to_string(), other.to_string())),
        }
    }

    let mut out = Vec::new();
    if let Ok(value) = serde_json::to_value(data) {
        walk("", &value, &mut out);
    }
    out
}

pub fn settings_table(settings: &[(String, String)]) -> String {
    let rows: Vec<SettingRow> = settings
        .iter()
        .map(|(key, value)| SettingRow {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn format_bitrate(bps: u64) -> String {
    if bps >= 1_000_000 {
        format!("{:.1} Mbps", bps as f64 / 1_000_000.0)
    } else {
        format!("{} kbps", bps / 1_000)
    }
}
