//! CSV export of per-instance run summaries.
//!
//! One row per instance per run: packets, malformed, dropped, written, per-mode
//! counts, packet rate and input stats. Appends to the file and writes the
//! header only when the file is new, so several runs accumulate in one place.

use std::{
    fs::{OpenOptions, create_dir_all},
    io::Write,
    path::Path,
};

use log::info;

use crate::error::Result;
use crate::utils::metrics::{InstanceStats, calculate_stats};

const HEADER: &str = "instance,packets,malformed,dropped,written,pid_samples,step_samples,deadband_samples,packet_rate_hz,input_min,input_max,input_mean\n";

pub fn summary_row(instance: &str, s: &InstanceStats) -> String {
    let (min, max, mean) = match calculate_stats(&s.inputs) {
        Some(st) => (st.min, st.max, st.mean),
        None => (0.0, 0.0, 0.0),
    };
    format!(
        "{},{},{},{},{},{},{},{},{:.2},{:.3},{:.3},{:.3}\n",
        instance,
        s.packets,
        s.malformed,
        s.dropped,
        s.written,
        s.pid_samples,
        s.step_samples,
        s.deadband_samples,
        s.packet_rate(),
        min,
        max,
        mean
    )
}

/// Appends one row per instance to `csv_path`, creating it with a header if needed.
pub fn export_summary_csv(csv_path: &Path, rows: &[(String, InstanceStats)]) -> Result<()> {
    if let Some(dir) = csv_path.parent() {
        create_dir_all(dir)?;
    }
    let file_exists = csv_path.exists();

    let mut file = OpenOptions::new().create(true).append(true).open(csv_path)?;
    if !file_exists {
        file.write_all(HEADER.as_bytes())?;
    }
    for (instance, stats) in rows {
        file.write_all(summary_row(instance, stats).as_bytes())?;
    }
    file.flush()?;
    info!("Summary exported to: {}", csv_path.display());
    Ok(())
}
