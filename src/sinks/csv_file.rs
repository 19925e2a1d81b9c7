use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::SystemTime,
};

use futures::StreamExt;
use time::{macros::format_description, OffsetDateTime, UtcOffset};

use crate::{
    domain::{EnergyRow, PowerSample, MEASUREMENT_POWER, UOM_WATTS},
    pipeline::{CollectorError, Envelope, Sink},
};

pub const OUTPUT_HEADER: [&str; 7] = [
    "timestamp",
    "measurement",
    "value",
    "uom",
    "details",
    "kWh",
    "cumulative_kWh",
];

/// Append-or-create CSV sink for integrated energy rows.
///
/// The whole batch is collected before anything touches the filesystem: the
/// integration needs every sample of the window, and a failed fetch must not
/// leave a partial batch in the output. Any upstream error aborts the run
/// before the file is opened.
pub struct CsvEnergySink {
    path: PathBuf,
    details: String,
    dedup: bool,
}

impl CsvEnergySink {
    pub fn new<P: Into<PathBuf>>(path: P, details: impl Into<String>, dedup: bool) -> Self {
        Self {
            path: path.into(),
            details: details.into(),
            dedup,
        }
    }

    fn write_rows(&self, rows: &[EnergyRow]) -> Result<(), CollectorError> {
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                CollectorError::OutputWrite(format!(
                    "failed to open '{}': {e}",
                    self.path.display()
                ))
            })?;
        let mut wtr = csv::Writer::from_writer(file);

        if write_header {
            wtr.write_record(OUTPUT_HEADER).map_err(write_error)?;
        }
        for row in rows {
            let ts = format_ts(row.ts)?;
            let watts = row.watts.to_string();
            let kwh = row.kwh.to_string();
            let cumulative = row.cumulative_kwh.to_string();
            wtr.write_record([
                ts.as_str(),
                row.measurement,
                watts.as_str(),
                row.uom,
                row.details.as_str(),
                kwh.as_str(),
                cumulative.as_str(),
            ])
            .map_err(write_error)?;
        }
        wtr.flush()
            .map_err(|e| CollectorError::OutputWrite(format!("failed to flush output: {e}")))
    }
}

/// Converts a batch of power samples into energy rows.
///
/// Samples are sorted by timestamp (stable for ties) and each consecutive
/// pair contributes one row: the closing sample's power is held flat over
/// the gap, so the interval energy is `watts * delta_secs / 3_600_000` kWh.
/// The first chronological sample only opens the first interval and produces
/// no row of its own.
pub fn energy_rows(mut samples: Vec<PowerSample>, details: &str) -> Vec<EnergyRow> {
    samples.sort_by_key(|s| s.ts);

    let mut rows = Vec::with_capacity(samples.len().saturating_sub(1));
    let mut cumulative_kwh = 0.0;
    for pair in samples.windows(2) {
        let delta_secs = (pair[1].ts - pair[0].ts).as_seconds_f64();
        let kwh = pair[1].watts * delta_secs / 3_600_000.0;
        cumulative_kwh += kwh;
        rows.push(EnergyRow {
            ts: pair[1].ts.to_offset(UtcOffset::UTC),
            measurement: MEASUREMENT_POWER,
            watts: pair[1].watts,
            uom: UOM_WATTS,
            details: details.to_string(),
            kwh,
            cumulative_kwh,
        });
    }
    rows
}

fn format_ts(ts: OffsetDateTime) -> Result<String, CollectorError> {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    ts.to_offset(UtcOffset::UTC)
        .format(&fmt)
        .map_err(|e| CollectorError::OutputWrite(format!("failed to format timestamp: {e}")))
}

fn write_error(e: csv::Error) -> CollectorError {
    CollectorError::OutputWrite(format!("failed to write output row: {e}"))
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u64;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Identity of a written row for dedup purposes: timestamp plus details.
fn row_key(timestamp: &str, details: &str) -> String {
    let mut h = blake3::Hasher::new();
    hash_str(&mut h, timestamp);
    hash_str(&mut h, details);
    h.finalize().to_hex().to_string()
}

fn existing_row_keys(path: &Path) -> Result<HashSet<String>, CollectorError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let file = File::open(path).map_err(|e| {
        CollectorError::OutputWrite(format!(
            "failed to open '{}' for dedup scan: {e}",
            path.display()
        ))
    })?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr
        .headers()
        .map_err(|e| CollectorError::OutputWrite(format!("failed to read output headers: {e}")))?
        .clone();
    let col = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            CollectorError::OutputWrite(format!("existing output file lacks '{name}' column"))
        })
    };
    let ts_idx = col("timestamp")?;
    let details_idx = col("details")?;

    let mut keys = HashSet::new();
    for result in rdr.records() {
        let record = result.map_err(|e| {
            CollectorError::OutputWrite(format!("failed to read existing output row: {e}"))
        })?;
        if let (Some(ts), Some(details)) = (record.get(ts_idx), record.get(details_idx)) {
            keys.insert(row_key(ts, details));
        }
    }
    Ok(keys)
}

#[async_trait::async_trait]
impl Sink<PowerSample> for CsvEnergySink {
    async fn run<S>(&self, mut input: S) -> Result<(), CollectorError>
    where
        S: futures::Stream<Item = Result<Envelope<PowerSample>, CollectorError>>
            + Send
            + Unpin
            + 'static,
    {
        let mut batch: Vec<Envelope<PowerSample>> = Vec::new();
        while let Some(item) = input.next().await {
            batch.push(item?);
        }

        let first_received = batch.iter().map(|e| e.received_at).min();
        let sample_count = batch.len();
        let samples: Vec<PowerSample> = batch.into_iter().map(|e| e.payload).collect();
        let mut rows = energy_rows(samples, &self.details);

        if self.dedup {
            let existing = existing_row_keys(&self.path)?;
            let mut kept = Vec::with_capacity(rows.len());
            let mut skipped: u64 = 0;
            for row in rows {
                let ts = format_ts(row.ts)?;
                if existing.contains(&row_key(&ts, &row.details)) {
                    skipped += 1;
                } else {
                    kept.push(row);
                }
            }
            if skipped > 0 {
                metrics::counter!("energy_rows_dedup_skipped_total").increment(skipped);
                tracing::info!(skipped, "rows already present in output, skipped");
            }
            rows = kept;
        }

        self.write_rows(&rows)?;

        metrics::counter!("energy_rows_written_total").increment(rows.len() as u64);
        if let Some(min_received) = first_received {
            if let Ok(dur) = SystemTime::now().duration_since(min_received) {
                metrics::histogram!("backfill_fetch_to_write_latency_seconds")
                    .record(dur.as_secs_f64());
            }
        }
        tracing::info!(
            samples = sample_count,
            rows = rows.len(),
            path = %self.path.display(),
            "energy rows appended"
        );
        Ok(())
    }
}
