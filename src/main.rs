use anyhow::{bail, Result};
use plug_energy_collector::{
    api::{CloudClient, LogsQuery},
    config::AppConfig,
    domain::PowerSample,
    observability,
    pipeline::Pipeline,
    sinks::CsvEnergySink,
    sources::DeviceLogSource,
    transform,
};
use std::{env, sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        bail!("usage: plug-energy-collector [config_path]");
    }

    // Load configuration (COLLECTOR_CONFIG or a positional path override).
    let cfg = AppConfig::load(args.get(1).map(String::as_str))?;

    let (start, end) = cfg.run.window()?;
    let device_id = cfg.run.device_id()?.to_string();

    let mut client = CloudClient::new(&cfg.api)?;
    client.connect().await?;

    tracing::info!(
        device_id = %device_id,
        start = %start,
        end = %end,
        description = %cfg.run.description,
        "starting power log backfill"
    );
    let started = std::time::Instant::now();

    let source = DeviceLogSource::new(
        client,
        device_id,
        LogsQuery::for_window(start, end, cfg.api.page_size),
        cfg.api.max_pages,
        cfg.api.max_retries,
        Duration::from_millis(cfg.api.retry_backoff_ms),
    );
    let sink = CsvEnergySink::new(
        &cfg.run.output_path,
        cfg.run.description.clone(),
        cfg.run.dedup,
    );

    let pipeline: Pipeline<_, PowerSample, _> = Pipeline {
        source,
        transforms: vec![Arc::new(transform::PowerSampleValidation::default())],
        sink,
    };

    pipeline.run().await?;

    tracing::info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        "backfill complete"
    );
    Ok(())
}
