use std::env;

use anyhow::{bail, Context};
use happyhour_places::{init_tracing, AppConfig, PlacePipeline, SubmissionLog};
use serde::Serialize;

const USAGE: &str = "\
usage: happyhour-places [action]

actions:
  places          print the assembled place list (default)
  refresh         rebuild the list and print build statistics
  status          print configuration and pipeline status
  purge-failures  drop failed geocode lookups so they are tried again
  submit <json>   append a payload to the submission log
  help            print this message

Each run starts a fresh pipeline, so `places` always reads the sources.
The geocode cache persists between runs; the PLACE_CACHE_TTL_SECS list
cache only helps processes that keep one PlacePipeline alive.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Vec<String> = env::args().collect();
    let config = AppConfig::from_env();

    match args.get(1).map(String::as_str).unwrap_or("places") {
        "places" => {
            let pipeline = PlacePipeline::from_config(&config)?;
            let places = pipeline.places().await?;
            print_json(places.as_slice())
        }
        "refresh" => {
            let pipeline = PlacePipeline::from_config(&config)?;
            pipeline.refresh().await?;
            print_json(&pipeline.status())
        }
        "status" => {
            let pipeline = PlacePipeline::from_config(&config)?;
            print_json(&serde_json::json!({
                "config": config.public_profile(),
                "pipeline": pipeline.status(),
            }))
        }
        "purge-failures" => {
            let pipeline = PlacePipeline::from_config(&config)?;
            let removed = pipeline.resolver().cache().purge_failures();
            print_json(&serde_json::json!({ "removed": removed }))
        }
        "help" | "-h" | "--help" => {
            println!("{USAGE}");
            Ok(())
        }
        "submit" => {
            let raw = args
                .get(2)
                .context("usage: happyhour-places submit '<json payload>'")?;
            let payload: serde_json::Value =
                serde_json::from_str(raw).context("submission payload is not valid JSON")?;
            let log = SubmissionLog::from_config(&config)?;
            log.append(&payload)?;
            print_json(&serde_json::json!({ "stored": log.path().display().to_string() }))
        }
        other => bail!("unknown action `{other}`\n\n{USAGE}"),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
