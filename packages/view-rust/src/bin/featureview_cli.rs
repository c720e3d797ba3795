//! Runs one read against a view described by a JSON fixture.
//!
//! # Usage
//!
//! ```bash
//! # All features, merged across layers
//! featureview-cli roads.json
//!
//! # By id, no backfill round by construction
//! featureview-cli roads.json --id r1 --id r2
//!
//! # Spatial and property filters
//! featureview-cli roads.json --bbox 0,0,10,10 --property class=primary
//! ```
//!
//! Log output is controlled with `RUST_LOG`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use featureview::fixture::ViewFixture;
use featureview::view::IgnoreMissingResolver;
use featureview::{MergeByStoragePriority, ObligatoryLayersResolver};
use featureview_core::{BBox, POp, PRef, ReadFeatures, ReadRequest, RequestContext, SOp, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "featureview-cli")]
#[command(about = "Query a feature view built from a JSON fixture", long_about = None)]
struct Cli {
    /// Fixture describing the layers and their features
    fixture: PathBuf,

    /// Feature id to read (repeatable)
    #[arg(long = "id")]
    ids: Vec<String>,

    /// Bounding box as west,south,east,north
    #[arg(long, value_parser = parse_bbox)]
    bbox: Option<BBox>,

    /// Property equality filter as key=value; dots in the key address
    /// nested properties (repeatable)
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(Vec<String>, Value)>,

    /// Maximum number of features per layer
    #[arg(long)]
    limit: Option<usize>,

    /// Do not search obligatory layers for missing features
    #[arg(long)]
    no_backfill: bool,

    /// Application id reported to the storages
    #[arg(long, env = "FEATUREVIEW_APP_ID", default_value = "featureview-cli")]
    app_id: String,
}

fn parse_bbox(raw: &str) -> Result<BBox, String> {
    let coords = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    match coords.as_slice() {
        &[west, south, east, north] => Ok(BBox::new(west, south, east, north)),
        _ => Err(format!("expected 4 coordinates, got {}", coords.len())),
    }
}

fn parse_property(raw: &str) -> Result<(Vec<String>, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw}"))?;
    if key.is_empty() {
        return Err("empty property key".to_string());
    }
    let path = key.split('.').map(str::to_string).collect();
    // Numbers and booleans are typed; anything else is a string.
    let value = serde_json::from_str::<Value>(value)
        .ok()
        .filter(|v| !matches!(v, Value::Array(_) | Value::Map(_)))
        .unwrap_or_else(|| Value::String(value.to_string()));
    Ok((path, value))
}

fn build_request(cli: &Cli) -> ReadFeatures {
    let mut filters = Vec::new();
    if !cli.ids.is_empty() {
        filters.push(POp::or(
            cli.ids
                .iter()
                .map(|id| POp::eq(PRef::Id, id.as_str()))
                .collect(),
        ));
    }
    for (path, value) in &cli.properties {
        filters.push(POp::eq(PRef::Property(path.clone()), value.clone()));
    }

    let mut request = ReadFeatures::new();
    request = match filters.len() {
        0 => request,
        1 => request.with_property_op(filters.remove(0)),
        _ => request.with_property_op(POp::and(filters)),
    };
    if let Some(bbox) = cli.bbox {
        request = request.with_spatial_op(SOp::Intersects(bbox));
    }
    if let Some(limit) = cli.limit {
        request = request.with_limit(limit);
    }
    request
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let fixture = ViewFixture::load(&cli.fixture)?;
    let view = fixture.build()?;
    info!(view = %view.layers().name(), layers = view.layers().len(), "view loaded");

    let ctx = RequestContext::new(cli.app_id.clone(), uuid::Uuid::new_v4().to_string());
    let session = view.new_read_session(&ctx, false).await?;
    let request = ReadRequest::from(build_request(&cli));
    let result = if cli.no_backfill {
        session
            .execute_with(&request, &MergeByStoragePriority, &IgnoreMissingResolver)
            .await
    } else {
        session
            .execute_with(
                &request,
                &MergeByStoragePriority,
                &ObligatoryLayersResolver::top_layer(),
            )
            .await
    };
    let close = session.close().await;
    let rows = result?.into_rows()?;
    close?;

    let output = serde_json::to_string_pretty(&rows).context("failed to encode result")?;
    println!("{output}");
    Ok(())
}
