//! Glance application binary - composition root.
//!
//! Ties together all Glance crates into a single executable:
//! 1. Load configuration from TOML and apply CLI overrides
//! 2. Open the history database and load the gallery artifacts
//! 3. Build the embedder (reference or accelerated backend)
//! 4. Dispatch the requested subcommand

mod cli;

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use glance_core::config::{expand_home, GlanceConfig};
use glance_core::error::GlanceError;
use glance_gallery::{BuildOptions, GalleryBuilder, GalleryIndex, GallerySearcher};
use glance_query::{
    MemoryKvStore, QueryOrchestrator, QueryServices, SearchRequest, TaskState, WaitOutcome,
};
use glance_storage::{Database, RecordStore, SqliteRecordStore};
use glance_vision::ImageEmbedder;

use cli::{CliArgs, Command};

/// Interval between status polls once a search outlives the synchronous wait.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn init_tracing(cli_level: Option<&str>, config_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_records(config: &GlanceConfig) -> Result<Arc<SqliteRecordStore>, GlanceError> {
    let db = Database::open(&config.storage)?;
    Ok(Arc::new(SqliteRecordStore::new(Arc::new(db))))
}

fn load_searcher(config: &GlanceConfig) -> GallerySearcher {
    let index = GalleryIndex::load(&config.gallery);
    if let Some(err) = index.last_error() {
        tracing::warn!(error = %err, "Gallery loaded with errors");
    }
    GallerySearcher::new(Arc::new(index), &config.gallery)
}

async fn run_search(
    config: &GlanceConfig,
    image: &Path,
    top_k: Option<usize>,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let bytes = std::fs::read(image)?;
    let filename = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "query".to_string());

    let searcher = Arc::new(load_searcher(config));
    if searcher.index().is_empty() {
        tracing::warn!("Gallery is empty; searches will return no results");
    }
    let services = QueryServices {
        embedder: Arc::new(ImageEmbedder::new(config.model.clone())),
        searcher,
        records: open_records(config)?,
        kv: Arc::new(MemoryKvStore::new(config.query.cache_capacity)),
    };
    let orchestrator = QueryOrchestrator::new(services, config.query.clone(), config.quality);
    let limit = orchestrator.clamp_top_k(top_k);

    let handle = orchestrator.submit(SearchRequest {
        image: bytes,
        filename: filename.clone(),
        top_k,
    })?;
    let request_id = handle.request_id;
    let wait = Duration::from_millis(config.query.sync_wait_ms);
    if let WaitOutcome::Detached(_) = handle.wait(wait).await {
        tracing::info!(request_id, "Search still running, polling");
        while !orchestrator.status(request_id)?.state.is_terminal() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    let status = orchestrator.status(request_id)?;
    let (items, stats) = orchestrator.results(request_id, limit)?;
    orchestrator.shutdown().await;

    if status.state == TaskState::Error {
        let message = status.error.unwrap_or_default();
        if json {
            println!("{}", json!({ "request_id": request_id, "status": status_json(&message) }));
        }
        return Err(GlanceError::Query(message).into());
    }

    if json {
        let out = json!({
            "request_id": request_id,
            "status": TaskState::Done,
            "results": items,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "Query #{request_id} ({filename}): {} results, best {}, avg {}",
        stats.total,
        fmt_score(stats.best),
        fmt_score(stats.avg)
    );
    for item in &items {
        println!("{:>4}  {:.4}  {:<6}  {}", item.rank, item.score, item.quality, item.url);
    }
    Ok(())
}

fn status_json(message: &str) -> serde_json::Value {
    json!({ "state": TaskState::Error, "error": message })
}

fn fmt_score(score: Option<f32>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{s:.4}"))
}

fn run_build_gallery(
    config: &GlanceConfig,
    dir: &Path,
    max_images: Option<usize>,
    no_resume: bool,
) -> Result<(), Box<dyn Error>> {
    let embedder = ImageEmbedder::new(config.model.clone());
    let kind = embedder.warmup(false)?;
    tracing::info!(backend = %kind, "Embedder ready");

    let options = BuildOptions {
        max_images: max_images.unwrap_or(0),
        resume: !no_resume,
        ..BuildOptions::default()
    };
    let features = expand_home(&config.gallery.features_path);
    let index = expand_home(&config.gallery.index_path);
    let report = GalleryBuilder::new(&embedder, options).build(dir, &features, &index)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_history(config: &GlanceConfig, limit: Option<usize>, json: bool) -> Result<(), Box<dyn Error>> {
    let records = open_records(config)?;
    let summaries = records.recent_records(limit.unwrap_or(config.storage.history_limit))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No queries yet.");
    }
    for s in &summaries {
        println!(
            "#{:<6} {}  {:>3} results  best {}  {}",
            s.id,
            s.created_at.format("%Y-%m-%d %H:%M:%S"),
            s.result_count,
            fmt_score(s.best_score),
            s.filename
        );
    }
    Ok(())
}

fn run_show(config: &GlanceConfig, id: i64, json: bool) -> Result<(), Box<dyn Error>> {
    let records = open_records(config)?;
    let record = records.get_record(id)?.ok_or(GlanceError::NotFound(id))?;
    let items = records.list_items(id, config.query.max_top_k)?;

    if json {
        let out = json!({ "record": record, "results": items });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!(
        "Query #{} {} ({}, {} bytes, dim {})",
        record.id,
        record.created_at.to_rfc3339(),
        record.filename,
        record.query_image.len(),
        record.feat_dim.map_or_else(|| "-".to_string(), |d| d.to_string())
    );
    for item in &items {
        println!("{:>4}  {:.4}  {:<6}  {}", item.rank, item.score, item.quality, item.url);
    }
    Ok(())
}

fn run_info(config: &GlanceConfig, config_file: &Path, warmup: bool) -> Result<(), Box<dyn Error>> {
    let index = GalleryIndex::load(&config.gallery);
    let mut out = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "config_path": config_file.display().to_string(),
        "model": {
            "backend": config.model.backend,
            "weights_path": expand_home(&config.model.weights_path).display().to_string(),
            "onnx_model_path": config.model.onnx_model_path,
            "hidden_size": config.model.hidden_size,
            "image_size": config.model.image_size,
        },
        "gallery": {
            "rows": index.len(),
            "dimension": index.dimension(),
            "last_error": index.last_error(),
        },
        "storage": {
            "db_path": expand_home(&config.storage.db_path).display().to_string(),
        },
    });

    match Database::open(&config.storage).and_then(|db| db.schema_version()) {
        Ok(version) => out["storage"]["schema_version"] = json!(version),
        Err(e) => out["storage"]["error"] = json!(e.to_string()),
    }

    if warmup {
        let embedder = ImageEmbedder::new(config.model.clone());
        let serving = match embedder.warmup(true) {
            Ok(kind) => json!({ "backend": kind.as_str(), "fallback": embedder.backend_diagnostic() }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        out["warmup"] = serving;
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = GlanceConfig::load_or_default(&config_file);
    args.apply_overrides(&mut config);

    // Tracing.
    init_tracing(args.log_level.as_deref(), &config.general.log_level);
    tracing::debug!(
        path = %config_file.display(),
        exists = config_file.exists(),
        backend = %config.model.backend,
        "Configuration resolved"
    );

    match args.command {
        Command::Search { ref image, top_k, json } => run_search(&config, image, top_k, json).await,
        Command::BuildGallery {
            ref dir,
            max_images,
            no_resume,
        } => run_build_gallery(&config, dir, max_images, no_resume),
        Command::History { limit, json } => run_history(&config, limit, json),
        Command::Show { id, json } => run_show(&config, id, json),
        Command::Info { warmup } => run_info(&config, &config_file, warmup),
    }
}
