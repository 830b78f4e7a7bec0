//! RecServe Replay - Main Entry Point
//!
//! Loads the configured models with the in-process reference collaborators,
//! replays request batches from a JSON file and prints the results.
//!
//! Usage: `recserve-replay [settings.yaml] [replay.json]`

use anyhow::{bail, Context};
use recserve_backend::request::RequestId;
use recserve_backend::{
    Backend, ExecutionReport, HostAllocator, InferenceRequest, InputTensor, ModelInstance,
    ReferenceCollaborators,
};
use recserve_common::{BackendSettings, KeyWidth, ModelDeclaration, METRICS};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A replay file: batches to execute, in order per instance
#[derive(Debug, Deserialize)]
struct ReplayFile {
    batches: Vec<ReplayBatch>,
}

#[derive(Debug, Deserialize)]
struct ReplayBatch {
    model: String,

    #[serde(default)]
    device_id: i32,

    requests: Vec<ReplayRequest>,
}

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    #[serde(default)]
    id: Option<RequestId>,

    dense: Vec<f32>,
    keys: Vec<i64>,
    row_offsets: Vec<i32>,

    /// Set to false to validate without scoring
    #[serde(default = "default_true")]
    score: bool,
}

fn default_true() -> bool {
    true
}

impl ReplayRequest {
    fn into_request(self, key_width: KeyWidth) -> anyhow::Result<InferenceRequest> {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let keys = match key_width {
            KeyWidth::Bits32 => {
                let keys = self
                    .keys
                    .iter()
                    .map(|&k| u32::try_from(k))
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("request {} has keys outside 32 bits", id))?;
                InputTensor::from_u32("CATCOLUMN", vec![keys.len() as i64], &keys)
            }
            KeyWidth::Bits64 => {
                InputTensor::from_i64("CATCOLUMN", vec![self.keys.len() as i64], &self.keys)
            }
        };

        let request = InferenceRequest::new(
            id,
            vec![
                InputTensor::from_f32("DES", vec![self.dense.len() as i64], &self.dense),
                keys,
                InputTensor::from_i32(
                    "ROWINDEX",
                    vec![self.row_offsets.len() as i64],
                    &self.row_offsets,
                ),
            ],
        );
        Ok(if self.score {
            request
        } else {
            request.without_outputs()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let settings_path = args
        .next()
        .or_else(|| std::env::var("RECSERVE_SETTINGS").ok())
        .unwrap_or_else(|| "configs/backend.yaml".to_string());
    let replay_path = args
        .next()
        .or_else(|| std::env::var("RECSERVE_REPLAY").ok())
        .unwrap_or_else(|| "configs/replay.json".to_string());

    let settings = BackendSettings::from_file(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path))?;

    // Initialize logging; RUST_LOG wins over the settings filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RecServe replay with settings from {}", settings_path);
    info!(
        "Settings loaded: {} models, {} keys",
        settings.models.len(),
        settings.key_width()
    );

    let hosted = settings.models.clone();
    let backend = Arc::new(Backend::initialize(
        settings,
        ReferenceCollaborators::new(),
        Arc::new(HostAllocator::new()),
    )?);

    for model in &hosted {
        let Some(path) = &model.declaration else {
            warn!("Model {} has no declaration file, skipping", model.name);
            continue;
        };
        let declaration = ModelDeclaration::from_file(path)?;
        backend
            .load_model(&declaration)
            .with_context(|| format!("loading model {}", model.name))?;
        for &device_id in &model.device_ids {
            backend
                .load_instance(&model.name, device_id)
                .with_context(|| format!("loading {} on device {}", model.name, device_id))?;
        }
    }
    info!("Loaded instances: {:?}", backend.instance_names());

    let content = tokio::fs::read_to_string(&replay_path)
        .await
        .with_context(|| format!("reading replay file {}", replay_path))?;
    let replay: ReplayFile = serde_json::from_str(&content)?;

    // Batches of one instance run in order; instances run side by side
    let mut per_instance: BTreeMap<String, Vec<(usize, Vec<InferenceRequest>)>> = BTreeMap::new();
    for (index, batch) in replay.batches.into_iter().enumerate() {
        let instance_name = format!("{}_{}", batch.model, batch.device_id);
        let Some(instance) = backend.instance(&instance_name) else {
            bail!("batch {} targets unknown instance {}", index, instance_name);
        };
        let key_width = instance.key_width();
        let requests = batch
            .requests
            .into_iter()
            .map(|r| r.into_request(key_width))
            .collect::<anyhow::Result<Vec<_>>>()?;
        per_instance
            .entry(instance_name)
            .or_default()
            .push((index, requests));
    }

    let mut handles = Vec::new();
    for (instance_name, batches) in per_instance {
        let backend = backend.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let instance = backend.instance(&instance_name);
            batches
                .into_iter()
                .filter_map(|(index, requests)| {
                    let instance: &ModelInstance = instance.as_deref()?;
                    Some((index, instance_name.clone(), instance.execute(&requests)))
                })
                .collect::<Vec<_>>()
        }));
    }

    let replay_all = async {
        let mut reports = Vec::new();
        for handle in handles {
            reports.extend(handle.await?);
        }
        reports.sort_by_key(|(index, _, _)| *index);
        anyhow::Ok(reports)
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping replay");
        }
        result = replay_all => {
            match result {
                Ok(reports) => {
                    for (index, instance_name, report) in &reports {
                        print_report(*index, instance_name, report)?;
                    }
                }
                Err(e) => error!("Replay failed: {}", e),
            }
        }
    }

    println!("{}", METRICS.gather());
    info!("RecServe replay complete");
    Ok(())
}

fn print_report(index: usize, instance_name: &str, report: &ExecutionReport) -> anyhow::Result<()> {
    info!(
        "Batch {} on {}: {} requests, {} failed, total batch size {}, {:.3} ms",
        index,
        instance_name,
        report.batch.request_count,
        report.batch.failed_count,
        report.batch.total_batch_size,
        report.batch.max_end_ns.saturating_sub(report.batch.min_start_ns) as f64 / 1e6
    );
    println!("{}", serde_json::to_string_pretty(&report.responses)?);
    Ok(())
}
