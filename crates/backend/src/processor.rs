//! Request batch execution
//!
//! Each request in a batch moves through `Validate -> Stage -> Execute ->
//! Emit -> Done`. A failure in any phase moves that request to `Failed`,
//! answers it with an error response and leaves its siblings untouched.
//!
//! With a single buffer set the batch runs sequentially on the calling
//! thread. With more, requests run on the rayon pool, each holding its own
//! buffer set for the duration of its stage, execute and emit phases.

use crate::collaborators::PredictBatch;
use crate::instance::{BufferSet, InstanceContext, ModelInstance};
use crate::key::EmbeddingKey;
use crate::request::{InferenceRequest, InferenceResponse, InputTensor, OutputTensor, ResponseError};
use rayon::prelude::*;
use recserve_common::metrics::LatencyTimer;
use recserve_common::{DataType, RecServeError, Result, METRICS};
use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Processing phase of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Validate,
    Stage,
    Execute,
    Emit,
    Done,
    Failed,
}

/// Statistics of one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    /// Request identifier
    pub request_id: String,

    /// Whether the request reached `Done`
    pub success: bool,

    /// Terminal phase, `Done` or `Failed`
    pub phase: RequestPhase,

    /// Phase the request failed in, if it failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<RequestPhase>,

    /// Samples carried, once the dense input established it
    pub sample_count: Option<usize>,

    /// Start timestamp, ns since the epoch
    pub start_ns: u64,

    /// End timestamp, ns since the epoch
    pub end_ns: u64,
}

/// Aggregate statistics of one execute call
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    /// Number of requests
    pub request_count: usize,

    /// Requests that failed
    pub failed_count: usize,

    /// Sum of sample counts of every request whose sample count was
    /// established, oversized ones included, or one per such request when
    /// the model does not batch along the first dimension
    pub total_batch_size: usize,

    /// Earliest request start, ns since the epoch
    pub min_start_ns: u64,

    /// Latest end of a successful request, ns since the epoch; equals
    /// `min_start_ns` when nothing succeeded
    pub max_end_ns: u64,
}

/// Result of one execute call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Responses in request order
    pub responses: Vec<InferenceResponse>,

    /// Per-request statistics in request order
    pub request_stats: Vec<RequestStats>,

    /// Aggregate statistics
    pub batch: BatchStats,
}

/// Validated view of a request's inputs
struct ValidatedRequest<'r> {
    sample_count: usize,
    dense: &'r InputTensor,
    keys: &'r InputTensor,
    row_offsets: &'r InputTensor,
    key_count: usize,
    row_offset_count: usize,
    output_name: Option<&'r str>,
}

/// What a completed request produced
struct Completion {
    buffer_slot: Option<usize>,
    output: Option<OutputTensor>,
}

/// Drives a batch of requests through one instance
pub struct RequestBatchProcessor<'a, K: EmbeddingKey> {
    instance: &'a InstanceContext<K>,
}

impl<'a, K: EmbeddingKey> RequestBatchProcessor<'a, K> {
    /// Create a processor bound to `instance`
    pub fn new(instance: &'a InstanceContext<K>) -> Self {
        Self { instance }
    }

    /// Process every request and report per-request and batch results
    pub fn execute(&self, requests: &[InferenceRequest]) -> ExecutionReport {
        METRICS.instance.executions_total.inc();
        let started = Instant::now();

        let parallel = self.instance.pool().len() > 1 && requests.len() > 1;
        debug!(
            "Executing {} requests on instance {} ({})",
            requests.len(),
            self.instance.name(),
            if parallel { "pooled" } else { "sequential" }
        );

        let results: Vec<(InferenceResponse, RequestStats)> = if parallel {
            requests.par_iter().map(|r| self.process(r)).collect()
        } else {
            requests.iter().map(|r| self.process(r)).collect()
        };

        let (responses, request_stats): (Vec<_>, Vec<_>) = results.into_iter().unzip();
        let batch = self.summarize(&request_stats);

        METRICS
            .instance
            .execution_duration
            .observe(started.elapsed().as_secs_f64());
        debug!(
            "Batch on {} finished: {} requests, {} failed, total batch size {}, {:?}",
            self.instance.name(),
            batch.request_count,
            batch.failed_count,
            batch.total_batch_size,
            started.elapsed()
        );

        ExecutionReport {
            responses,
            request_stats,
            batch,
        }
    }

    fn summarize(&self, stats: &[RequestStats]) -> BatchStats {
        let batching = self.instance.config().supports_first_dim_batching;
        let min_start_ns = stats.iter().map(|s| s.start_ns).min().unwrap_or(0);
        BatchStats {
            request_count: stats.len(),
            failed_count: stats.iter().filter(|s| !s.success).count(),
            total_batch_size: stats
                .iter()
                .filter_map(|s| s.sample_count)
                .map(|samples| if batching { samples } else { 1 })
                .sum(),
            min_start_ns,
            max_end_ns: stats
                .iter()
                .filter(|s| s.success)
                .map(|s| s.end_ns)
                .max()
                .unwrap_or(min_start_ns),
        }
    }

    fn process(&self, request: &InferenceRequest) -> (InferenceResponse, RequestStats) {
        METRICS.requests.requests_total.inc();
        let start_ns = now_ns();

        let mut phase = RequestPhase::Validate;
        let mut sample_count = None;
        let result = self.run(request, &mut phase, &mut sample_count);
        let end_ns = now_ns();

        let mut response = InferenceResponse {
            request_id: request.id.clone(),
            ..Default::default()
        };

        let failed_in = match result {
            Ok(completion) => {
                METRICS.requests.requests_success.inc();
                let samples = sample_count.unwrap_or(0);
                METRICS.requests.samples_per_request.observe(samples as f64);

                response
                    .parameters
                    .insert("sample_count".to_string(), samples.into());
                if let Some(slot) = completion.buffer_slot {
                    response
                        .parameters
                        .insert("buffer_slot".to_string(), slot.into());
                }
                response
                    .parameters
                    .insert("key_width".to_string(), K::WIDTH.bits().into());
                response.outputs.extend(completion.output);
                None
            }
            Err(err) => {
                let kind = err.kind();
                METRICS
                    .requests
                    .requests_failed
                    .with_label_values(&[kind.as_str()])
                    .inc();
                warn!(
                    "Request {} on {} failed during {:?}: {}",
                    request.id,
                    self.instance.name(),
                    phase,
                    err
                );
                response.error = Some(ResponseError::from(&err));
                Some(phase)
            }
        };

        let stats = RequestStats {
            request_id: request.id.clone(),
            success: failed_in.is_none(),
            phase: if failed_in.is_none() {
                RequestPhase::Done
            } else {
                RequestPhase::Failed
            },
            failed_in,
            sample_count,
            start_ns,
            end_ns,
        };
        (response, stats)
    }

    fn run(
        &self,
        request: &InferenceRequest,
        phase: &mut RequestPhase,
        sample_count: &mut Option<usize>,
    ) -> Result<Completion> {
        let validated = self.validate(request, sample_count)?;

        let Some(output_name) = validated.output_name else {
            debug!("Request {} asked for no output, skipping scoring", request.id);
            *phase = RequestPhase::Done;
            return Ok(Completion {
                buffer_slot: None,
                output: None,
            });
        };

        *phase = RequestPhase::Stage;
        let mut slot = self.instance.pool().acquire()?;
        let buffer_slot = slot.index();
        let buffers: &mut BufferSet<K> = &mut slot;
        buffers.dense.copy_from_bytes(&validated.dense.data)?;
        buffers.keys.copy_from_bytes(&validated.keys.data)?;
        buffers.row_offsets.copy_from_bytes(&validated.row_offsets.data)?;

        *phase = RequestPhase::Execute;
        let samples = validated.sample_count;
        let config = self.instance.config();
        let batch = PredictBatch {
            dense: buffers.dense.as_slice(samples * config.dense_feature_count)?,
            keys: buffers.keys.as_slice(validated.key_count)?,
            row_offsets: buffers.row_offsets.as_slice(validated.row_offset_count)?,
            sample_count: samples,
        };
        let predictions = buffers.predictions.as_mut_slice(samples)?;
        METRICS
            .instance
            .predict_duration
            .time(|| self.instance.engine().predict(batch, predictions))?;

        *phase = RequestPhase::Emit;
        let mut scores = vec![0.0f32; samples];
        buffers.predictions.copy_to_slice(&mut scores)?;
        drop(slot);

        *phase = RequestPhase::Done;
        Ok(Completion {
            buffer_slot: Some(buffer_slot),
            output: Some(OutputTensor {
                name: output_name.to_string(),
                data_type: DataType::Fp32,
                shape: vec![samples as i64],
                data: scores,
            }),
        })
    }

    /// Check a request against the instance; `counted` receives the sample
    /// count as soon as it is known, even if a later check fails
    fn validate<'r>(
        &self,
        request: &'r InferenceRequest,
        counted: &mut Option<usize>,
    ) -> Result<ValidatedRequest<'r>> {
        let config = self.instance.config();

        let [dense, keys, row_offsets] = request.inputs.as_slice() else {
            return Err(RecServeError::invalid_input(format!(
                "expected 3 inputs (dense, categorical, row offsets), got {}",
                request.inputs.len()
            )));
        };

        if dense.data_type != DataType::Fp32 {
            return Err(RecServeError::invalid_input(format!(
                "dense input {} must be {}, got {}",
                dense.name,
                DataType::Fp32,
                dense.data_type
            )));
        }
        if !K::accepts(keys.data_type) {
            return Err(RecServeError::invalid_input(format!(
                "categorical input {} has datatype {}, model uses {} keys",
                keys.name,
                keys.data_type,
                K::WIDTH
            )));
        }
        if row_offsets.data_type != DataType::Int32 {
            return Err(RecServeError::invalid_input(format!(
                "row offset input {} must be {}, got {}",
                row_offsets.name,
                DataType::Int32,
                row_offsets.data_type
            )));
        }

        let dense_count = element_count(dense)?;
        // Overflow is judged on whole samples, before any ragged tail
        let sample_count = dense_count / config.dense_feature_count;
        if sample_count > config.max_batch_size {
            *counted = Some(sample_count);
            return Err(RecServeError::batch_overflow(
                sample_count,
                config.max_batch_size,
            ));
        }
        if dense_count % config.dense_feature_count != 0 {
            return Err(RecServeError::invalid_input(format!(
                "{} dense values do not divide into samples of {} features",
                dense_count, config.dense_feature_count
            )));
        }
        if sample_count == 0 {
            return Err(RecServeError::invalid_input("request carries no samples"));
        }
        *counted = Some(sample_count);

        let key_count = element_count(keys)?;
        if key_count > config.categorical_capacity() {
            return Err(RecServeError::invalid_input(format!(
                "{} categorical keys exceed the capacity of {}",
                key_count,
                config.categorical_capacity()
            )));
        }

        let row_offset_count = element_count(row_offsets)?;
        let expected = sample_count * config.slot_count + 1;
        if row_offset_count != expected {
            return Err(RecServeError::invalid_input(format!(
                "expected {} row offsets for {} samples of {} slots, got {}",
                expected, sample_count, config.slot_count, row_offset_count
            )));
        }

        let output_name = match request.requested_outputs.as_slice() {
            [] => None,
            [name] => Some(name.as_str()),
            names => {
                return Err(RecServeError::invalid_input(format!(
                    "model has a single output, {} were requested",
                    names.len()
                )))
            }
        };

        Ok(ValidatedRequest {
            sample_count,
            dense,
            keys,
            row_offsets,
            key_count,
            row_offset_count,
            output_name,
        })
    }
}

impl ModelInstance {
    /// Execute a request batch on this instance
    pub fn execute(&self, requests: &[InferenceRequest]) -> ExecutionReport {
        match self {
            ModelInstance::Int32(ctx) => RequestBatchProcessor::new(ctx).execute(requests),
            ModelInstance::Int64(ctx) => RequestBatchProcessor::new(ctx).execute(requests),
        }
    }
}

fn element_count(tensor: &InputTensor) -> Result<usize> {
    tensor.element_count().ok_or_else(|| {
        RecServeError::invalid_input(format!(
            "input {} holds {} bytes, not a whole number of {} elements",
            tensor.name,
            tensor.byte_size(),
            tensor.data_type
        ))
    })
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
