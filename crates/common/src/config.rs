use serde::{Deserialize, Serialize};

/// Transmission compression codec negotiated per query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionCompression {
    /// Never compress exchange payloads.
    None,
    /// LZ4 block compression (default).
    Lz4,
    /// Zstd stream compression.
    Zstd,
}

impl Default for TransmissionCompression {
    fn default() -> Self {
        Self::Lz4
    }
}

/// Pre-aggregation behavior for the partial stage of distributed aggregation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamingPreaggPolicy {
    /// Sample the first chunks; pass rows through when local reduction is poor.
    Auto,
    /// Always aggregate locally before forwarding.
    ForcePreagg,
    /// Always pass rows through unaggregated.
    ForceStreaming,
}

impl Default for StreamingPreaggPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

/// Global engine configuration shared by the driver runtime and the exchange layer.
///
/// One instance lives on the execution environment; fragments copy the query
/// options they are allowed to override (compression, deadline) into their
/// runtime state at prepare time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target rows per chunk produced by sources and rebuilt by operators.
    pub chunk_size: usize,
    /// Worker threads servicing the driver ready-queue.
    pub driver_worker_threads: usize,
    /// Time slice after which a running driver yields back to the queue, in milliseconds.
    pub driver_time_slice_ms: u64,

    /// Byte threshold at which an exchange channel flushes its pending request.
    pub exchange_transmit_bytes: usize,
    /// Compression codec applied to exchange chunk payloads.
    #[serde(default)]
    pub transmission_compression: TransmissionCompression,
    /// Minimum uncompressed/compressed ratio for a compressed payload to be accepted.
    #[serde(default = "default_compress_ratio")]
    pub transmission_min_compress_ratio: f64,
    /// Soft cap on buffered chunks in one exchange receiver queue.
    #[serde(default = "default_receiver_queue_chunks")]
    pub exchange_receiver_queue_chunks: usize,

    /// Maximum distinct build rows for which a hash join synthesizes IN filters.
    #[serde(default = "default_runtime_filter_rows")]
    pub runtime_filter_max_build_rows: usize,
    /// Pre-aggregation policy for partial aggregation stages.
    #[serde(default)]
    pub streaming_preagg_policy: StreamingPreaggPolicy,
    /// Chunks sampled before the auto pre-aggregation policy decides.
    #[serde(default = "default_preagg_sample_chunks")]
    pub streaming_preagg_sample_chunks: usize,
    /// Groups-per-row ratio above which auto pre-aggregation switches to pass-through.
    #[serde(default = "default_preagg_ratio")]
    pub streaming_preagg_max_ratio: f64,

    /// Per-fragment memory limit in bytes.
    pub fragment_mem_limit_bytes: usize,
    /// Query deadline in milliseconds; 0 disables the deadline.
    #[serde(default)]
    pub query_timeout_ms: u64,
}

fn default_compress_ratio() -> f64 {
    1.1
}

fn default_receiver_queue_chunks() -> usize {
    32
}

fn default_runtime_filter_rows() -> usize {
    1024
}

fn default_preagg_sample_chunks() -> usize {
    8
}

fn default_preagg_ratio() -> f64 {
    0.9
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            driver_worker_threads: 4,
            driver_time_slice_ms: 100,
            exchange_transmit_bytes: 1024 * 1024, // 1MB
            transmission_compression: TransmissionCompression::default(),
            transmission_min_compress_ratio: default_compress_ratio(),
            exchange_receiver_queue_chunks: default_receiver_queue_chunks(),
            runtime_filter_max_build_rows: default_runtime_filter_rows(),
            streaming_preagg_policy: StreamingPreaggPolicy::default(),
            streaming_preagg_sample_chunks: default_preagg_sample_chunks(),
            streaming_preagg_max_ratio: default_preagg_ratio(),
            fragment_mem_limit_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            query_timeout_ms: 0,
        }
    }
}
