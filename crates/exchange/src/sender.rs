//! Exchange sink: per-destination channels with batching, compression and
//! at-most-one-in-flight transmission.
//!
//! Each channel accumulates serialized chunks until the byte threshold,
//! then flushes them as one transmit request. A new request is issued only
//! after the previous closure completed and its status was inspected; the
//! per-channel sequence therefore increases strictly from 0 with no
//! reordering. Close is two-phase: `set_finishing` enqueues the EOS send on
//! every channel without waiting (tear-down proceeds in parallel), and the
//! operator reports finished once every channel's final RPC completed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use basalt_chunk::{compress, Chunk};
use basalt_common::{EngineError, PlanNodeId, Result, TransmissionCompression};
use basalt_exec::observer::Observable;
use basalt_exec::op::{Operator, OperatorFactory};
use basalt_exec::plan::{DataStreamSinkDesc, DestinationDesc};
use basalt_exec::state::RuntimeState;

use crate::partition::{channel_row_permutation, dispatch_chunk, ChannelDispatch};
use crate::pb;
use crate::pb::exchange_service_client::ExchangeServiceClient;

fn compression_to_pb(c: TransmissionCompression) -> pb::PCompressionType {
    match c {
        TransmissionCompression::None => pb::PCompressionType::None,
        TransmissionCompression::Lz4 => pb::PCompressionType::Lz4,
        TransmissionCompression::Zstd => pb::PCompressionType::Zstd,
    }
}

/// Decode a wire compression tag.
pub fn compression_from_pb(raw: i32) -> Result<TransmissionCompression> {
    match pb::PCompressionType::try_from(raw) {
        Ok(pb::PCompressionType::None) => Ok(TransmissionCompression::None),
        Ok(pb::PCompressionType::Lz4) => Ok(TransmissionCompression::Lz4),
        Ok(pb::PCompressionType::Zstd) => Ok(TransmissionCompression::Zstd),
        Err(_) => Err(EngineError::InvalidArgument(format!(
            "unknown compression type {raw}"
        ))),
    }
}

struct ChannelCore {
    client: Option<ExchangeServiceClient<tonic::transport::Channel>>,
    pending: Vec<pb::PChunk>,
    pending_bytes: usize,
    sequence: i64,
    sent_meta: bool,
    in_flight: bool,
    eos_queued: bool,
    eos_sent: bool,
    done: bool,
}

/// One per-destination sender channel.
struct Channel {
    dest: DestinationDesc,
    core: Mutex<ChannelCore>,
}

impl Channel {
    fn new(dest: DestinationDesc) -> Arc<Self> {
        Arc::new(Self {
            dest,
            core: Mutex::new(ChannelCore {
                client: None,
                pending: Vec::new(),
                pending_bytes: 0,
                sequence: 0,
                sent_meta: false,
                in_flight: false,
                eos_queued: false,
                eos_sent: false,
                done: false,
            }),
        })
    }

    /// Whether a push may add more data: below threshold, or the previous
    /// request already completed (one request beyond the threshold may
    /// buffer while the RPC is in flight, bounding sender memory).
    fn can_accept(&self, threshold: usize) -> bool {
        let core = self.core.lock();
        core.done || core.pending_bytes < threshold || !core.in_flight
    }

    fn is_done(&self) -> bool {
        self.core.lock().done
    }
}

/// State shared by every sink operator instance of one data-stream sink.
pub struct SinkShared {
    desc: DataStreamSinkDesc,
    channels: Vec<Arc<Channel>>,
    open_sinks: AtomicUsize,
    rr: AtomicUsize,
    observable: Arc<Observable>,
    runtime: Arc<RuntimeState>,
    rt: tokio::runtime::Handle,
    threshold: usize,
    codec: TransmissionCompression,
    min_ratio: f64,
}

impl SinkShared {
    /// Build the shared sink state with one channel per destination.
    pub fn new(
        desc: DataStreamSinkDesc,
        runtime: Arc<RuntimeState>,
        rt: tokio::runtime::Handle,
    ) -> Result<Arc<Self>> {
        if desc.destinations.is_empty() {
            return Err(EngineError::InvalidArgument(
                "data stream sink without destinations".to_string(),
            ));
        }
        let channels = desc
            .destinations
            .iter()
            .map(|d| Channel::new(d.clone()))
            .collect();
        let config = runtime.config();
        Ok(Arc::new(Self {
            threshold: config.exchange_transmit_bytes,
            codec: config.transmission_compression,
            min_ratio: config.transmission_min_compress_ratio,
            desc,
            channels,
            open_sinks: AtomicUsize::new(0),
            rr: AtomicUsize::new(0),
            observable: Arc::new(Observable::new()),
            runtime,
            rt,
        }))
    }

    fn encode_payload(&self, chunk: &Chunk) -> Result<(pb::PCompressionType, usize, bytes::Bytes)> {
        let payload = chunk.serialize()?;
        let uncompressed = payload.len();
        match compress::maybe_compress(self.codec, &payload, self.min_ratio)? {
            Some(compressed) => Ok((
                compression_to_pb(self.codec),
                uncompressed,
                bytes::Bytes::from(compressed),
            )),
            None => Ok((
                pb::PCompressionType::None,
                uncompressed,
                bytes::Bytes::from(payload),
            )),
        }
    }

    /// Append one encoded chunk to a channel and flush it at the threshold.
    fn enqueue(
        self: &Arc<Self>,
        channel_idx: usize,
        meta: &bytes::Bytes,
        compress_type: pb::PCompressionType,
        uncompressed: usize,
        payload: bytes::Bytes,
    ) {
        let channel = &self.channels[channel_idx];
        let launch = {
            let mut core = channel.core.lock();
            if core.done {
                return;
            }
            let chunk_meta = if core.sent_meta {
                bytes::Bytes::new()
            } else {
                core.sent_meta = true;
                meta.clone()
            };
            core.pending_bytes += payload.len();
            core.pending.push(pb::PChunk {
                chunk_meta,
                compress_type: compress_type as i32,
                uncompressed_size: uncompressed as i64,
                data_size: payload.len() as i64,
                payload,
            });
            core.pending_bytes >= self.threshold && !core.in_flight
        };
        if launch {
            self.launch(channel_idx);
        }
    }

    /// Issue the next RPC on a channel if one is due and none is in flight.
    fn launch(self: &Arc<Self>, channel_idx: usize) {
        let channel = Arc::clone(&self.channels[channel_idx]);
        let params;
        let sent_eos;
        let client;
        {
            let mut core = channel.core.lock();
            if core.in_flight || core.done {
                return;
            }
            let want_eos = core.eos_queued && !core.eos_sent;
            if core.pending.is_empty() && !want_eos {
                return;
            }
            // Cancellation is polled before every RPC issue.
            if self.runtime.check_cancelled().is_err() {
                core.done = true;
                self.observable.notify();
                return;
            }
            if core.client.is_none() {
                match connect(&channel.dest.address) {
                    Ok(connected) => core.client = Some(connected),
                    Err(err) => {
                        core.done = true;
                        drop(core);
                        self.runtime.fail(err);
                        self.observable.notify();
                        return;
                    }
                }
            }
            client = core.client.clone();
            sent_eos = want_eos;
            let chunks = std::mem::take(&mut core.pending);
            core.pending_bytes = 0;
            let statistics = sent_eos.then(|| pb::PQueryStatistics {
                rows_returned: self
                    .runtime
                    .metrics
                    .rows_emitted
                    .load(Ordering::Relaxed) as i64,
                bytes_transmitted: self
                    .runtime
                    .metrics
                    .bytes_transmitted
                    .load(Ordering::Relaxed) as i64,
            });
            params = pb::PTransmitChunkParams {
                finst_id: Some(pb::PUniqueId {
                    hi: channel.dest.instance_id.hi,
                    lo: channel.dest.instance_id.lo,
                }),
                node_id: self.desc.dest_node_id.0,
                sender_id: self.desc.sender_id.0,
                be_number: self.desc.be_number,
                sequence: core.sequence,
                eos: sent_eos,
                chunks,
                query_statistics: statistics,
            };
            core.sequence += 1;
            core.eos_sent |= sent_eos;
            core.in_flight = true;
        }

        let bytes: u64 = params.chunks.iter().map(|c| c.data_size as u64).sum();
        self.runtime
            .metrics
            .bytes_transmitted
            .fetch_add(bytes, Ordering::Relaxed);
        self.runtime.metrics.rpcs_issued.fetch_add(1, Ordering::Relaxed);

        let Some(mut client) = client else {
            self.runtime.fail(EngineError::Internal(
                "transmit issued without a connected channel".to_string(),
            ));
            return;
        };
        let shared = Arc::clone(self);
        self.rt.spawn(async move {
            let outcome = client.transmit_chunk(params).await;
            shared.complete(channel_idx, sent_eos, outcome);
        });
    }

    fn complete(
        self: &Arc<Self>,
        channel_idx: usize,
        was_eos: bool,
        outcome: std::result::Result<tonic::Response<pb::PTransmitChunkResult>, tonic::Status>,
    ) {
        let channel = &self.channels[channel_idx];
        let error = match outcome {
            Ok(response) => {
                let status = response.into_inner().status.unwrap_or_default();
                if status.code == 0 {
                    None
                } else {
                    Some(EngineError::RemoteRpcFailed(format!(
                        "{} rejected transmit: {}",
                        channel.dest.address, status.message
                    )))
                }
            }
            Err(status) if status.code() == tonic::Code::DeadlineExceeded => Some(
                EngineError::RemoteRpcTimeout(format!("{}: {status}", channel.dest.address)),
            ),
            Err(status) => Some(EngineError::RemoteRpcFailed(format!(
                "{}: {status}",
                channel.dest.address
            ))),
        };

        let relaunch = {
            let mut core = channel.core.lock();
            core.in_flight = false;
            if error.is_some() || was_eos {
                core.done = true;
            }
            !core.done
                && (core.pending_bytes >= self.threshold || (core.eos_queued && !core.eos_sent))
        };
        if let Some(err) = error {
            // The first non-OK close status latches on the fragment.
            self.runtime.fail(err);
        }
        if relaunch {
            self.launch(channel_idx);
        }
        self.observable.notify();
    }

    fn all_channels_done(&self) -> bool {
        self.channels.iter().all(|c| c.is_done())
    }

    /// Enqueue the EOS send on every channel without waiting (phase one of
    /// the two-phase close). The awaiting operator observes completion
    /// through `all_channels_done`.
    fn close_all(self: &Arc<Self>) {
        for idx in 0..self.channels.len() {
            self.channels[idx].core.lock().eos_queued = true;
            self.launch(idx);
        }
    }
}

fn connect(address: &str) -> Result<ExchangeServiceClient<tonic::transport::Channel>> {
    let endpoint = tonic::transport::Endpoint::from_shared(address.to_string())
        .map_err(|e| EngineError::InvalidArgument(format!("bad destination {address}: {e}")))?;
    Ok(ExchangeServiceClient::new(endpoint.connect_lazy()))
}

/// Exchange sink operator; instances of one sink share the channel set.
pub struct ExchangeSinkOperator {
    node: PlanNodeId,
    shared: Arc<SinkShared>,
    finishing: bool,
    awaiting_channels: bool,
    opened: bool,
}

impl ExchangeSinkOperator {
    fn push_partitioned(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let n = self.shared.channels.len();
        state
            .metrics
            .rows_emitted
            .fetch_add(chunk.num_rows() as u64, Ordering::Relaxed);
        let meta = bytes::Bytes::from(chunk.meta().serialize());
        match dispatch_chunk(&self.shared.desc.partition, &chunk, n)? {
            ChannelDispatch::Broadcast => {
                let (ctype, uncompressed, payload) = self.shared.encode_payload(&chunk)?;
                for idx in 0..n {
                    // The serialized payload is shared (reference counted)
                    // across channels.
                    self.shared
                        .enqueue(idx, &meta, ctype, uncompressed, payload.clone());
                }
            }
            ChannelDispatch::RoundRobin => {
                let idx = self.shared.rr.fetch_add(1, Ordering::Relaxed) % n;
                let (ctype, uncompressed, payload) = self.shared.encode_payload(&chunk)?;
                self.shared.enqueue(idx, &meta, ctype, uncompressed, payload);
            }
            ChannelDispatch::PerRow(channel_ids) => {
                let (perm, starts) = channel_row_permutation(&channel_ids, n);
                for idx in 0..n {
                    let slice = &perm[starts[idx] as usize..starts[idx + 1] as usize];
                    if slice.is_empty() {
                        continue;
                    }
                    let mut part = chunk.new_empty_like()?;
                    part.append_selective(&chunk, slice)?;
                    let (ctype, uncompressed, payload) = self.shared.encode_payload(&part)?;
                    self.shared.enqueue(idx, &meta, ctype, uncompressed, payload);
                }
            }
        }
        Ok(())
    }
}

impl Operator for ExchangeSinkOperator {
    fn name(&self) -> &'static str {
        "exchange_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn prepare(&mut self, _state: &RuntimeState) -> Result<()> {
        self.shared.open_sinks.fetch_add(1, Ordering::AcqRel);
        self.opened = true;
        Ok(())
    }

    fn need_input(&self) -> bool {
        !self.finishing
            && self
                .shared
                .channels
                .iter()
                .all(|c| c.can_accept(self.shared.threshold))
    }

    fn has_output(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finishing && (!self.awaiting_channels || self.shared.all_channels_done())
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.push_partitioned(state, chunk)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;
        if self.opened && self.shared.open_sinks.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last sink instance: fan the EOS sends out in parallel and wait
            // for the channels from is_finished.
            self.awaiting_channels = true;
            self.shared.close_all();
        }
        Ok(())
    }

    fn set_finished(&mut self, state: &RuntimeState) -> Result<()> {
        self.set_finishing(state)
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.shared.observable))
    }
}

/// Factory for [`ExchangeSinkOperator`].
pub struct ExchangeSinkFactory {
    node: PlanNodeId,
    shared: Arc<SinkShared>,
}

impl ExchangeSinkFactory {
    /// Create the sink factory over shared channel state.
    pub fn new(node: PlanNodeId, shared: Arc<SinkShared>) -> Self {
        Self { node, shared }
    }
}

impl OperatorFactory for ExchangeSinkFactory {
    fn name(&self) -> &'static str {
        "exchange_sink"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ExchangeSinkOperator {
            node: self.node,
            shared: Arc::clone(&self.shared),
            finishing: false,
            awaiting_channels: false,
            opened: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_chunk::{Chunk, Column, Datum};
    use basalt_common::{EngineConfig, FragmentInstanceId, PlanNodeId, QueryId, SenderId, SlotId};
    use basalt_exec::plan::PartitionDesc;
    use rand::{Rng, SeedableRng};

    fn shared_with_codec(codec: TransmissionCompression) -> (tokio::runtime::Runtime, Arc<SinkShared>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = EngineConfig {
            transmission_compression: codec,
            ..EngineConfig::default()
        };
        let state = Arc::new(RuntimeState::new(
            QueryId { hi: 1, lo: 1 },
            FragmentInstanceId { hi: 1, lo: 1 },
            config,
            basalt_common::MemTracker::root("test", None),
        ));
        let desc = DataStreamSinkDesc {
            dest_node_id: PlanNodeId(1),
            sender_id: SenderId(0),
            be_number: 0,
            partition: PartitionDesc::Unpartitioned,
            destinations: vec![DestinationDesc {
                instance_id: FragmentInstanceId { hi: 2, lo: 2 },
                address: "http://127.0.0.1:1".to_string(),
            }],
        };
        let shared = SinkShared::new(desc, state, rt.handle().clone()).unwrap();
        (rt, shared)
    }

    #[test]
    fn incompressible_payload_transmits_uncompressed() {
        let (_rt, shared) = shared_with_codec(TransmissionCompression::Lz4);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut col = Column::new_for_type(basalt_chunk::PrimitiveType::Varchar, false).unwrap();
        let noise: Vec<u8> = (0..100).map(|_| rng.gen()).collect();
        col.append_datum(&Datum::Binary(noise)).unwrap();
        let chunk = Chunk::from_columns(vec![(SlotId(0), col)]).unwrap();

        let (ctype, uncompressed, payload) = shared.encode_payload(&chunk).unwrap();
        assert_eq!(ctype, pb::PCompressionType::None);
        assert_eq!(uncompressed, payload.len());
    }

    #[test]
    fn repetitive_payload_transmits_compressed() {
        let (_rt, shared) = shared_with_codec(TransmissionCompression::Lz4);
        let values: Vec<i64> = std::iter::repeat(5).take(1024).collect();
        let chunk = Chunk::from_columns(vec![(SlotId(0), Column::int64(&values))]).unwrap();

        let (ctype, uncompressed, payload) = shared.encode_payload(&chunk).unwrap();
        assert_eq!(ctype, pb::PCompressionType::Lz4);
        assert!(payload.len() < uncompressed);
    }
}
