//! Exchange receiver: per-(instance, node) chunk queues fed by the RPC
//! service and drained by exchange source operators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use basalt_chunk::{compress, Chunk, ChunkMeta};
use basalt_common::{
    EngineError, FragmentInstanceId, PlanNodeId, Result, TransmissionCompression,
};
use basalt_exec::observer::Observable;
use basalt_exec::op::{Operator, OperatorFactory};
use basalt_exec::state::RuntimeState;

/// One decoded chunk frame from a transmit request.
pub struct ChunkFrame {
    /// Schema header bytes; non-empty only on a channel's first chunk.
    pub meta: Vec<u8>,
    /// Payload compression.
    pub compression: TransmissionCompression,
    /// Size before compression.
    pub uncompressed_size: usize,
    /// Transmitted payload.
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct SenderTrack {
    next_sequence: i64,
    eos: bool,
}

/// Receiver state of one exchange node in one fragment instance.
pub struct ExchangeReceiver {
    finst_id: FragmentInstanceId,
    node: PlanNodeId,
    queue: Mutex<VecDeque<Chunk>>,
    meta: Mutex<Option<ChunkMeta>>,
    senders: Mutex<HashMap<i32, SenderTrack>>,
    senders_remaining: AtomicUsize,
    observable: Arc<Observable>,
}

impl ExchangeReceiver {
    /// Create a receiver expecting `sender_count` upstream instances.
    pub fn new(finst_id: FragmentInstanceId, node: PlanNodeId, sender_count: u32) -> Arc<Self> {
        Arc::new(Self {
            finst_id,
            node,
            queue: Mutex::new(VecDeque::new()),
            meta: Mutex::new(None),
            senders: Mutex::new(HashMap::new()),
            senders_remaining: AtomicUsize::new(sender_count.max(1) as usize),
            observable: Arc::new(Observable::new()),
        })
    }

    /// Accept one transmit request from `sender_id`.
    ///
    /// Sequences must increase strictly from 0 per sender; the sender
    /// guarantees no reordering within a channel, so any gap is a transport
    /// fault.
    pub fn add_chunks(
        &self,
        sender_id: i32,
        sequence: i64,
        eos: bool,
        frames: Vec<ChunkFrame>,
    ) -> Result<()> {
        {
            let mut senders = self.senders.lock();
            let track = senders.entry(sender_id).or_default();
            if track.eos {
                return Err(EngineError::InvalidArgument(format!(
                    "sender {sender_id} transmitted after eos on exchange {}",
                    self.node
                )));
            }
            if sequence != track.next_sequence {
                return Err(EngineError::InvalidArgument(format!(
                    "sender {sender_id} sequence {sequence} out of order (expected {}) on exchange {}",
                    track.next_sequence, self.node
                )));
            }
            track.next_sequence += 1;
            if eos {
                track.eos = true;
            }
        }

        for frame in frames {
            let chunk = self.decode_frame(frame)?;
            self.queue.lock().push_back(chunk);
        }
        if eos {
            self.senders_remaining.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(
                finst = %self.finst_id,
                node = %self.node,
                sender = sender_id,
                "exchange sender closed"
            );
        }
        self.observable.notify();
        Ok(())
    }

    fn decode_frame(&self, frame: ChunkFrame) -> Result<Chunk> {
        if !frame.meta.is_empty() {
            let meta = ChunkMeta::deserialize(&frame.meta)?;
            *self.meta.lock() = Some(meta);
        }
        let meta_guard = self.meta.lock();
        let meta = meta_guard.as_ref().ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "chunk without schema header on exchange {} before any meta",
                self.node
            ))
        })?;
        let payload = compress::decompress(
            frame.compression,
            &frame.payload,
            frame.uncompressed_size,
        )?;
        Chunk::deserialize(&payload, meta)
    }

    /// Pop the next queued chunk.
    pub fn pull(&self) -> Option<Chunk> {
        self.queue.lock().pop_front()
    }

    /// Whether a chunk is available.
    pub fn has_chunks(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Whether every sender sent eos and the queue drained.
    pub fn is_finished(&self) -> bool {
        self.senders_remaining.load(Ordering::Acquire) == 0 && self.queue.lock().is_empty()
    }

    /// Observable fired on arrivals and sender closes.
    pub fn observable(&self) -> &Arc<Observable> {
        &self.observable
    }
}

/// Process-wide registry the RPC service resolves receivers through.
#[derive(Default)]
pub struct ReceiverRegistry {
    map: Mutex<HashMap<(FragmentInstanceId, PlanNodeId), Arc<ExchangeReceiver>>>,
}

impl ReceiverRegistry {
    /// Empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a receiver for (instance, node).
    pub fn register(&self, receiver: Arc<ExchangeReceiver>) {
        self.map
            .lock()
            .insert((receiver.finst_id, receiver.node), receiver);
    }

    /// Remove a fragment instance's receivers at teardown.
    pub fn deregister_instance(&self, finst_id: FragmentInstanceId) {
        self.map.lock().retain(|(f, _), _| *f != finst_id);
    }

    /// Resolve the receiver for a transmit request.
    pub fn lookup(
        &self,
        finst_id: FragmentInstanceId,
        node: PlanNodeId,
    ) -> Option<Arc<ExchangeReceiver>> {
        self.map.lock().get(&(finst_id, node)).cloned()
    }
}

/// Source operator draining one exchange receiver.
pub struct ExchangeSourceOperator {
    node: PlanNodeId,
    receiver: Arc<ExchangeReceiver>,
    finished: bool,
}

impl Operator for ExchangeSourceOperator {
    fn name(&self) -> &'static str {
        "exchange_source"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished && self.receiver.has_chunks()
    }

    fn is_finished(&self) -> bool {
        self.finished || self.receiver.is_finished()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(EngineError::Internal("push into exchange source".to_string()))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(self.receiver.pull())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn is_source(&self) -> bool {
        true
    }

    fn pending_observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(self.receiver.observable()))
    }
}

/// Factory for [`ExchangeSourceOperator`]; drivers share the receiver.
pub struct ExchangeSourceFactory {
    node: PlanNodeId,
    receiver: Arc<ExchangeReceiver>,
}

impl ExchangeSourceFactory {
    /// Create a source factory over a registered receiver.
    pub fn new(node: PlanNodeId, receiver: Arc<ExchangeReceiver>) -> Self {
        Self { node, receiver }
    }
}

impl OperatorFactory for ExchangeSourceFactory {
    fn name(&self) -> &'static str {
        "exchange_source"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node
    }

    fn create(&self, _degree: usize, _driver_seq: usize) -> Result<Box<dyn Operator>> {
        Ok(Box::new(ExchangeSourceOperator {
            node: self.node,
            receiver: Arc::clone(&self.receiver),
            finished: false,
        }))
    }

    fn is_source(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_chunk::Column;
    use basalt_common::SlotId;

    fn finst() -> FragmentInstanceId {
        FragmentInstanceId { hi: 1, lo: 9 }
    }

    fn frame_for(chunk: &Chunk, with_meta: bool) -> ChunkFrame {
        let payload = chunk.serialize().unwrap();
        ChunkFrame {
            meta: if with_meta {
                chunk.meta().serialize()
            } else {
                Vec::new()
            },
            compression: TransmissionCompression::None,
            uncompressed_size: payload.len(),
            payload,
        }
    }

    #[test]
    fn sequences_must_increase_strictly_from_zero() {
        let receiver = ExchangeReceiver::new(finst(), PlanNodeId(5), 1);
        let chunk = Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1]))]).unwrap();

        receiver
            .add_chunks(0, 0, false, vec![frame_for(&chunk, true)])
            .unwrap();
        // Replayed or skipped sequences are transport faults.
        assert!(receiver
            .add_chunks(0, 0, false, vec![frame_for(&chunk, false)])
            .is_err());
        assert!(receiver
            .add_chunks(0, 2, false, vec![frame_for(&chunk, false)])
            .is_err());
        receiver
            .add_chunks(0, 1, true, vec![frame_for(&chunk, false)])
            .unwrap();
        assert!(!receiver.is_finished());
        assert!(receiver.pull().is_some());
        assert!(receiver.pull().is_some());
        assert!(receiver.is_finished());
    }

    #[test]
    fn meta_applies_to_later_payload_only_frames() {
        let receiver = ExchangeReceiver::new(finst(), PlanNodeId(5), 2);
        let chunk = Chunk::from_columns(vec![
            (SlotId(0), Column::nullable_int64(&[Some(3), None])),
            (SlotId(1), Column::varchar(&["a", "b"])),
        ])
        .unwrap();

        receiver
            .add_chunks(0, 0, true, vec![frame_for(&chunk, true)])
            .unwrap();
        receiver
            .add_chunks(1, 0, true, vec![frame_for(&chunk, false)])
            .unwrap();
        let first = receiver.pull().unwrap();
        let second = receiver.pull().unwrap();
        assert_eq!(first, chunk);
        assert_eq!(second, chunk);
        assert!(receiver.is_finished());
    }

    #[test]
    fn missing_meta_is_rejected() {
        let receiver = ExchangeReceiver::new(finst(), PlanNodeId(5), 1);
        let chunk = Chunk::from_columns(vec![(SlotId(0), Column::int64(&[1]))]).unwrap();
        let err = receiver.add_chunks(0, 0, false, vec![frame_for(&chunk, false)]);
        assert!(err.is_err());
    }
}
