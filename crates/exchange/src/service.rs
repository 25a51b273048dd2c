//! gRPC service accepting transmit requests and feeding receiver queues.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use basalt_common::{EngineError, FragmentInstanceId, PlanNodeId};

use crate::pb;
use crate::pb::exchange_service_server::ExchangeService;
use crate::receiver::{ChunkFrame, ReceiverRegistry};
use crate::sender::compression_from_pb;

/// Wire status codes carried in transmit results.
mod status_code {
    pub const OK: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const NOT_FOUND: i32 = 3;
    pub const MEM_LIMIT: i32 = 4;
    pub const CANCELLED: i32 = 5;
}

fn ok_status() -> pb::PStatus {
    pb::PStatus {
        code: status_code::OK,
        message: String::new(),
    }
}

fn error_status(err: &EngineError) -> pb::PStatus {
    let code = match err {
        EngineError::InvalidArgument(_) => status_code::INVALID_ARGUMENT,
        EngineError::MemoryLimitExceeded(_) => status_code::MEM_LIMIT,
        EngineError::Cancelled(_) => status_code::CANCELLED,
        _ => status_code::INTERNAL,
    };
    pb::PStatus {
        code,
        message: err.to_string(),
    }
}

/// Transmit endpoint backed by the process-wide receiver registry.
pub struct ExchangeServiceImpl {
    registry: Arc<ReceiverRegistry>,
}

impl ExchangeServiceImpl {
    /// Create the service over a registry.
    pub fn new(registry: Arc<ReceiverRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl ExchangeService for ExchangeServiceImpl {
    async fn transmit_chunk(
        &self,
        request: Request<pb::PTransmitChunkParams>,
    ) -> Result<Response<pb::PTransmitChunkResult>, Status> {
        let req = request.into_inner();
        let Some(finst) = req.finst_id else {
            return Ok(Response::new(pb::PTransmitChunkResult {
                status: Some(pb::PStatus {
                    code: status_code::INVALID_ARGUMENT,
                    message: "transmit without fragment instance id".to_string(),
                }),
            }));
        };
        let finst_id = FragmentInstanceId {
            hi: finst.hi,
            lo: finst.lo,
        };
        let node = PlanNodeId(req.node_id);

        let Some(receiver) = self.registry.lookup(finst_id, node) else {
            return Ok(Response::new(pb::PTransmitChunkResult {
                status: Some(pb::PStatus {
                    code: status_code::NOT_FOUND,
                    message: format!("no receiver for instance {finst_id} node {node}"),
                }),
            }));
        };

        let mut frames = Vec::with_capacity(req.chunks.len());
        for chunk in req.chunks {
            let compression = match compression_from_pb(chunk.compress_type) {
                Ok(c) => c,
                Err(err) => {
                    return Ok(Response::new(pb::PTransmitChunkResult {
                        status: Some(error_status(&err)),
                    }))
                }
            };
            frames.push(ChunkFrame {
                meta: chunk.chunk_meta.to_vec(),
                compression,
                uncompressed_size: chunk.uncompressed_size as usize,
                payload: chunk.payload.to_vec(),
            });
        }

        let status = match receiver.add_chunks(req.sender_id, req.sequence, req.eos, frames) {
            Ok(()) => ok_status(),
            Err(err) => {
                tracing::warn!(finst = %finst_id, node = %node, error = %err, "transmit rejected");
                error_status(&err)
            }
        };
        Ok(Response::new(pb::PTransmitChunkResult {
            status: Some(status),
        }))
    }

    async fn transmit_data(
        &self,
        _request: Request<pb::PTransmitDataParams>,
    ) -> Result<Response<pb::PTransmitDataResult>, Status> {
        // Legacy row-batch framing stays on the wire but is rejected: this
        // engine never carried row batches.
        Ok(Response::new(pb::PTransmitDataResult {
            status: Some(pb::PStatus {
                code: status_code::INVALID_ARGUMENT,
                message: "row batch transport retired; use transmit_chunk".to_string(),
            }),
        }))
    }
}
