#![deny(missing_docs)]

//! Shuffle exchange for the basalt execution core.
//!
//! Architecture role:
//! - the exchange sink operator: per-destination channels that partition,
//!   batch, compress and transmit chunks with at most one in-flight RPC
//! - row dispatch across channels (broadcast / round-robin / FNV hash /
//!   CRC32 bucket-shuffle / range)
//! - the receiver registry, queues and the exchange source operator
//! - the gRPC `ExchangeService` endpoint
//!
//! RPC schema source: `proto/basalt_exchange.proto`.

/// Row dispatch across channels.
pub mod partition;
/// Receiver queues and the exchange source.
pub mod receiver;
/// Sender channels and the exchange sink.
pub mod sender;
/// The transmit RPC endpoint.
pub mod service;

#[allow(missing_docs)]
pub mod pb {
    tonic::include_proto!("basalt.exchange.v1");
}

pub use pb::exchange_service_client::ExchangeServiceClient;
pub use pb::exchange_service_server::{ExchangeService, ExchangeServiceServer};
pub use receiver::{ExchangeReceiver, ExchangeSourceFactory, ReceiverRegistry};
pub use sender::{ExchangeSinkFactory, SinkShared};
pub use service::ExchangeServiceImpl;
