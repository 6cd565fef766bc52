//! Member payload encoding.
//!
//! Payloads are stored on member nodes as opaque bytes. The default
//! [`JsonCodec`] writes the format existing serverset consumers read:
//!
//! ```json
//! {"serviceEndpoint":{"host":"10.0.0.1","port":9000},
//!  "additionalEndpoints":{"admin":{"host":"10.0.0.1","port":9001}},
//!  "status":"ALIVE","shard":0}
//! ```

use thiserror::Error;

use crate::instance::ServiceInstance;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode member record: {0}")]
    Encode(String),

    #[error("failed to decode member record: {0}")]
    Decode(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Converts member records to and from node payloads.
pub trait InstanceCodec: Send + Sync + 'static {
    fn encode(&self, instance: &ServiceInstance) -> CodecResult<Vec<u8>>;

    fn decode(&self, data: &[u8]) -> CodecResult<ServiceInstance>;
}

/// JSON member records.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl InstanceCodec for JsonCodec {
    fn encode(&self, instance: &ServiceInstance) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(instance).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> CodecResult<ServiceInstance> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
