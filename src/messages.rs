//! Generated wire types for the resource monitor protocol.

/// Re-export generated protobuf types.
pub mod proto {
    tonic::include_proto!("cairn.monitor");
}

impl From<crate::plugin::CheckFailure> for proto::CheckFailure {
    fn from(failure: crate::plugin::CheckFailure) -> Self {
        Self {
            property: failure.property,
            reason: failure.reason,
        }
    }
}
