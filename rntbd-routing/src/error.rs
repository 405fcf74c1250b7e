//! Routing error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid partition key: {0}")]
    InvalidPartitionKey(String),

    #[error("{0} component cannot be hashed")]
    UnhashableComponent(&'static str),

    #[error("partition key has {components} components but the definition has {paths} paths")]
    TooManyComponents { components: usize, paths: usize },

    #[error("ranges overlap: '{previous}' ends at {previous_max:?} after '{current}' starts at {current_min:?}")]
    OverlappingRanges {
        previous: String,
        previous_max: String,
        current: String,
        current_min: String,
    },

    #[error("duplicate partition key range id '{0}'")]
    DuplicateRangeId(String),

    #[error("hash ring has no nodes")]
    EmptyRing,

    #[error("requested replica {requested} but only {available} distinct nodes are on the ring")]
    InsufficientNodes { requested: usize, available: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
