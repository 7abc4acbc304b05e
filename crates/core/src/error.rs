use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid node id")]
    InvalidNodeId,
}
