use std::io;

use thiserror::Error;

use crate::artists::ElementId;

/// Failure talking to the instrument or making sense of what it returned.
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("instrument link error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response to `{command}`: {response:?}")]
    Malformed { command: String, response: String },
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("cannot analyse waveform: {0}")]
    Analysis(String),
}

/// Failure of a render surface primitive.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no visible element with id {0}")]
    UnknownElement(ElementId),
    #[error("render surface state is poisoned")]
    Poisoned,
}

/// Anything that ends the refresh loop early.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Render(#[from] RenderError),
}
