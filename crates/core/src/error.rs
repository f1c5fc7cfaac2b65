use thiserror::Error;

/// A rule field that could not be translated into its kernel encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field} {value:?}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self {
            field,
            value: value.into(),
            reason,
        }
    }
}

/// Failure writing a record into the enforcement table.
#[derive(Debug, Error)]
#[error("filter table slot {slot}: {detail}")]
pub struct TableError {
    pub slot: u32,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("rule id {id} out of range (capacity {capacity})")]
    IdOutOfRange { id: u32, capacity: u32 },
    #[error("rule {0} not found")]
    NotFound(u32),
    #[error("rule {0} already exists")]
    AlreadyExists(u32),
    #[error("all {0} rule slots are in use")]
    CapacityExceeded(u32),
    #[error("failed to publish rule: {0}")]
    Publish(#[from] TableError),
}

#[derive(Debug, Error)]
#[error("telemetry read failed on {map}: {detail}")]
pub struct TelemetryError {
    pub map: &'static str,
    pub detail: String,
}

/// Errors that prevent any response from the generation service.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("generation service transport error: {0}")]
    Transport(String),
}
