use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, LabError>;

/// Errors surfaced by lab operations.
///
/// Spawn errors are atomic: by the time one of these reaches a caller, every
/// partial allocation has been reversed. Cleanup paths never produce these;
/// stop/reset log their failures and keep going.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("firmware '{0}' not found in library")]
    UnknownFirmware(String),

    #[error("{kind} missing: {}", path.display())]
    MissingFile { kind: &'static str, path: PathBuf },

    /// The Stellaris SoC NIC MAC is burned in, so only one cortex-m3 guest
    /// may sit on the bridge at a time.
    #[error("only one cortex-m3 device allowed at a time (Stellaris MAC conflict), running: {0}")]
    SocMacConflict(String),

    #[error("{0}")]
    Config(String),

    /// A host command, netlink operation, overlay creation, or child spawn
    /// failed. Carries the underlying cause.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl LabError {
    pub fn resource(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        LabError::Resource {
            context: context.into(),
            source: source.into(),
        }
    }
}
