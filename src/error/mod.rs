use thiserror::Error;

/// CNI error code for an invalid network configuration.
pub const CODE_INVALID_CONFIG: u32 = 7;
/// First plugin-specific CNI error code.
pub const CODE_PLUGIN: u32 = 100;

/// Errors produced while wiring a chained interface.
#[derive(Debug, Error)]
pub enum VethError {
    /// Malformed or incomplete network configuration
    #[error("invalid network configuration: {0}")]
    Config(String),

    /// Interface name carries no routing-table ordinal
    #[error(
        "interface {0} has no table ordinal: in multi-NIC mode the first NIC can only be Macvlan/SR-IOV + veth, not Calico or Cilium"
    )]
    Unmappable(String),

    /// Entering a network namespace failed
    #[error("namespace error: {0}")]
    Namespace(String),

    /// No usable address could be found
    #[error("address discovery failed: {0}")]
    AddressDiscovery(String),

    /// A hardware address literal could not be parsed
    #[error("invalid hardware address {0:?}")]
    HardwareAddr(String),

    /// An iproute2 invocation failed
    #[error("'{cmd}' failed: {stderr}")]
    Kernel { cmd: String, stderr: String },

    /// The named link does not exist in the current namespace
    #[error("link {0} not found")]
    LinkNotFound(String),

    /// The object being created is already present
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// iproute2 JSON output could not be decoded
    #[error("failed to decode ip output: {0}")]
    Json(#[from] serde_json::Error),

    /// System I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<VethError>,
    },
}

pub type Result<T> = std::result::Result<T, VethError>;

impl VethError {
    /// Wrap the error with the operation and identifiers it concerns.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        VethError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers.
    pub fn root(&self) -> &VethError {
        match self {
            VethError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), VethError::AlreadyExists(_))
    }

    pub fn is_link_not_found(&self) -> bool {
        matches!(self.root(), VethError::LinkNotFound(_))
    }

    /// CNI error code reported to the runtime.
    pub fn code(&self) -> u32 {
        match self.root() {
            VethError::Config(_) | VethError::Unmappable(_) | VethError::HardwareAddr(_) => {
                CODE_INVALID_CONFIG
            }
            _ => CODE_PLUGIN,
        }
    }
}

/// Treat "already exists" as success for create operations.
pub fn tolerate_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}
