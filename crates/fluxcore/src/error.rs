use thiserror::Error;

/// Why the admission gate declined a run request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DenyReason {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded for scope '{scope}'")]
    RateLimited { scope: String },

    #[error("quota exhausted for workspace {workspace_id}")]
    QuotaExhausted { workspace_id: uuid::Uuid },
}

/// Problems with a flow definition; never creates a Run
#[derive(Error, Debug, Clone)]
pub enum DefinitionError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("cyclic dependency detected")]
    CyclicDependency,

    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    #[error("invalid flow: {0}")]
    Invalid(String),
}

/// Failure inside a single node execution
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Broker (queue + pub/sub) failures
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Top-level error taxonomy for run orchestration.
///
/// `AdmissionDenied` and `Definition` never create a Run; `Node`,
/// `Execution` and `Infrastructure` terminate an existing Run as Failed.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("admission denied: {0}")]
    AdmissionDenied(DenyReason),

    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BrokerError> for RunError {
    fn from(e: BrokerError) -> Self {
        RunError::Infrastructure(e.to_string())
    }
}

/// Result type for run operations
pub type Result<T> = std::result::Result<T, RunError>;
