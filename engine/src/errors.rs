// Error handling framework for scheduling and dispatching notifications

use thiserror::Error;

/// Errors surfaced by `schedule` and `fire`
///
/// Validation-class errors abort a `schedule` call before anything is queued.
/// During `fire`, only errors that affect the whole event (definition lookup,
/// scope resolution) are returned here; per-pair problems are reported through
/// [`DispatchError`] inside the fire report.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Unknown notification: {0}")]
    UnknownNotification(String),

    #[error("Invalid backend override for '{notification}': {reason}")]
    InvalidBackendOverride {
        notification: String,
        reason: String,
    },

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),

    #[error("Missing context key: {0}")]
    MissingContextKey(String),

    /// A scope refinement rejected the event; redelivery gives the same answer
    #[error("Scope filter failed: {0}")]
    ScopeFilter(String),

    #[error("Recipient directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl NotificationError {
    /// Whether redelivering the same event could succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Directory(e) => !matches!(e, DirectoryError::InvalidFilter(_)),
            NotificationError::Queue(_) => true,
            _ => false,
        }
    }
}

/// Trigger calculation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("Invalid delay: {seconds} seconds (delay must not be negative)")]
    InvalidDelay { seconds: i64 },

    #[error("Invalid {field} value {value}")]
    InvalidTimeOfDay { field: String, value: u32 },

    #[error("Invalid recurrence rule '{expression}': {reason}")]
    InvalidRecurrence { expression: String, reason: String },

    #[error("Recurrence rule '{expression}' has no next occurrence")]
    NoNextOccurrence { expression: String },

    #[error("Local time {0} does not exist in the trigger timezone")]
    NonexistentLocalTime(String),

    #[error("Trigger calculation failed: {0}")]
    CalculationFailed(String),
}

/// Per-(recipient, backend) failures recorded in a fire report
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Render failure: {0}")]
    Render(#[from] RenderError),

    #[error("Delivery failure: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("No template configured for backend '{0}'")]
    NoTemplateConfigured(String),

    #[error("No delivery backend registered under '{0}'")]
    UnknownBackend(String),

    #[error("Render context build failed: {0}")]
    ContextBuild(String),
}

impl DispatchError {
    /// Short machine-readable reason used as a metric label
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::Render(_) => "render",
            DispatchError::Delivery(DeliveryError::Timeout(_)) => "timeout",
            DispatchError::Delivery(_) => "delivery",
            DispatchError::NoTemplateConfigured(_) => "no_template",
            DispatchError::UnknownBackend(_) => "unknown_backend",
            DispatchError::ContextBuild(_) => "context_build",
        }
    }
}

/// Renderer errors
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Failed to load templates: {0}")]
    LoadFailed(String),

    #[error("Failed to render template '{template_id}': {reason}")]
    Failed { template_id: String, reason: String },
}

/// Delivery backend errors
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Delivery rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Delivery timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// User directory errors
#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Directory query failed: {0}")]
    QueryFailed(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
}

/// Errors raised while building or registering notification definitions
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Notification name cannot be empty")]
    EmptyName,

    #[error("Notification '{0}' declares no backends")]
    NoBackends(String),

    #[error("Notification '{notification}' declares backend '{backend}' more than once")]
    DuplicateBackend {
        notification: String,
        backend: String,
    },

    #[error("Notification '{0}' has no 'default' template")]
    MissingDefaultTemplate(String),

    #[error("Notification '{0}' is already registered")]
    DuplicateName(String),

    #[error("Notification '{notification}' has an invalid trigger: {source}")]
    InvalidTrigger {
        notification: String,
        source: TriggerError,
    },

    #[error("Notification '{notification}' references backend '{backend}' with no delivery adapter")]
    MissingBackendAdapter {
        notification: String,
        backend: String,
    },

    #[error("Failed to load notification definitions: {0}")]
    LoadFailed(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),

    #[error("Cannot arm recurring job: {0}")]
    Recurrence(#[from] TriggerError),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => DatabaseError::QueryFailed(db_err.message().to_string()),
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<DatabaseError> for DirectoryError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::ConnectionFailed(msg) | DatabaseError::HealthCheckFailed(msg) => {
                DirectoryError::Unavailable(msg)
            }
            other => DirectoryError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DirectoryError::Unavailable(err.to_string())
            }
            other => DirectoryError::QueryFailed(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for DefinitionError {
    fn from(err: config::ConfigError) -> Self {
        DefinitionError::LoadFailed(err.to_string())
    }
}
