// Declarative notification engine: scope, trigger, templates and dispatch

pub mod config;
pub mod db;
pub mod definition;
pub mod delivery;
pub mod directory;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod queue;
pub mod registry;
pub mod render;
pub mod scope;
pub mod telemetry;
pub mod template;
pub mod trigger;

pub use definition::NotificationDefinition;
pub use dispatcher::{Dispatcher, FireReport, ScheduleOutcome};
pub use errors::NotificationError;
pub use models::{Context, FireEvent, Recipient, ScheduleRequest};
pub use registry::NotificationRegistry;
