// User directory abstraction and the filter language scopes are expressed in

pub mod memory;
pub mod postgres;

pub use memory::InMemoryDirectory;
pub use postgres::PgUserDirectory;

use crate::errors::DirectoryError;
use crate::models::Recipient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// UserDirectory is the source of recipients
///
/// Implementations must see mutations made before the call, since scope is
/// evaluated again on every fire.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Return every recipient matching `filter`, or all recipients for `None`
    async fn query(&self, filter: Option<&Filter>) -> Result<Vec<Recipient>, DirectoryError>;
}

/// Filter is a composable predicate over recipient fields
///
/// `field` addresses a recipient attribute, or the identity key for `"id"`.
/// Attributes compare as JSON values. The identity key compares as text, so a
/// numeric value such as `42` selects the recipient `"42"` in every directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    All { filters: Vec<Filter> },
    Any { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Filter::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Filter::Exists {
            field: field.into(),
        }
    }

    pub fn negate(self) -> Self {
        Filter::Not {
            filter: Box::new(self),
        }
    }

    /// Conjunction of two filters, flattening nested `All`
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All { mut filters }, Filter::All { filters: rest }) => {
                filters.extend(rest);
                Filter::All { filters }
            }
            (Filter::All { mut filters }, other) => {
                filters.push(other);
                Filter::All { filters }
            }
            (first, Filter::All { mut filters }) => {
                filters.insert(0, first);
                Filter::All { filters }
            }
            (first, second) => Filter::All {
                filters: vec![first, second],
            },
        }
    }

    /// Evaluate the filter against a recipient
    pub fn matches(&self, recipient: &Recipient) -> bool {
        match self {
            Filter::Eq { field, value } if field == ID_FIELD => identity_matches(recipient, value),
            Filter::Eq { field, value } => recipient.value_of(field).as_ref() == Some(value),
            Filter::In { field, values } if field == ID_FIELD => {
                values.iter().any(|value| identity_matches(recipient, value))
            }
            Filter::In { field, values } => recipient
                .value_of(field)
                .map_or(false, |actual| values.contains(&actual)),
            Filter::Exists { field } => recipient.value_of(field).is_some(),
            Filter::All { filters } => filters.iter().all(|f| f.matches(recipient)),
            Filter::Any { filters } => filters.iter().any(|f| f.matches(recipient)),
            Filter::Not { filter } => !filter.matches(recipient),
        }
    }

    /// Reject filters no directory can evaluate
    pub fn validate(&self) -> Result<(), DirectoryError> {
        match self {
            Filter::Eq { field, .. } | Filter::In { field, .. } | Filter::Exists { field } => {
                if field.trim().is_empty() {
                    return Err(DirectoryError::InvalidFilter(
                        "filter field cannot be empty".to_string(),
                    ));
                }
                Ok(())
            }
            Filter::All { filters } | Filter::Any { filters } => {
                filters.iter().try_for_each(Filter::validate)
            }
            Filter::Not { filter } => filter.validate(),
        }
    }
}

/// Field name that addresses the recipient identity
pub const ID_FIELD: &str = "id";

/// Text form of a value compared against the identity key
///
/// Strings and numbers have one; other JSON values never match an identity.
pub fn identity_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn identity_matches(recipient: &Recipient, value: &Value) -> bool {
    identity_text(value).map_or(false, |id| id == recipient.id)
}
