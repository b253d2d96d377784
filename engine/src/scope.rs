// Scope resolution: who receives a notification
//
// Scope is evaluated against the directory on every fire, never at schedule
// time, so recipients added or removed in between are honoured.

use crate::directory::{Filter, UserDirectory};
use crate::errors::NotificationError;
use crate::models::{Context, Recipient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// ScopeResolver is the capability custom scopes implement
#[async_trait]
pub trait ScopeResolver: Send + Sync + fmt::Debug {
    async fn resolve(
        &self,
        directory: &dyn UserDirectory,
        context: &Context,
    ) -> Result<Vec<Recipient>, NotificationError>;

    /// Context keys that must be present for `resolve` to succeed
    fn required_context_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// ScopeFilter refines the candidates a scope produced
///
/// Any `Fn(Vec<Recipient>, &Context) -> Result<Vec<Recipient>, NotificationError>`
/// closure is a `ScopeFilter`.
pub trait ScopeFilter: Send + Sync {
    fn refine(
        &self,
        candidates: Vec<Recipient>,
        context: &Context,
    ) -> Result<Vec<Recipient>, NotificationError>;
}

impl<F> ScopeFilter for F
where
    F: Fn(Vec<Recipient>, &Context) -> Result<Vec<Recipient>, NotificationError> + Send + Sync,
{
    fn refine(
        &self,
        candidates: Vec<Recipient>,
        context: &Context,
    ) -> Result<Vec<Recipient>, NotificationError> {
        self(candidates, context)
    }
}

/// Audience selection policy of a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// Every recipient in the directory
    AllUsers,
    /// Recipients matching a fixed filter; no filter means everyone
    Query {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
    },
    /// Recipients whose `lookup_field` equals `context[context_key]`
    ContextField {
        context_key: String,
        lookup_field: String,
    },
    #[serde(skip)]
    Custom(Arc<dyn ScopeResolver>),
}

impl Default for Scope {
    fn default() -> Self {
        Scope::AllUsers
    }
}

impl Scope {
    pub fn query(filter: Filter) -> Self {
        Scope::Query {
            filter: Some(filter),
        }
    }

    pub fn context_field(context_key: impl Into<String>, lookup_field: impl Into<String>) -> Self {
        Scope::ContextField {
            context_key: context_key.into(),
            lookup_field: lookup_field.into(),
        }
    }

    pub fn custom(resolver: impl ScopeResolver + 'static) -> Self {
        Scope::Custom(Arc::new(resolver))
    }

    pub fn required_context_keys(&self) -> Vec<String> {
        match self {
            Scope::AllUsers | Scope::Query { .. } => Vec::new(),
            Scope::ContextField { context_key, .. } => vec![context_key.clone()],
            Scope::Custom(resolver) => resolver.required_context_keys(),
        }
    }

    /// Check that `context` carries every key this scope reads
    pub fn check_context(&self, context: &Context) -> Result<(), NotificationError> {
        for key in self.required_context_keys() {
            if !context.contains_key(&key) {
                return Err(NotificationError::MissingContextKey(key));
            }
        }
        Ok(())
    }

    /// Candidate recipients before the definition's refinement hook
    pub async fn candidates(
        &self,
        directory: &dyn UserDirectory,
        context: &Context,
    ) -> Result<Vec<Recipient>, NotificationError> {
        match self {
            Scope::AllUsers => Ok(directory.query(None).await?),
            Scope::Query { filter } => Ok(directory.query(filter.as_ref()).await?),
            Scope::ContextField {
                context_key,
                lookup_field,
            } => {
                let value = context
                    .get(context_key)
                    .ok_or_else(|| NotificationError::MissingContextKey(context_key.clone()))?;
                let filter = Filter::eq(lookup_field.clone(), value.clone());
                Ok(directory.query(Some(&filter)).await?)
            }
            Scope::Custom(resolver) => resolver.resolve(directory, context).await,
        }
    }
}

/// Resolve the final recipient list for a notification
///
/// Applies the scope, then the optional refinement, then de-duplicates and
/// sorts by identity key.
#[instrument(skip_all, fields(notification = %notification))]
pub async fn resolve_recipients(
    notification: &str,
    scope: &Scope,
    refine: Option<&dyn ScopeFilter>,
    directory: &dyn UserDirectory,
    context: &Context,
) -> Result<Vec<Recipient>, NotificationError> {
    let mut candidates = scope.candidates(directory, context).await?;

    if let Some(refine) = refine {
        candidates = refine.refine(candidates, context)?;
    }

    let recipients = normalize(candidates);
    debug!(count = recipients.len(), "Scope resolved");
    Ok(recipients)
}

/// De-duplicate by identity key (first occurrence wins) and sort by it
pub fn normalize(candidates: Vec<Recipient>) -> Vec<Recipient> {
    let mut by_id: BTreeMap<String, Recipient> = BTreeMap::new();
    for recipient in candidates {
        by_id.entry(recipient.id.clone()).or_insert(recipient);
    }
    by_id.into_values().collect()
}
