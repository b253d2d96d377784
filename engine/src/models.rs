use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::trigger::RecurrenceRule;

/// Runtime context passed to `schedule` and carried unchanged to `fire`
pub type Context = Map<String, Value>;

/// Final key/value mapping handed to the renderer for one (recipient, backend) pair
pub type RenderContext = Map<String, Value>;

/// Key under which the recipient is injected into every render context
pub const RECIPIENT_KEY: &str = "recipient";

// ============================================================================
// Recipients
// ============================================================================

/// Recipient is an identity drawn from the user directory
///
/// `attributes` are serialized next to `id`, so a template can address
/// `{{ recipient.email }}` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Value of a filterable field; `id` resolves to the identity key
    pub fn value_of(&self, field: &str) -> Option<Value> {
        if field == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.attributes.get(field).cloned()
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Per-call trigger overrides
///
/// Precedence: `eta` > `recurrence` > `delay` > the notification's own trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::trigger::optional_duration_seconds"
    )]
    pub delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
}

impl TriggerOverrides {
    pub fn is_empty(&self) -> bool {
        self.eta.is_none() && self.delay.is_none() && self.recurrence.is_none()
    }
}

/// ScheduleRequest is the input of a single `schedule` call
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub notification: String,
    pub context: Context,
    pub backends: Option<Vec<String>>,
    pub overrides: TriggerOverrides,
    pub created_at: DateTime<Utc>,
}

impl ScheduleRequest {
    pub fn new(notification: impl Into<String>, context: Context) -> Self {
        Self {
            notification: notification.into(),
            context,
            backends: None,
            overrides: TriggerOverrides::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backends = Some(backends.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.overrides.delay = Some(delay);
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.overrides.eta = Some(eta);
        self
    }

    pub fn with_recurrence(mut self, rule: RecurrenceRule) -> Self {
        self.overrides.recurrence = Some(rule);
        self
    }

    /// Pin the scheduling moment (defaults to construction time)
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// FireEvent is the payload the queue round-trips from schedule time to fire time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    /// Deterministic idempotency key for this occurrence
    pub event_id: String,
    pub notification: String,
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backends: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
    pub created_at: DateTime<Utc>,
}

impl FireEvent {
    pub fn new(
        notification: impl Into<String>,
        context: Context,
        backends: Option<Vec<String>>,
        fire_at: Option<DateTime<Utc>>,
    ) -> Self {
        let notification = notification.into();
        let event_id = idempotency_key(&notification, &context, backends.as_deref(), fire_at);
        Self {
            event_id,
            notification,
            context,
            backends,
            fire_at,
            recurrence: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_recurrence(mut self, rule: RecurrenceRule) -> Self {
        self.recurrence = Some(rule);
        self
    }

    /// Carry the moment the originating request was scheduled
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Copy of this event re-armed for a later occurrence
    pub fn next_occurrence(&self, fire_at: DateTime<Utc>) -> Self {
        let mut next = FireEvent::new(
            self.notification.clone(),
            self.context.clone(),
            self.backends.clone(),
            Some(fire_at),
        );
        next.recurrence = self.recurrence.clone();
        next.created_at = self.created_at;
        next
    }

    /// Whether the event should be fired at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at.map_or(true, |at| at <= now)
    }
}

/// Compute the idempotency key for a fire occurrence
///
/// `Context` is a sorted map, so the JSON encoding is canonical.
pub fn idempotency_key(
    notification: &str,
    context: &Context,
    backends: Option<&[String]>,
    fire_at: Option<DateTime<Utc>>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(notification.as_bytes());
    hasher.update([0u8]);
    hasher.update(Value::Object(context.clone()).to_string().as_bytes());
    hasher.update([0u8]);
    if let Some(backends) = backends {
        hasher.update(backends.join(",").as_bytes());
    }
    hasher.update([0u8]);
    if let Some(at) = fire_at {
        hasher.update(at.to_rfc3339().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// Idempotency key of one (recipient, backend) delivery within an occurrence
pub fn pair_idempotency_key(event_id: &str, recipient_id: &str, backend: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(recipient_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(backend.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// JobHandle identifies a job handed to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub fire_at: DateTime<Utc>,
    pub recurring: bool,
}

// ============================================================================
// Dispatch
// ============================================================================

/// Rendered content handed to a delivery backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPayload {
    pub notification: String,
    pub backend: String,
    pub template_id: String,
    pub body: String,
    /// Stable per (event, recipient, backend); backends deduplicate sends with it
    pub idempotency_key: String,
}

/// Lifecycle of a scheduled notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Requested,
    TimeResolved,
    Queued,
    Firing,
    Dispatching,
    Complete,
    FailedValidation,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Complete | LifecycleState::FailedValidation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn context(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_recipient_serializes_flat() {
        let recipient = Recipient::new("u1").with_attribute("email", "a@example.com");
        let value = serde_json::to_value(&recipient).unwrap();
        assert_eq!(value, json!({"id": "u1", "email": "a@example.com"}));
    }

    #[test]
    fn test_recipient_value_of_id() {
        let recipient = Recipient::new("u1").with_attribute("team", "ops");
        assert_eq!(recipient.value_of("id"), Some(json!("u1")));
        assert_eq!(recipient.value_of("team"), Some(json!("ops")));
        assert_eq!(recipient.value_of("missing"), None);
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let ctx = context(json!({"b": 2, "a": 1}));
        let at = Utc::now();
        let k1 = idempotency_key("welcome", &ctx, None, Some(at));
        let k2 = idempotency_key("welcome", &ctx, None, Some(at));
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_idempotency_key_varies_with_occurrence() {
        let ctx = context(json!({"a": 1}));
        let at = Utc::now();
        let k1 = idempotency_key("welcome", &ctx, None, Some(at));
        let k2 = idempotency_key("welcome", &ctx, None, Some(at + Duration::hours(1)));
        let k3 = idempotency_key("welcome", &ctx, Some(&["email".to_string()]), Some(at));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_pair_key_distinguishes_pairs() {
        let a = pair_idempotency_key("evt", "u1", "email");
        assert_eq!(a, pair_idempotency_key("evt", "u1", "email"));
        assert_ne!(a, pair_idempotency_key("evt", "u1", "sms"));
        assert_ne!(a, pair_idempotency_key("evt", "u2", "email"));
    }

    #[test]
    fn test_fire_event_is_due() {
        let now = Utc::now();
        let past = FireEvent::new("n", Context::new(), None, Some(now - Duration::seconds(1)));
        let future = FireEvent::new("n", Context::new(), None, Some(now + Duration::minutes(5)));
        let unscheduled = FireEvent::new("n", Context::new(), None, None);
        assert!(past.is_due(now));
        assert!(!future.is_due(now));
        assert!(unscheduled.is_due(now));
    }

    #[test]
    fn test_next_occurrence_keeps_scheduling_moment() {
        let scheduled = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let first = Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap();
        let event = FireEvent::new("digest", Context::new(), None, Some(first)).with_created_at(scheduled);

        let next = event.next_occurrence(first + Duration::days(1));
        assert_eq!(next.created_at, scheduled);
        assert_ne!(next.event_id, event.event_id);
    }

    #[test]
    fn test_schedule_request_builder() {
        let eta = Utc::now();
        let request = ScheduleRequest::new("welcome", Context::new())
            .with_backends(["email"])
            .with_delay(Duration::hours(1))
            .with_eta(eta);
        assert_eq!(request.backends, Some(vec!["email".to_string()]));
        assert_eq!(request.overrides.delay, Some(Duration::hours(1)));
        assert_eq!(request.overrides.eta, Some(eta));
        assert!(!request.overrides.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(LifecycleState::Complete.is_terminal());
        assert!(LifecycleState::FailedValidation.is_terminal());
        assert!(!LifecycleState::Queued.is_terminal());
    }
}
