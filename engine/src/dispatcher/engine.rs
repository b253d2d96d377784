// Dispatcher: schedule and fire orchestration

use super::report::{DeliveredPair, FireReport, PairFailure, ScheduleOutcome};
use crate::config::DispatchConfig;
use crate::definition::NotificationDefinition;
use crate::delivery::BackendRegistry;
use crate::directory::UserDirectory;
use crate::errors::{DefinitionError, DispatchError, NotificationError};
use crate::models::{
    pair_idempotency_key, Context, FireEvent, JobHandle, LifecycleState, Recipient,
    RenderedPayload, ScheduleRequest, TriggerOverrides,
};
use crate::queue::FireQueue;
use crate::registry::NotificationRegistry;
use crate::render::Renderer;
use crate::scope::resolve_recipients;
use crate::telemetry;
use crate::template::build_render_context;
use crate::trigger::{DispatchTime, RecurrenceRule};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Dispatcher composes scope, trigger and template resolution
///
/// It holds no per-call state, so `schedule` and `fire` may run concurrently
/// and repeatedly for the same event.
pub struct Dispatcher {
    registry: Arc<NotificationRegistry>,
    directory: Arc<dyn UserDirectory>,
    renderer: Arc<dyn Renderer>,
    backends: BackendRegistry,
    queue: Arc<dyn FireQueue>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher; every backend named by a definition needs an adapter
    pub fn new(
        registry: Arc<NotificationRegistry>,
        directory: Arc<dyn UserDirectory>,
        renderer: Arc<dyn Renderer>,
        backends: BackendRegistry,
        queue: Arc<dyn FireQueue>,
        config: DispatchConfig,
    ) -> Result<Self, DefinitionError> {
        for definition in registry.definitions() {
            for backend in definition.backends() {
                if !backends.contains(backend) {
                    return Err(DefinitionError::MissingBackendAdapter {
                        notification: definition.name().to_string(),
                        backend: backend.clone(),
                    });
                }
            }
        }

        Ok(Self {
            registry,
            directory,
            renderer,
            backends,
            queue,
            config,
        })
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    fn lookup(&self, notification: &str) -> Result<Arc<NotificationDefinition>, NotificationError> {
        self.registry
            .get(notification)
            .ok_or_else(|| NotificationError::UnknownNotification(notification.to_string()))
    }

    /// Validate a request, resolve its dispatch time and fire or queue it
    ///
    /// Validation failures return before anything is queued or delivered.
    #[instrument(skip(self, request), fields(notification = %request.notification))]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleOutcome, NotificationError> {
        let ScheduleRequest {
            notification,
            context,
            backends,
            overrides,
            created_at,
        } = request;

        let dispatch = self
            .resolve_dispatch(&notification, &context, backends.as_deref(), &overrides, created_at)
            .map_err(|e| {
                warn!(state = ?LifecycleState::FailedValidation, error = %e, "Schedule rejected");
                e
            })?;
        info!(state = ?LifecycleState::TimeResolved, dispatch = ?dispatch, "Dispatch time resolved");

        match dispatch {
            DispatchTime::Immediate if !self.config.route_immediate_through_queue => {
                telemetry::record_scheduled(&notification, "immediate");
                let event = FireEvent::new(notification, context, backends, Some(created_at))
                    .with_created_at(created_at);
                let report = self.fire_event(&event).await?;
                Ok(ScheduleOutcome::Fired(report))
            }
            DispatchTime::Immediate => {
                let event = FireEvent::new(notification, context, backends, Some(created_at))
                    .with_created_at(created_at);
                let handle = self.enqueue_at(event, created_at).await?;
                Ok(ScheduleOutcome::Queued(handle))
            }
            DispatchTime::At(at) => {
                let event = FireEvent::new(notification, context, backends, Some(at))
                    .with_created_at(created_at);
                let handle = self.enqueue_at(event, at).await?;
                Ok(ScheduleOutcome::Queued(handle))
            }
            DispatchTime::Recurring { rule, first } => {
                let event = FireEvent::new(notification.clone(), context, backends, Some(first))
                    .with_recurrence(rule.clone())
                    .with_created_at(created_at);
                let handle = self.queue.enqueue_recurring(event, rule).await?;

                telemetry::record_scheduled(&notification, "recurring");
                info!(
                    state = ?LifecycleState::Queued,
                    job_id = %handle.id,
                    fire_at = %handle.fire_at,
                    "Recurring notification registered"
                );
                Ok(ScheduleOutcome::Recurring(handle))
            }
        }
    }

    fn resolve_dispatch(
        &self,
        notification: &str,
        context: &Context,
        backends: Option<&[String]>,
        overrides: &TriggerOverrides,
        created_at: DateTime<Utc>,
    ) -> Result<DispatchTime, NotificationError> {
        let definition = self.lookup(notification)?;
        if let Some(requested) = backends {
            definition.validate_backend_override(requested)?;
        }
        definition.scope().check_context(context)?;

        Ok(definition.trigger().compute(created_at, overrides)?)
    }

    async fn enqueue_at(&self, event: FireEvent, at: DateTime<Utc>) -> Result<JobHandle, NotificationError> {
        let notification = event.notification.clone();
        let handle = self.queue.enqueue(event, at).await?;

        telemetry::record_scheduled(&notification, "queued");
        info!(
            state = ?LifecycleState::Queued,
            job_id = %handle.id,
            fire_at = %handle.fire_at,
            "Notification queued"
        );
        Ok(handle)
    }

    /// Fire a notification now, outside the queue
    pub async fn fire(
        &self,
        notification: &str,
        context: Context,
        backends: Option<Vec<String>>,
    ) -> Result<FireReport, NotificationError> {
        let event = FireEvent::new(notification, context, backends, None);
        self.fire_event(&event).await
    }

    /// Fire a queued event
    ///
    /// The definition is looked up again and scope is resolved fresh. Failures
    /// of single (recipient, backend) pairs are recorded in the report; only
    /// errors that affect the whole event are returned.
    #[instrument(skip(self, event), fields(
        notification = %event.notification,
        event_id = %event.event_id,
    ))]
    pub async fn fire_event(&self, event: &FireEvent) -> Result<FireReport, NotificationError> {
        let started = Instant::now();
        info!(state = ?LifecycleState::Firing, "Firing notification");

        let definition = self.lookup(&event.notification)?;
        let backends = definition.effective_backends(event.backends.as_deref());
        if backends.is_empty() {
            warn!(
                requested = ?event.backends,
                "No requested backend is declared by the notification any more"
            );
        }

        let recipients = resolve_recipients(
            definition.name(),
            definition.scope(),
            definition.filter_scope(),
            self.directory.as_ref(),
            &event.context,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Scope resolution failed");
            e
        })?;
        telemetry::record_recipients(definition.name(), recipients.len());

        let mut report = FireReport::new(definition.name(), event.event_id.clone());
        report.recipients = recipients.len();
        report.backends = backends.clone();

        // Re-arm first so a failed re-arm is retried with the whole event
        if let Some(rule) = &event.recurrence {
            report.rearmed = self.rearm(event, rule).await?;
        }

        report.state = LifecycleState::Dispatching;
        info!(
            state = ?report.state,
            recipients = recipients.len(),
            backends = ?backends,
            "Dispatching to recipients"
        );

        let definition_ref: &NotificationDefinition = &definition;
        let pairs: Vec<(&Recipient, &String)> = recipients
            .iter()
            .flat_map(|recipient| backends.iter().map(move |backend| (recipient, backend)))
            .collect();

        let deliveries: Vec<_> = pairs
            .into_iter()
            .map(|(recipient, backend)| async move {
                let result = self
                    .dispatch_pair(definition_ref, event, recipient, backend)
                    .await;
                (recipient.id.clone(), backend.clone(), result)
            })
            .collect();

        let outcomes: Vec<(String, String, Result<(), DispatchError>)> = stream::iter(deliveries)
            .buffer_unordered(self.config.max_concurrent_deliveries.max(1))
            .collect()
            .await;

        for (recipient_id, backend, result) in outcomes {
            match result {
                Ok(()) => {
                    telemetry::record_delivered(definition.name(), &backend);
                    report.delivered.push(DeliveredPair {
                        recipient_id,
                        backend,
                    });
                }
                Err(error) => {
                    warn!(
                        recipient_id = %recipient_id,
                        backend = %backend,
                        reason = error.reason(),
                        error = %error,
                        "Delivery failed"
                    );
                    telemetry::record_delivery_failed(definition.name(), &backend, error.reason());
                    report.failures.push(PairFailure {
                        recipient_id,
                        backend,
                        error,
                    });
                }
            }
        }

        report.finish();
        telemetry::record_fire_duration(definition.name(), started.elapsed().as_secs_f64());
        info!(
            state = ?report.state,
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            "Fire complete"
        );

        Ok(report)
    }

    /// Queue the occurrence after the one being fired, if the rule has one
    ///
    /// The next occurrence is derived from the event's own instant, so
    /// redelivered copies re-arm the same occurrence.
    async fn rearm(
        &self,
        event: &FireEvent,
        rule: &RecurrenceRule,
    ) -> Result<Option<JobHandle>, NotificationError> {
        let after = event.fire_at.unwrap_or_else(Utc::now);
        let Some(next) = rule.next_after(after)? else {
            info!(expression = %rule.expression, "Recurrence exhausted; not re-arming");
            return Ok(None);
        };

        let handle = self
            .queue
            .enqueue_recurring(event.next_occurrence(next), rule.clone())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to re-arm recurring notification");
                e
            })?;

        info!(job_id = %handle.id, fire_at = %handle.fire_at, "Next occurrence armed");
        Ok(Some(handle))
    }

    async fn dispatch_pair(
        &self,
        definition: &NotificationDefinition,
        event: &FireEvent,
        recipient: &Recipient,
        backend: &str,
    ) -> Result<(), DispatchError> {
        let adapter = self
            .backends
            .get(backend)
            .ok_or_else(|| DispatchError::UnknownBackend(backend.to_string()))?;

        let template_id = definition.template_for(backend)?;
        let render_context = build_render_context(
            definition.name(),
            definition.context_builder(),
            recipient,
            backend,
            &event.context,
        )?;
        let body = self.renderer.render(template_id, &render_context).await?;

        let payload = RenderedPayload {
            notification: definition.name().to_string(),
            backend: backend.to_string(),
            template_id: template_id.to_string(),
            body,
            idempotency_key: pair_idempotency_key(&event.event_id, &recipient.id, backend),
        };

        adapter.deliver(recipient, &payload).await?;
        Ok(())
    }
}
