//! Request intake: idempotency, capability and authorization gates, envelope
//! assembly and publish.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        bus::MessageBus, store::StatusStore, template::TemplateStore, user::UserDirectory,
    },
    error::IntakeError,
    models::{
        notification::{
            Channel, DeliveryTarget, NotificationEnvelope, NotificationRequest, SubmitOutcome,
        },
        status::NotificationStatus,
        user::UserRecord,
        validation::{validate_email_address, validate_fcm_token, validate_request},
    },
    status::StatusTracker,
};

const RESERVED_PREFIX: &str = "reserved:";
const MAX_RESERVE_ATTEMPTS: usize = 3;
const RESERVATION_POLL_INTERVAL: Duration = Duration::from_millis(25);
const RESERVATION_WAIT: Duration = Duration::from_secs(2);

pub fn request_key(request_id: &str) -> String {
    format!("request:{}", request_id)
}

/// Idempotency marker as seen by a concurrent duplicate.
enum MarkerState {
    Final(String),
    InFlight(String),
    Released,
}

pub struct Dispatcher {
    store: Arc<dyn StatusStore>,
    bus: Arc<dyn MessageBus>,
    users: Arc<dyn UserDirectory>,
    templates: Arc<dyn TemplateStore>,
    tracker: StatusTracker,
    idempotency_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StatusStore>,
        bus: Arc<dyn MessageBus>,
        users: Arc<dyn UserDirectory>,
        templates: Arc<dyn TemplateStore>,
        tracker: StatusTracker,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            users,
            templates,
            tracker,
            idempotency_ttl,
        }
    }

    /// Accepts a request for asynchronous delivery.
    ///
    /// A replay of an already seen `request_id` answers with the original
    /// notification id and `duplicate: true` without any further side effect.
    /// A replay racing an unfinished original waits for its outcome. Every
    /// rejection after the marker was reserved releases it again.
    pub async fn submit(
        &self,
        request: NotificationRequest,
        caller_id: &str,
        correlation_id: Option<String>,
    ) -> Result<SubmitOutcome, IntakeError> {
        validate_request(&request)?;

        let correlation_id = correlation_id
            .filter(|cid| !cid.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let notification_id = Uuid::new_v4().to_string();
        let marker_key = request_key(&request.request_id);
        let reservation = format!("{}{}", RESERVED_PREFIX, notification_id);

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let reserved = self
                .store
                .set_if_absent(&marker_key, &reservation, self.idempotency_ttl)
                .await?;

            if reserved {
                let result = self
                    .admit(&request, caller_id, &notification_id, &correlation_id)
                    .await;

                if let Err(e) = &result {
                    info!(
                        request_id = %request.request_id,
                        correlation_id = %correlation_id,
                        error = %e,
                        "Notification request rejected"
                    );
                    self.release(&marker_key).await;
                }

                return result;
            }

            match self.await_marker(&marker_key).await? {
                MarkerState::Final(existing_id) => {
                    return Ok(self.duplicate(&request, existing_id, correlation_id));
                }
                // The original was rejected, so this submission competes again.
                MarkerState::Released => continue,
                MarkerState::InFlight(existing_id) => {
                    // A published request whose finalize failed keeps its
                    // reservation but has a status record.
                    let published = self
                        .tracker
                        .get(&existing_id)
                        .await
                        .map_err(|e| IntakeError::DependencyUnavailable(e.to_string()))?
                        .is_some();

                    if published {
                        return Ok(self.duplicate(&request, existing_id, correlation_id));
                    }

                    return Err(IntakeError::DependencyUnavailable(format!(
                        "request {} is still being processed",
                        request.request_id
                    )));
                }
            }
        }

        Err(IntakeError::DependencyUnavailable(format!(
            "idempotency marker for request {} is contended",
            request.request_id
        )))
    }

    /// Whether `request_id` already holds an idempotency marker. An unreachable
    /// store counts as unknown.
    pub async fn is_known_request(&self, request_id: &str) -> bool {
        match self.store.get(&request_key(request_id)).await {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                debug!(request_id, error = %e, "Idempotency marker lookup failed");
                false
            }
        }
    }

    async fn admit(
        &self,
        request: &NotificationRequest,
        caller_id: &str,
        notification_id: &str,
        correlation_id: &str,
    ) -> Result<SubmitOutcome, IntakeError> {
        let user = self
            .users
            .get_user(&request.user_id, correlation_id)
            .await
            .map_err(|e| IntakeError::DependencyUnavailable(format!("user directory: {}", e)))?
            .ok_or_else(|| IntakeError::not_found("User", &request.user_id))?;

        if !user.accepts(request.channel) {
            return Err(IntakeError::ChannelDisabled {
                user_id: request.user_id.clone(),
                channel: request.channel,
            });
        }

        let target = resolve_target(&user, request.channel)?;

        if caller_id != request.user_id {
            return Err(IntakeError::Authorization(format!(
                "caller {} may not send notifications for user {}",
                caller_id, request.user_id
            )));
        }

        let template = self
            .templates
            .get_template(&request.template_code, correlation_id)
            .await
            .map_err(|e| IntakeError::DependencyUnavailable(format!("template store: {}", e)))?
            .ok_or_else(|| IntakeError::not_found("Template", &request.template_code))?;

        let now = Utc::now();
        let envelope = NotificationEnvelope {
            notification_id: notification_id.to_string(),
            request_id: request.request_id.clone(),
            user_id: request.user_id.clone(),
            channel: request.channel,
            template_code: request.template_code.clone(),
            variables: request.variables.clone(),
            priority: request.priority,
            metadata: request.metadata.clone(),
            target,
            template,
            correlation_id: correlation_id.to_string(),
            created_at: now,
            timestamp: now,
        };

        self.tracker.initialize(&envelope).await?;

        if let Err(e) = self.bus.publish(&envelope).await {
            if let Err(discard_err) = self.tracker.discard(notification_id).await {
                warn!(
                    notification_id,
                    error = %discard_err,
                    "Failed to remove status of unpublished notification"
                );
            }
            return Err(e.into());
        }

        // Already published: a failed finalize leaves the reservation, and
        // duplicates fall back to the status record once their wait expires.
        if let Err(e) = self
            .store
            .put(
                &request_key(&request.request_id),
                notification_id,
                self.idempotency_ttl,
            )
            .await
        {
            warn!(
                notification_id,
                error = %e,
                "Failed to finalize idempotency marker"
            );
        }

        info!(
            notification_id,
            request_id = %request.request_id,
            channel = %request.channel,
            correlation_id,
            "Notification queued"
        );

        Ok(SubmitOutcome {
            notification_id: notification_id.to_string(),
            status: NotificationStatus::Pending,
            duplicate: false,
            correlation_id: correlation_id.to_string(),
        })
    }

    /// Waits for a reserved marker to be finalized or released by the
    /// submission holding it.
    async fn await_marker(&self, marker_key: &str) -> Result<MarkerState, IntakeError> {
        let deadline = Instant::now() + RESERVATION_WAIT;

        loop {
            let Some(value) = self.store.get(marker_key).await? else {
                return Ok(MarkerState::Released);
            };

            match value.strip_prefix(RESERVED_PREFIX) {
                None => return Ok(MarkerState::Final(value)),
                Some(id) if Instant::now() >= deadline => {
                    return Ok(MarkerState::InFlight(id.to_string()));
                }
                Some(_) => sleep(RESERVATION_POLL_INTERVAL).await,
            }
        }
    }

    fn duplicate(
        &self,
        request: &NotificationRequest,
        notification_id: String,
        correlation_id: String,
    ) -> SubmitOutcome {
        info!(
            request_id = %request.request_id,
            notification_id = %notification_id,
            correlation_id = %correlation_id,
            "Duplicate notification request"
        );

        SubmitOutcome {
            notification_id,
            status: NotificationStatus::Pending,
            duplicate: true,
            correlation_id,
        }
    }

    async fn release(&self, marker_key: &str) {
        if let Err(e) = self.store.delete(marker_key).await {
            warn!(marker_key, error = %e, "Failed to release idempotency marker");
        } else {
            debug!(marker_key, "Idempotency marker released");
        }
    }
}

fn resolve_target(user: &UserRecord, channel: Channel) -> Result<DeliveryTarget, IntakeError> {
    match channel {
        Channel::Email => {
            let address = user.email_address.as_deref().ok_or_else(|| {
                IntakeError::Validation(format!("user {} has no email address", user.id))
            })?;
            validate_email_address(address)?;
            Ok(DeliveryTarget::EmailAddress(address.to_string()))
        }
        Channel::Push => {
            let token = user.push_token.as_deref().ok_or_else(|| {
                IntakeError::Validation(format!("user {} has no push token", user.id))
            })?;
            validate_fcm_token(token)?;
            Ok(DeliveryTarget::DeviceToken(token.to_string()))
        }
    }
}
