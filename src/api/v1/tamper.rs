use axum::{
    extract::{Path, State},
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    config::LifecyclePolicy,
    error::{Error, Resource},
    notify::{DynNotifier, Notification},
    store::{AlertFilter, DynStore},
    util::{now, FormattedDateTime, JsonBody, ObjectIdString, PathObjectId, QueryParams},
};

use super::{
    auth::{UserModel, UserRole},
    custody::HandoverRecordModel,
    lifecycle::ParcelStatus,
    parcel::{ParcelModel, ParcelResponse},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    SkippedHandler,
    CustodyTimeout,
    CheckpointMismatch,
    Escalation,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TamperAlertModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub parcel_id: ObjectId,
    pub parcel_tracking_id: String,
    pub handler_id: ObjectId,
    pub handler_name: String,

    pub alert_type: AlertType,
    pub description: String,
    pub location: String,
    pub timestamp: bson::DateTime,

    pub resolved: bool,
    pub resolved_by: Option<ObjectId>,
    pub resolved_at: Option<bson::DateTime>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TamperAlertResponse {
    pub id: ObjectIdString,

    pub parcel_id: ObjectIdString,
    pub parcel_tracking_id: String,
    pub handler_id: ObjectIdString,
    pub handler_name: String,

    pub alert_type: AlertType,
    pub description: String,
    pub location: String,
    pub timestamp: FormattedDateTime,

    pub resolved: bool,
    pub resolved_by: Option<ObjectIdString>,
    pub resolved_at: Option<FormattedDateTime>,
}

impl From<TamperAlertModel> for TamperAlertResponse {
    fn from(value: TamperAlertModel) -> Self {
        Self {
            id: value.id.into(),
            parcel_id: value.parcel_id.into(),
            parcel_tracking_id: value.parcel_tracking_id,
            handler_id: value.handler_id.into(),
            handler_name: value.handler_name,
            alert_type: value.alert_type,
            description: value.description,
            location: value.location,
            timestamp: value.timestamp.into(),
            resolved: value.resolved,
            resolved_by: value.resolved_by.map(Into::into),
            resolved_at: value.resolved_at.map(Into::into),
        }
    }
}

struct Suspicion<'a> {
    alert_type: AlertType,
    description: String,
    location: &'a str,
    timestamp: bson::DateTime,
}

fn raise(
    parcel: &ParcelModel,
    actor: &UserModel,
    suspicion: Suspicion<'_>,
    open_alerts: usize,
    policy: &LifecyclePolicy,
) -> TamperAlertModel {
    let Suspicion {
        alert_type,
        description,
        location,
        timestamp,
    } = suspicion;

    let (alert_type, description) = if open_alerts >= policy.escalation_threshold {
        (
            AlertType::Escalation,
            format!("{description} ({open_alerts} unresolved alerts)"),
        )
    } else {
        (alert_type, description)
    };

    TamperAlertModel {
        id: ObjectId::new(),
        parcel_id: parcel.id,
        parcel_tracking_id: parcel.tracking_id.clone(),
        handler_id: actor.id,
        handler_name: actor.name.clone(),
        alert_type,
        description,
        location: location.to_string(),
        timestamp,
        resolved: false,
        resolved_by: None,
        resolved_at: None,
    }
}

/// Custody rules for a record about to be appended after `history`.
///
/// The previous record names who holds the parcel. A different handler moving
/// it is a skipped handoff; the holder moving it after the custody window is a
/// timeout. Administrators act outside the custody chain and are not flagged.
pub fn evaluate(
    parcel: &ParcelModel,
    record: &HandoverRecordModel,
    history: &[HandoverRecordModel],
    actor: &UserModel,
    open_alerts: usize,
    policy: &LifecyclePolicy,
) -> Option<TamperAlertModel> {
    if actor.role == UserRole::Admin {
        return None;
    }

    let previous = history.last()?;

    let (alert_type, description) = if record.actor_id != previous.to_handler_id {
        (
            AlertType::SkippedHandler,
            format!(
                "{} moved parcel {} to {} while it was in the custody of handler {}",
                actor.name, parcel.tracking_id, record.to_status, previous.to_handler_id
            ),
        )
    } else {
        let held_ms = record.timestamp.timestamp_millis() - previous.timestamp.timestamp_millis();
        if i128::from(held_ms) <= policy.custody_window.whole_milliseconds() {
            return None;
        }

        (
            AlertType::CustodyTimeout,
            format!(
                "{} held parcel {} for {} hours, longer than the {} hour custody window",
                actor.name,
                parcel.tracking_id,
                held_ms / 3_600_000,
                policy.custody_window.whole_hours()
            ),
        )
    };

    Some(raise(
        parcel,
        actor,
        Suspicion {
            alert_type,
            description,
            location: &record.location,
            timestamp: record.timestamp,
        },
        open_alerts,
        policy,
    ))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRequest {
    pub checkpoint: ParcelStatus,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub valid: bool,
    pub message: String,
    pub parcel: ParcelResponse,
    pub alert: Option<TamperAlertResponse>,
}

#[tracing::instrument(skip_all, fields(tracking_id = %tracking_id, handler = %user.id))]
pub async fn verify_checkpoint(
    State(store): State<DynStore>,
    State(notifier): State<DynNotifier>,
    State(policy): State<LifecyclePolicy>,
    user: UserModel,
    Path(tracking_id): Path<String>,
    JsonBody(request): JsonBody<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>, Error> {
    match user.role {
        UserRole::Sender => return Err(Error::NotAuthorized),
        UserRole::Handler | UserRole::Admin => {}
    }

    let parcel = store
        .find_parcel_by_tracking_id(&tracking_id)
        .await?
        .ok_or_else(|| Error::NotFound(Resource::Parcel(tracking_id.clone())))?;

    if parcel.status == request.checkpoint {
        return Ok(Json(CheckpointResponse {
            valid: true,
            message: "Parcel verified successfully".to_string(),
            parcel: parcel.into(),
            alert: None,
        }));
    }

    let open_alerts = store
        .list_alerts(AlertFilter::open_for(parcel.id))
        .await?
        .len();
    let location = request
        .location
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty())
        .unwrap_or_else(|| "Not specified".to_string());

    let alert = raise(
        &parcel,
        &user,
        Suspicion {
            alert_type: AlertType::CheckpointMismatch,
            description: format!(
                "{} scanned parcel {} expecting {} but it is {}",
                user.name, parcel.tracking_id, request.checkpoint, parcel.status
            ),
            location: &location,
            timestamp: now(),
        },
        open_alerts,
        &policy,
    );

    store.raise_alert(&alert).await?;
    tracing::warn!(alert_type = ?alert.alert_type, "checkpoint mismatch");

    notifier
        .notify(Notification::TamperAlertRaised {
            tracking_id: parcel.tracking_id.clone(),
            alert_id: alert.id,
        })
        .await;

    let message = format!(
        "Parcel is {} but the checkpoint expects {}",
        parcel.status, request.checkpoint
    );

    Ok(Json(CheckpointResponse {
        valid: false,
        message,
        parcel: ParcelModel {
            tampering_flag: true,
            version: parcel.version + 1,
            ..parcel
        }
        .into(),
        alert: Some(alert.into()),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertQuery {
    pub resolved: Option<bool>,
    pub tracking_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AlertIndexResponse {
    pub alerts: Vec<TamperAlertResponse>,
}

pub async fn index(
    State(store): State<DynStore>,
    user: UserModel,
    QueryParams(query): QueryParams<AlertQuery>,
) -> Result<Json<AlertIndexResponse>, Error> {
    match user.role {
        UserRole::Admin => {}
        UserRole::Sender | UserRole::Handler => return Err(Error::NotAuthorized),
    }

    let parcel_id = match query.tracking_id {
        Some(tracking_id) => Some(
            store
                .find_parcel_by_tracking_id(&tracking_id)
                .await?
                .ok_or_else(|| Error::NotFound(Resource::Parcel(tracking_id.clone())))?
                .id,
        ),
        None => None,
    };

    let alerts = store
        .list_alerts(AlertFilter {
            parcel_id,
            resolved: query.resolved,
        })
        .await?;

    Ok(Json(AlertIndexResponse {
        alerts: alerts.into_iter().map(Into::into).collect(),
    }))
}

#[tracing::instrument(skip_all, fields(alert_id = %alert_id, admin = %user.id))]
pub async fn resolve(
    State(store): State<DynStore>,
    user: UserModel,
    PathObjectId(alert_id): PathObjectId,
) -> Result<Json<TamperAlertResponse>, Error> {
    match user.role {
        UserRole::Admin => {}
        UserRole::Sender | UserRole::Handler => return Err(Error::NotAuthorized),
    }

    let alert = store.resolve_alert(alert_id, user.id, now()).await?;
    tracing::info!(tracking_id = %alert.parcel_tracking_id, "tamper alert resolved");

    Ok(Json(alert.into()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{
        extract::Path,
        Json,
    };
    use time::Duration;

    use super::*;
    use crate::api::v1::{
        lifecycle::{transition, TransitionRequest},
        tests::{bootstrap, Bootstrap},
    };

    async fn scan(
        bootstrap: &Bootstrap,
        tracking_id: &str,
        checkpoint: ParcelStatus,
    ) -> CheckpointResponse {
        super::verify_checkpoint(
            bootstrap.store(),
            bootstrap.notifier(),
            bootstrap.policy(),
            bootstrap.user_model.clone(),
            Path(tracking_id.to_string()),
            JsonBody(CheckpointRequest {
                checkpoint,
                location: Some("Gate 4".to_string()),
            }),
        )
        .await
        .unwrap()
        .0
    }

    async fn open_alerts(bootstrap: &Bootstrap) -> Vec<TamperAlertResponse> {
        super::index(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            QueryParams(AlertQuery {
                resolved: Some(false),
                tracking_id: None,
            }),
        )
        .await
        .unwrap()
        .0
        .alerts
    }

    fn record(
        parcel: &ParcelModel,
        sequence: i64,
        to_handler_id: ObjectId,
        actor_id: ObjectId,
        timestamp: bson::DateTime,
    ) -> HandoverRecordModel {
        HandoverRecordModel {
            id: ObjectId::new(),
            parcel_id: parcel.id,
            tracking_id: parcel.tracking_id.clone(),
            sequence,
            from_handler_id: None,
            to_handler_id,
            actor_id,
            from_status: ParcelStatus::Created,
            to_status: ParcelStatus::PickedUp,
            delayed: false,
            location: "Depot".to_string(),
            notes: None,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_evaluate_rules() {
        let bootstrap = bootstrap().await;
        let handler = bootstrap
            .derive("handler@test.com", "password", UserRole::Handler)
            .await;
        let parcel = bootstrap.create_parcel().await;
        let parcel = bootstrap.parcel(&parcel.tracking_id).await;
        let policy = LifecyclePolicy::default();

        let holder = ObjectId::new();
        let start = bson::DateTime::from_millis(1_700_000_000_000);
        let history = vec![record(&parcel, 0, holder, holder, start)];

        // First record has nothing to compare against.
        assert!(evaluate(&parcel, &history[0], &[], &handler.user_model, 0, &policy).is_none());

        let skipped = record(&parcel, 1, handler.user_id(), handler.user_id(), start);
        let alert = evaluate(&parcel, &skipped, &history, &handler.user_model, 0, &policy).unwrap();
        assert_eq!(alert.alert_type, AlertType::SkippedHandler);
        assert_eq!(alert.handler_name, handler.user_model.name);

        // Administrators are outside the custody chain.
        assert!(evaluate(&parcel, &skipped, &history, &bootstrap.user_model, 0, &policy).is_none());

        let held = vec![record(&parcel, 0, handler.user_id(), handler.user_id(), start)];
        let on_time = record(
            &parcel,
            1,
            handler.user_id(),
            handler.user_id(),
            bson::DateTime::from_millis(start.timestamp_millis() + 3_600_000),
        );
        assert!(evaluate(&parcel, &on_time, &held, &handler.user_model, 0, &policy).is_none());

        let late = record(
            &parcel,
            1,
            handler.user_id(),
            handler.user_id(),
            bson::DateTime::from_millis(
                start.timestamp_millis()
                    + (policy.custody_window + Duration::hours(1)).whole_milliseconds() as i64,
            ),
        );
        let alert = evaluate(&parcel, &late, &held, &handler.user_model, 1, &policy).unwrap();
        assert_eq!(alert.alert_type, AlertType::CustodyTimeout);

        let alert = evaluate(&parcel, &late, &held, &handler.user_model, 2, &policy).unwrap();
        assert_eq!(alert.alert_type, AlertType::Escalation);
        assert!(alert.description.ends_with("(2 unresolved alerts)"));
    }

    #[tokio::test]
    async fn test_skipped_handler_is_committed_with_transition() {
        let bootstrap = bootstrap().await;
        let parcel = bootstrap.create_parcel().await;
        let first = bootstrap
            .derive("first@test.com", "password", UserRole::Handler)
            .await;
        let second = bootstrap
            .derive("second@test.com", "password", UserRole::Handler)
            .await;

        for (actor, status) in [
            (&first, ParcelStatus::PickedUp),
            (&second, ParcelStatus::InTransit),
        ] {
            transition(
                &bootstrap.app_state.store,
                &bootstrap.app_state.notifier,
                &bootstrap.app_state.policy,
                &actor.user_model,
                TransitionRequest {
                    tracking_id: parcel.tracking_id.clone(),
                    target: status.into(),
                    location: None,
                    notes: None,
                    handoff_to: None,
                    otp: None,
                },
            )
            .await
            .unwrap();
        }

        let stored = bootstrap.parcel(&parcel.tracking_id).await;
        assert_eq!(stored.status, ParcelStatus::InTransit);
        assert!(stored.tampering_flag);

        let alerts = open_alerts(&bootstrap).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::SkippedHandler);
        assert_eq!(alerts[0].handler_id, second.user_id());

        let sent = bootstrap.notifier.sent().await;
        assert!(sent.iter().any(|it| matches!(
            it,
            Notification::TamperAlertRaised { alert_id, .. } if *alert_id == alerts[0].id.0
        )));
    }

    #[tokio::test]
    async fn test_checkpoint_escalation_and_resolution() {
        let bootstrap = bootstrap().await;
        let parcel = bootstrap.create_parcel().await;
        let tracking_id = parcel.tracking_id.as_str();

        let ok = scan(&bootstrap, tracking_id, ParcelStatus::Created).await;
        assert!(ok.valid);
        assert!(ok.alert.is_none());

        let mut raised = vec![];
        for _ in 0..3 {
            let mismatch = scan(&bootstrap, tracking_id, ParcelStatus::InTransit).await;
            assert!(!mismatch.valid);
            assert!(mismatch.parcel.tampering_flag);
            raised.push(mismatch.alert.unwrap());
        }

        assert_eq!(raised[0].alert_type, AlertType::CheckpointMismatch);
        assert_eq!(raised[1].alert_type, AlertType::CheckpointMismatch);
        assert_eq!(raised[2].alert_type, AlertType::Escalation);
        assert_eq!(raised[2].location, "Gate 4");
        assert_eq!(open_alerts(&bootstrap).await.len(), 3);

        for alert in &raised[..2] {
            super::resolve(
                bootstrap.store(),
                bootstrap.user_model.clone(),
                PathObjectId(alert.id.0),
            )
            .await
            .unwrap();
            assert!(bootstrap.parcel(tracking_id).await.tampering_flag);
        }

        let err = super::resolve(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(raised[0].id.0),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::AlreadyResolved(id) if id == raised[0].id.0);

        let Json(last) = super::resolve(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(raised[2].id.0),
        )
        .await
        .unwrap();
        assert!(last.resolved);
        assert_eq!(last.resolved_by, Some(bootstrap.user_id().into()));
        assert!(!bootstrap.parcel(tracking_id).await.tampering_flag);

        let Json(resolved) = super::index(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            QueryParams(AlertQuery {
                resolved: Some(true),
                tracking_id: Some(tracking_id.to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resolved.alerts.len(), 3);
    }

    #[tokio::test]
    async fn test_alerts_are_admin_only() {
        let bootstrap = bootstrap().await;
        let handler = bootstrap
            .derive("handler@test.com", "password", UserRole::Handler)
            .await;

        let err = super::index(
            handler.store(),
            handler.user_model.clone(),
            QueryParams(AlertQuery::default()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotAuthorized);

        let err = super::resolve(
            handler.store(),
            handler.user_model.clone(),
            PathObjectId(ObjectId::new()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotAuthorized);

        let err = super::resolve(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(ObjectId::new()),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotFound(Resource::Alert(_)));
    }
}
