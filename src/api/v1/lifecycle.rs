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
    store::{AlertFilter, DynStore, OtpChange, TransitionCommit},
    util::{now, JsonBody, ObjectIdString},
};

use super::{
    auth::{UserModel, UserRole},
    custody::{HandoverRecordModel, HandoverRecordResponse},
    otp::DeliveryOtpModel,
    parcel::{ParcelModel, ParcelResponse},
    tamper::{self, TamperAlertModel, TamperAlertResponse},
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParcelStatus {
    Created,
    #[serde(rename = "Picked Up")]
    PickedUp,
    #[serde(rename = "In Transit")]
    InTransit,
    #[serde(rename = "Out for Delivery")]
    OutForDelivery,
    Delivered,
    Returned,
}

impl ParcelStatus {
    pub const ALL: [ParcelStatus; 6] = [
        Self::Created,
        Self::PickedUp,
        Self::InTransit,
        Self::OutForDelivery,
        Self::Delivered,
        Self::Returned,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::PickedUp => "Picked Up",
            Self::InTransit => "In Transit",
            Self::OutForDelivery => "Out for Delivery",
            Self::Delivered => "Delivered",
            Self::Returned => "Returned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Returned)
    }

    pub fn successors(&self) -> &'static [ParcelStatus] {
        match self {
            Self::Created => &[Self::PickedUp],
            Self::PickedUp => &[Self::InTransit, Self::Returned],
            Self::InTransit => &[Self::OutForDelivery, Self::Returned],
            Self::OutForDelivery => &[Self::Delivered, Self::Returned],
            Self::Delivered | Self::Returned => &[],
        }
    }
}

impl std::fmt::Display for ParcelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|it| !matches!(it, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

impl std::str::FromStr for ParcelStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);

        Self::ALL
            .into_iter()
            .find(|it| normalize_label(it.label()) == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown parcel status {s:?}")))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum TransitionTarget {
    Status(ParcelStatus),
    Delayed,
}

impl std::fmt::Display for TransitionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => status.fmt(f),
            Self::Delayed => f.write_str("Delayed"),
        }
    }
}

impl std::str::FromStr for TransitionTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if normalize_label(s) == "delayed" {
            return Ok(Self::Delayed);
        }

        s.parse().map(Self::Status)
    }
}

impl TryFrom<String> for TransitionTarget {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransitionTarget> for String {
    fn from(value: TransitionTarget) -> Self {
        value.to_string()
    }
}

impl From<ParcelStatus> for TransitionTarget {
    fn from(value: ParcelStatus) -> Self {
        Self::Status(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub status: ParcelStatus,
    pub delayed: bool,
}

pub fn check_transition(
    current: ParcelStatus,
    delayed: bool,
    target: TransitionTarget,
) -> Result<Step, Error> {
    let invalid = || Error::InvalidTransition {
        current,
        requested: target,
    };

    match target {
        TransitionTarget::Delayed if current.is_terminal() || delayed => Err(invalid()),
        TransitionTarget::Delayed => Ok(Step {
            status: current,
            delayed: true,
        }),
        TransitionTarget::Status(status) if status == current && delayed => Ok(Step {
            status,
            delayed: false,
        }),
        TransitionTarget::Status(status) if current.successors().contains(&status) => Ok(Step {
            status,
            delayed: false,
        }),
        TransitionTarget::Status(_) => Err(invalid()),
    }
}

pub struct TransitionRequest {
    pub tracking_id: String,
    pub target: TransitionTarget,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub handoff_to: Option<ObjectId>,
    pub otp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub parcel: ParcelModel,
    pub record: HandoverRecordModel,
    pub alert: Option<TamperAlertModel>,
}

const DEFAULT_LOCATION: &str = "Not specified";

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty())
}

async fn resolve_receiver(
    store: &DynStore,
    actor: &UserModel,
    handoff_to: Option<ObjectId>,
) -> Result<ObjectId, Error> {
    let Some(id) = handoff_to else {
        return Ok(actor.id);
    };

    if id == actor.id {
        return Ok(id);
    }

    match store.find_user_by_id(id).await? {
        Some(user) if user.is_staff() => Ok(user.id),
        _ => Err(Error::InvalidInput(format!(
            "handoff target {id} is not a handler"
        ))),
    }
}

#[tracing::instrument(skip_all, fields(tracking_id = %request.tracking_id, target = %request.target, actor = %actor.id))]
pub async fn transition(
    store: &DynStore,
    notifier: &DynNotifier,
    policy: &LifecyclePolicy,
    actor: &UserModel,
    request: TransitionRequest,
) -> Result<TransitionOutcome, Error> {
    match actor.role {
        UserRole::Sender => return Err(Error::NotAuthorized),
        UserRole::Handler | UserRole::Admin => {}
    }

    let parcel = store
        .find_parcel_by_tracking_id(&request.tracking_id)
        .await?
        .ok_or_else(|| Error::NotFound(Resource::Parcel(request.tracking_id.clone())))?;

    let otp_code = non_blank(request.otp);

    let step = match (request.target, &otp_code) {
        // A replayed code on a delivered parcel is an OTP failure, not a graph one.
        (TransitionTarget::Status(ParcelStatus::Delivered), Some(_))
            if parcel.status == ParcelStatus::Delivered =>
        {
            return Err(Error::OtpInvalid);
        }
        (TransitionTarget::Status(ParcelStatus::Delivered), Some(code)) => {
            let step = check_transition(parcel.status, parcel.delayed, request.target)?;

            let live = store
                .find_otp(&parcel.tracking_id)
                .await?
                .filter(|it| it.is_live() && it.matches(code));

            if live.is_none() {
                tracing::debug!("delivery otp rejected");
                return Err(Error::OtpInvalid);
            }

            step
        }
        (TransitionTarget::Status(ParcelStatus::Delivered), None) => {
            check_transition(parcel.status, parcel.delayed, request.target)?;
            return Err(Error::OtpRequired);
        }
        (target, _) => check_transition(parcel.status, parcel.delayed, target)?,
    };

    let to_handler_id = resolve_receiver(store, actor, request.handoff_to).await?;

    let history = store.history(parcel.id).await?;
    let previous = history.last();

    let timestamp = [
        Some(now()),
        previous.map(|it| it.timestamp),
        Some(parcel.created_at),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or_else(now);

    let record = HandoverRecordModel {
        id: ObjectId::new(),
        parcel_id: parcel.id,
        tracking_id: parcel.tracking_id.clone(),
        sequence: history.len() as i64,
        from_handler_id: previous.map(|it| it.to_handler_id),
        to_handler_id,
        actor_id: actor.id,
        from_status: parcel.status,
        to_status: step.status,
        delayed: step.delayed,
        location: non_blank(request.location).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        notes: non_blank(request.notes),
        timestamp,
    };

    let open_alerts = store
        .list_alerts(AlertFilter::open_for(parcel.id))
        .await?
        .len();
    let alert = tamper::evaluate(&parcel, &record, &history, actor, open_alerts, policy);

    let otp = match (step.status, otp_code) {
        (ParcelStatus::OutForDelivery, _) if parcel.status != ParcelStatus::OutForDelivery => {
            OtpChange::Issue(DeliveryOtpModel::issue(
                &parcel.tracking_id,
                policy.otp_digits,
                timestamp,
            ))
        }
        (ParcelStatus::Delivered, Some(code)) => OtpChange::Consume { code },
        (ParcelStatus::Returned, _) => OtpChange::Revoke,
        _ => OtpChange::Keep,
    };
    let issued_code = match &otp {
        OtpChange::Issue(otp) => Some(otp.code.clone()),
        _ => None,
    };

    let expected_version = parcel.version;
    let updated = ParcelModel {
        status: step.status,
        delayed: step.delayed,
        tampering_flag: parcel.tampering_flag || alert.is_some(),
        version: parcel.version + 1,
        updated_at: timestamp,
        ..parcel
    };

    store
        .commit_transition(TransitionCommit {
            expected_version,
            parcel: updated.clone(),
            record: record.clone(),
            otp,
            alert: alert.clone(),
        })
        .await?;

    tracing::info!(
        from = %record.from_status,
        to = %record.to_status,
        delayed = record.delayed,
        sequence = record.sequence,
        "parcel transitioned"
    );

    notifier
        .notify(Notification::StatusUpdated {
            tracking_id: updated.tracking_id.clone(),
            sender_id: updated.sender_id,
            status: updated.status,
            delayed: updated.delayed,
        })
        .await;

    if let Some(code) = issued_code {
        notifier
            .notify(Notification::DeliveryOtpIssued {
                tracking_id: updated.tracking_id.clone(),
                sender_id: updated.sender_id,
                code,
            })
            .await;
    }

    if let Some(alert) = &alert {
        notifier
            .notify(Notification::TamperAlertRaised {
                tracking_id: updated.tracking_id.clone(),
                alert_id: alert.id,
            })
            .await;
    }

    Ok(TransitionOutcome {
        parcel: updated,
        record,
        alert,
    })
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub status: TransitionTarget,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub handoff_to: Option<ObjectIdString>,
    #[serde(default)]
    pub otp: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResponse {
    pub parcel: ParcelResponse,
    pub record: HandoverRecordResponse,
    pub alert: Option<TamperAlertResponse>,
}

impl From<TransitionOutcome> for TransitionResponse {
    fn from(value: TransitionOutcome) -> Self {
        Self {
            parcel: value.parcel.into(),
            record: value.record.into(),
            alert: value.alert.map(Into::into),
        }
    }
}

pub async fn transition_status(
    State(store): State<DynStore>,
    State(notifier): State<DynNotifier>,
    State(policy): State<LifecyclePolicy>,
    user: UserModel,
    Path(tracking_id): Path<String>,
    JsonBody(request): JsonBody<StatusRequest>,
) -> Result<Json<TransitionResponse>, Error> {
    transition(
        &store,
        &notifier,
        &policy,
        &user,
        TransitionRequest {
            tracking_id,
            target: request.status,
            location: request.location,
            notes: request.notes,
            handoff_to: request.handoff_to.map(|it| it.0),
            otp: request.otp,
        },
    )
    .await
    .map(|it| Json(it.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OtpRequest {
    pub otp: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OtpResponse {
    pub message: String,
    #[serde(flatten)]
    pub transition: TransitionResponse,
}

pub async fn verify_delivery_otp(
    State(store): State<DynStore>,
    State(notifier): State<DynNotifier>,
    State(policy): State<LifecyclePolicy>,
    user: UserModel,
    Path(tracking_id): Path<String>,
    JsonBody(request): JsonBody<OtpRequest>,
) -> Result<Json<OtpResponse>, Error> {
    let outcome = transition(
        &store,
        &notifier,
        &policy,
        &user,
        TransitionRequest {
            tracking_id,
            target: TransitionTarget::Status(ParcelStatus::Delivered),
            location: request.location,
            notes: request.notes,
            handoff_to: None,
            otp: Some(request.otp),
        },
    )
    .await?;

    Ok(Json(OtpResponse {
        message: "Delivery confirmed".to_string(),
        transition: outcome.into(),
    }))
}
