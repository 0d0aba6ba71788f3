use axum::{
    extract::{Path, State},
    Json,
};
use bson::oid::ObjectId;
use password_hash::rand_core::{OsRng, RngCore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    error::{Error, Resource},
    notify::{DynNotifier, Notification},
    store::{DynStore, ParcelFilter},
    util::{now, DecimalString, FormattedDateTime, JsonBody, ObjectIdString, PathObjectId},
};

use super::{
    auth::{UserModel, UserRole},
    lifecycle::ParcelStatus,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParcelModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub tracking_id: String,
    pub sender_id: ObjectId,
    pub sender_name: String,
    pub recipient_name: String,
    pub origin_address: String,
    pub destination_address: String,
    pub weight: Decimal,
    pub dimensions: Option<String>,
    pub description: String,

    pub status: ParcelStatus,
    pub delayed: bool,
    pub tampering_flag: bool,
    pub version: i64,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ParcelResponse {
    pub id: ObjectIdString,

    pub tracking_id: String,
    pub sender_id: ObjectIdString,
    pub sender_name: String,
    pub recipient_name: String,
    pub origin_address: String,
    pub destination_address: String,
    pub weight: DecimalString,
    pub dimensions: Option<String>,
    pub description: String,

    pub status: ParcelStatus,
    pub delayed: bool,
    pub tampering_flag: bool,
    pub version: i64,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<ParcelModel> for ParcelResponse {
    fn from(value: ParcelModel) -> Self {
        Self {
            id: value.id.into(),
            tracking_id: value.tracking_id,
            sender_id: value.sender_id.into(),
            sender_name: value.sender_name,
            recipient_name: value.recipient_name,
            origin_address: value.origin_address,
            destination_address: value.destination_address,
            weight: value.weight.into(),
            dimensions: value.dimensions,
            description: value.description,
            status: value.status,
            delayed: value.delayed,
            tampering_flag: value.tampering_flag,
            version: value.version,
            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

fn positive(value: &DecimalString) -> Result<(), ValidationError> {
    if value.0 <= Decimal::ZERO {
        return Err(ValidationError::new("not_positive"));
    }
    Ok(())
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreateParcelRequest {
    #[validate(length(max = 124), custom = "not_blank")]
    pub recipient_name: String,

    #[validate(length(max = 256), custom = "not_blank")]
    pub destination_address: String,

    #[serde(default)]
    pub origin_address: Option<String>,

    #[validate(custom = "positive")]
    pub weight: DecimalString,

    #[serde(default)]
    pub dimensions: Option<String>,

    #[validate(length(max = 1024), custom = "not_blank")]
    pub description: String,
}

const TRACKING_ID_ATTEMPTS: usize = 8;

pub fn generate_tracking_id() -> String {
    format!("TRK-{:08X}", OsRng.next_u32())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty())
}

#[tracing::instrument(skip_all, fields(sender = %user.id))]
pub async fn create(
    State(store): State<DynStore>,
    State(notifier): State<DynNotifier>,
    user: UserModel,
    JsonBody(request): JsonBody<CreateParcelRequest>,
) -> Result<Json<ParcelResponse>, Error> {
    match user.role {
        UserRole::Sender | UserRole::Admin => {}
        UserRole::Handler => return Err(Error::NotAuthorized),
    }

    request.validate()?;

    let origin_address = trimmed(request.origin_address)
        .or_else(|| trimmed(user.address.clone()))
        .ok_or_else(|| {
            Error::InvalidInput(
                "origin address is required when the sender has no address".to_string(),
            )
        })?;

    let created_at = now();
    let mut parcel = ParcelModel {
        id: ObjectId::new(),
        tracking_id: generate_tracking_id(),
        sender_id: user.id,
        sender_name: user.name,
        recipient_name: request.recipient_name.trim().to_string(),
        origin_address,
        destination_address: request.destination_address.trim().to_string(),
        weight: request.weight.0,
        dimensions: trimmed(request.dimensions),
        description: request.description.trim().to_string(),
        status: ParcelStatus::Created,
        delayed: false,
        tampering_flag: false,
        version: 0,
        created_at,
        updated_at: created_at,
    };

    let mut attempts = 0;
    loop {
        match store.insert_parcel(&parcel).await {
            Ok(()) => break,
            Err(Error::MustUniqueError(_)) if attempts + 1 < TRACKING_ID_ATTEMPTS => {
                tracing::debug!(tracking_id = %parcel.tracking_id, "tracking id taken, retrying");
                attempts += 1;
                parcel.tracking_id = generate_tracking_id();
            }
            Err(Error::MustUniqueError(_)) => return Err(Error::TrackingIdExhausted),
            Err(err) => return Err(err),
        }
    }

    tracing::info!(tracking_id = %parcel.tracking_id, "parcel created");

    notifier
        .notify(Notification::ParcelCreated {
            tracking_id: parcel.tracking_id.clone(),
            sender_id: parcel.sender_id,
        })
        .await;

    Ok(Json(parcel.into()))
}

pub async fn show(
    State(store): State<DynStore>,
    _user: UserModel,
    Path(tracking_id): Path<String>,
) -> Result<Json<ParcelResponse>, Error> {
    let tracking_id = tracking_id.trim();

    let parcel = store
        .find_parcel_by_tracking_id(tracking_id)
        .await?
        .ok_or_else(|| Error::NotFound(Resource::Parcel(tracking_id.to_string())))?;

    Ok(Json(parcel.into()))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexResponse {
    pub parcels: Vec<ParcelResponse>,
}

impl From<Vec<ParcelModel>> for IndexResponse {
    fn from(value: Vec<ParcelModel>) -> Self {
        Self {
            parcels: value.into_iter().map(Into::into).collect(),
        }
    }
}

pub async fn index(
    State(store): State<DynStore>,
    user: UserModel,
) -> Result<Json<IndexResponse>, Error> {
    match user.role {
        UserRole::Handler | UserRole::Admin => {}
        UserRole::Sender => return Err(Error::NotAuthorized),
    }

    let parcels = store.list_parcels(ParcelFilter::default()).await?;

    Ok(Json(parcels.into()))
}

pub async fn index_by_sender(
    State(store): State<DynStore>,
    user: UserModel,
    PathObjectId(sender_id): PathObjectId,
) -> Result<Json<IndexResponse>, Error> {
    match user.role {
        UserRole::Handler | UserRole::Admin => {}
        UserRole::Sender if user.id == sender_id => {}
        UserRole::Sender => return Err(Error::NotAuthorized),
    }

    let parcels = store
        .list_parcels(ParcelFilter {
            sender_id: Some(sender_id),
        })
        .await?;

    Ok(Json(parcels.into()))
}
