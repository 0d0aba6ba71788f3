use axum::{
    extract::{Path, State},
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Resource},
    store::DynStore,
    util::{FormattedDateTime, ObjectIdString, PathObjectId},
};

use super::{
    auth::{UserModel, UserRole},
    lifecycle::ParcelStatus,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandoverRecordModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub parcel_id: ObjectId,
    pub tracking_id: String,
    pub sequence: i64,

    pub from_handler_id: Option<ObjectId>,
    pub to_handler_id: ObjectId,
    pub actor_id: ObjectId,

    pub from_status: ParcelStatus,
    pub to_status: ParcelStatus,
    pub delayed: bool,

    pub location: String,
    pub notes: Option<String>,
    pub timestamp: bson::DateTime,
}

impl HandoverRecordModel {
    pub fn involves(&self, handler_id: ObjectId) -> bool {
        self.from_handler_id == Some(handler_id)
            || self.to_handler_id == handler_id
            || self.actor_id == handler_id
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HandoverRecordResponse {
    pub id: ObjectIdString,
    pub parcel_id: ObjectIdString,
    pub tracking_id: String,
    pub sequence: i64,

    pub from_handler_id: Option<ObjectIdString>,
    pub to_handler_id: ObjectIdString,
    pub actor_id: ObjectIdString,

    pub from_status: ParcelStatus,
    pub to_status: ParcelStatus,
    pub delayed: bool,

    pub location: String,
    pub notes: Option<String>,
    pub timestamp: FormattedDateTime,
}

impl From<HandoverRecordModel> for HandoverRecordResponse {
    fn from(value: HandoverRecordModel) -> Self {
        Self {
            id: value.id.into(),
            parcel_id: value.parcel_id.into(),
            tracking_id: value.tracking_id,
            sequence: value.sequence,

            from_handler_id: value.from_handler_id.map(Into::into),
            to_handler_id: value.to_handler_id.into(),
            actor_id: value.actor_id.into(),

            from_status: value.from_status,
            to_status: value.to_status,
            delayed: value.delayed,

            location: value.location,
            notes: value.notes,
            timestamp: value.timestamp.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryResponse {
    pub records: Vec<HandoverRecordResponse>,
}

impl From<Vec<HandoverRecordModel>> for HistoryResponse {
    fn from(value: Vec<HandoverRecordModel>) -> Self {
        Self {
            records: value.into_iter().map(Into::into).collect(),
        }
    }
}

pub async fn history(
    State(store): State<DynStore>,
    _user: UserModel,
    Path(tracking_id): Path<String>,
) -> Result<Json<HistoryResponse>, Error> {
    let parcel = store
        .find_parcel_by_tracking_id(&tracking_id)
        .await?
        .ok_or_else(|| Error::NotFound(Resource::Parcel(tracking_id.clone())))?;

    let records = store.history(parcel.id).await?;

    Ok(Json(records.into()))
}

pub async fn handler_history(
    State(store): State<DynStore>,
    user: UserModel,
    PathObjectId(handler_id): PathObjectId,
) -> Result<Json<HistoryResponse>, Error> {
    match user.role {
        UserRole::Admin => {}
        UserRole::Handler if user.id == handler_id => {}
        UserRole::Handler | UserRole::Sender => return Err(Error::NotAuthorized),
    }

    let records = store.history_by_handler(handler_id).await?;

    Ok(Json(records.into()))
}
