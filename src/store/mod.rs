//! Persistence seam.
//!
//! Every mutating lifecycle operation reaches storage as one commit value so
//! that a backend can apply it all-or-nothing: [`TransitionCommit`] carries the
//! new parcel state, the ledger record, the OTP change and an optional tamper
//! alert, guarded by the parcel version the caller read.

use std::sync::Arc;

use bson::oid::ObjectId;

use crate::{
    api::v1::{
        auth::{UserModel, UserRole},
        custody::HandoverRecordModel,
        otp::DeliveryOtpModel,
        parcel::ParcelModel,
        tamper::TamperAlertModel,
        token::RefreshTokenModel,
    },
    error::Error,
};

pub mod memory;
pub mod migrate;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

pub type DynStore = Arc<dyn Store>;

/// What a transition does to the parcel's delivery OTP.
#[derive(Debug, Clone)]
pub enum OtpChange {
    Keep,
    /// Replace whatever OTP the parcel had with a fresh one.
    Issue(DeliveryOtpModel),
    /// Consume the current OTP; the commit fails with `OtpInvalid` unless it
    /// is live and matches `code`.
    Consume { code: String },
    /// Invalidate the current OTP without consuming it.
    Revoke,
}

#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub expected_version: i64,
    pub parcel: ParcelModel,
    pub record: HandoverRecordModel,
    pub otp: OtpChange,
    pub alert: Option<TamperAlertModel>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParcelFilter {
    pub sender_id: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlertFilter {
    pub parcel_id: Option<ObjectId>,
    pub resolved: Option<bool>,
}

impl AlertFilter {
    pub fn open_for(parcel_id: ObjectId) -> Self {
        Self {
            parcel_id: Some(parcel_id),
            resolved: Some(false),
        }
    }

    pub fn matches(&self, alert: &TamperAlertModel) -> bool {
        self.parcel_id.map_or(true, |it| alert.parcel_id == it)
            && self.resolved.map_or(true, |it| alert.resolved == it)
    }
}

#[axum::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn insert_user(&self, user: &UserModel) -> Result<(), Error>;
    async fn find_user_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserModel>, Error>;
    async fn list_users(&self) -> Result<Vec<UserModel>, Error>;
    async fn update_user_role(
        &self,
        id: ObjectId,
        role: UserRole,
        updated_at: bson::DateTime,
    ) -> Result<Option<UserModel>, Error>;

    async fn insert_refresh_token(&self, token: &RefreshTokenModel) -> Result<(), Error>;
    async fn find_refresh_token(&self, id: ObjectId) -> Result<Option<RefreshTokenModel>, Error>;
    async fn delete_refresh_token(&self, id: ObjectId) -> Result<bool, Error>;

    async fn insert_parcel(&self, parcel: &ParcelModel) -> Result<(), Error>;
    async fn find_parcel_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<ParcelModel>, Error>;
    async fn list_parcels(&self, filter: ParcelFilter) -> Result<Vec<ParcelModel>, Error>;

    async fn find_otp(&self, tracking_id: &str) -> Result<Option<DeliveryOtpModel>, Error>;

    /// Applies a transition atomically. Fails with `Conflict` when the parcel
    /// version moved since it was read, and with `OtpInvalid` when an OTP
    /// consumption no longer matches a live OTP. Nothing is written on failure.
    async fn commit_transition(&self, commit: TransitionCommit) -> Result<(), Error>;

    async fn history(&self, parcel_id: ObjectId) -> Result<Vec<HandoverRecordModel>, Error>;
    async fn history_by_handler(
        &self,
        handler_id: ObjectId,
    ) -> Result<Vec<HandoverRecordModel>, Error>;

    async fn raise_alert(&self, alert: &TamperAlertModel) -> Result<(), Error>;
    async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<TamperAlertModel>, Error>;
    async fn resolve_alert(
        &self,
        alert_id: ObjectId,
        admin_id: ObjectId,
        resolved_at: bson::DateTime,
    ) -> Result<TamperAlertModel, Error>;
}
