use std::ops::Deref;

use bson::{doc, oid::ObjectId, Document};
use mongodb::{
    error::{ErrorKind, WriteError, WriteFailure, TRANSIENT_TRANSACTION_ERROR},
    options::{FindOneAndUpdateOptions, FindOptions, ReplaceOptions, ReturnDocument},
    ClientSession,
};
use serde::de::DeserializeOwned;

use crate::{
    api::v1::{
        auth::{UserModel, UserRole},
        custody::HandoverRecordModel,
        otp::DeliveryOtpModel,
        parcel::ParcelModel,
        tamper::TamperAlertModel,
        token::RefreshTokenModel,
    },
    error::{Error, Resource},
};

use super::{
    migrate::MigrateModel, AlertFilter, OtpChange, ParcelFilter, Store, TransitionCommit,
};

pub struct Collection<T>(pub mongodb::Collection<T>);

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Collection<T> {
    type Target = mongodb::Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<mongodb::Collection<T>> for Collection<T> {
    fn from(value: mongodb::Collection<T>) -> Self {
        Self(value)
    }
}

impl<T> Collection<T>
where
    T: DeserializeOwned + Send + Sync + Unpin,
{
    pub async fn find_all(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Vec<T>, Error> {
        let mut cursor = self.find(filter, options).await?;

        let mut result = vec![];

        while cursor.advance().await? {
            result.push(cursor.deserialize_current()?);
        }

        Ok(result)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code: 11000, .. }))
    )
}

fn transaction_error(err: mongodb::error::Error) -> Error {
    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        Error::Conflict
    } else {
        err.into()
    }
}

#[derive(Clone)]
pub struct MongoStore {
    pub(super) client: mongodb::Client,
    pub(super) users: Collection<UserModel>,
    pub(super) refresh_tokens: Collection<RefreshTokenModel>,
    pub(super) parcels: Collection<ParcelModel>,
    pub(super) records: Collection<HandoverRecordModel>,
    pub(super) otps: Collection<DeliveryOtpModel>,
    pub(super) alerts: Collection<TamperAlertModel>,
    pub(super) migrations: Collection<MigrateModel>,
}

impl MongoStore {
    pub async fn connect(mongo_url: &str, database_name: &str) -> Result<Self, Error> {
        let options = mongodb::options::ClientOptions::parse(mongo_url).await?;
        let client = mongodb::Client::with_options(options)?;

        let db = client.database(database_name);
        Ok(Self {
            users: db.collection("users").into(),
            refresh_tokens: db.collection("refresh_tokens").into(),
            parcels: db.collection("parcels").into(),
            records: db.collection("handover_records").into(),
            otps: db.collection("delivery_otps").into(),
            alerts: db.collection("tamper_alerts").into(),
            migrations: db.collection("migrations").into(),
            client,
        })
    }

    async fn in_transaction_commit(
        &self,
        commit: &TransitionCommit,
        session: &mut ClientSession,
    ) -> Result<(), Error> {
        let updated = self
            .parcels
            .update_one_with_session(
                doc! {
                    "_id": commit.parcel.id,
                    "version": commit.expected_version,
                },
                doc! { "$set": bson::to_document(&commit.parcel)? },
                None,
                session,
            )
            .await
            .map_err(transaction_error)?;

        if updated.matched_count == 0 {
            return Err(Error::Conflict);
        }

        match &commit.otp {
            OtpChange::Keep => {}
            OtpChange::Issue(otp) => {
                self.otps
                    .replace_one_with_session(
                        doc! { "_id": &otp.tracking_id },
                        otp,
                        ReplaceOptions::builder().upsert(true).build(),
                        session,
                    )
                    .await
                    .map_err(transaction_error)?;
            }
            OtpChange::Consume { code } => {
                let consumed = self
                    .otps
                    .update_one_with_session(
                        doc! {
                            "_id": &commit.parcel.tracking_id,
                            "code": code,
                            "consumed": false,
                            "revoked": false,
                        },
                        doc! { "$set": { "consumed": true } },
                        None,
                        session,
                    )
                    .await
                    .map_err(transaction_error)?;

                if consumed.matched_count == 0 {
                    return Err(Error::OtpInvalid);
                }
            }
            OtpChange::Revoke => {
                self.otps
                    .update_one_with_session(
                        doc! { "_id": &commit.parcel.tracking_id, "consumed": false },
                        doc! { "$set": { "revoked": true } },
                        None,
                        session,
                    )
                    .await
                    .map_err(transaction_error)?;
            }
        }

        self.records
            .insert_one_with_session(&commit.record, None, session)
            .await
            .map_err(|err| {
                if is_duplicate_key(&err) {
                    Error::Conflict
                } else {
                    transaction_error(err)
                }
            })?;

        if let Some(alert) = &commit.alert {
            self.alerts
                .insert_one_with_session(alert, None, session)
                .await
                .map_err(transaction_error)?;
        }

        Ok(())
    }

    async fn in_transaction_resolve(
        &self,
        alert_id: ObjectId,
        admin_id: ObjectId,
        resolved_at: bson::DateTime,
        session: &mut ClientSession,
    ) -> Result<TamperAlertModel, Error> {
        let mut alert = self
            .alerts
            .find_one_with_session(doc! { "_id": alert_id }, None, session)
            .await
            .map_err(transaction_error)?
            .ok_or(Error::NotFound(Resource::Alert(alert_id)))?;

        if alert.resolved {
            return Err(Error::AlreadyResolved(alert_id));
        }

        let updated = self
            .alerts
            .update_one_with_session(
                doc! { "_id": alert_id, "resolved": false },
                doc! {
                    "$set": {
                        "resolved": true,
                        "resolved_by": admin_id,
                        "resolved_at": resolved_at,
                    }
                },
                None,
                session,
            )
            .await
            .map_err(transaction_error)?;

        if updated.matched_count == 0 {
            return Err(Error::AlreadyResolved(alert_id));
        }

        let remaining = self
            .alerts
            .count_documents_with_session(
                doc! { "parcel_id": alert.parcel_id, "resolved": false },
                None,
                session,
            )
            .await
            .map_err(transaction_error)?;

        let update = if remaining == 0 {
            doc! { "$set": { "tampering_flag": false }, "$inc": { "version": 1_i64 } }
        } else {
            doc! { "$inc": { "version": 1_i64 } }
        };

        self.parcels
            .update_one_with_session(doc! { "_id": alert.parcel_id }, update, None, session)
            .await
            .map_err(transaction_error)?;

        alert.resolved = true;
        alert.resolved_by = Some(admin_id);
        alert.resolved_at = Some(resolved_at);

        Ok(alert)
    }

    async fn in_transaction_raise(
        &self,
        alert: &TamperAlertModel,
        session: &mut ClientSession,
    ) -> Result<(), Error> {
        let updated = self
            .parcels
            .update_one_with_session(
                doc! { "_id": alert.parcel_id },
                doc! { "$set": { "tampering_flag": true }, "$inc": { "version": 1_i64 } },
                None,
                session,
            )
            .await
            .map_err(transaction_error)?;

        if updated.matched_count == 0 {
            return Err(Error::NotFound(Resource::Parcel(
                alert.parcel_tracking_id.clone(),
            )));
        }

        self.alerts
            .insert_one_with_session(alert, None, session)
            .await
            .map_err(transaction_error)?;

        Ok(())
    }
}

/// Runs `$body` inside a fresh transaction, committing on `Ok` and aborting on `Err`.
macro_rules! transaction {
    ($self:ident, $session:ident => $body:expr) => {{
        let mut $session = $self.client.start_session(None).await?;
        $session.start_transaction(None).await?;

        let result = $body.await;
        match result {
            Ok(value) => {
                $session
                    .commit_transaction()
                    .await
                    .map_err(transaction_error)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = $session.abort_transaction().await {
                    tracing::warn!("failed to abort transaction: {:?}", abort);
                }
                Err(err)
            }
        }
    }};
}

#[axum::async_trait]
impl Store for MongoStore {
    async fn insert_user(&self, user: &UserModel) -> Result<(), Error> {
        self.users.insert_one(user, None).await.map_err(|err| {
            if is_duplicate_key(&err) {
                Error::DuplicateEmail
            } else {
                err.into()
            }
        })?;

        Ok(())
    }

    async fn find_user_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error> {
        self.users
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(Into::into)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserModel>, Error> {
        self.users
            .find_one(doc! { "email": email }, None)
            .await
            .map_err(Into::into)
    }

    async fn list_users(&self) -> Result<Vec<UserModel>, Error> {
        self.users
            .find_all(
                None,
                FindOptions::builder()
                    .sort(doc! { "created_at": 1, "_id": 1 })
                    .build(),
            )
            .await
    }

    async fn update_user_role(
        &self,
        id: ObjectId,
        role: UserRole,
        updated_at: bson::DateTime,
    ) -> Result<Option<UserModel>, Error> {
        self.users
            .find_one_and_update(
                doc! { "_id": id },
                doc! {
                    "$set": {
                        "role": bson::to_bson(&role)?,
                        "updated_at": updated_at,
                    }
                },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(Into::into)
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenModel) -> Result<(), Error> {
        self.refresh_tokens.insert_one(token, None).await?;
        Ok(())
    }

    async fn find_refresh_token(&self, id: ObjectId) -> Result<Option<RefreshTokenModel>, Error> {
        self.refresh_tokens
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(Into::into)
    }

    async fn delete_refresh_token(&self, id: ObjectId) -> Result<bool, Error> {
        let deleted = self
            .refresh_tokens
            .delete_one(doc! { "_id": id }, None)
            .await?;

        Ok(deleted.deleted_count > 0)
    }

    async fn insert_parcel(&self, parcel: &ParcelModel) -> Result<(), Error> {
        self.parcels.insert_one(parcel, None).await.map_err(|err| {
            if is_duplicate_key(&err) {
                Error::MustUniqueError("tracking_id".to_string())
            } else {
                err.into()
            }
        })?;

        Ok(())
    }

    async fn find_parcel_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<ParcelModel>, Error> {
        self.parcels
            .find_one(doc! { "tracking_id": tracking_id }, None)
            .await
            .map_err(Into::into)
    }

    async fn list_parcels(&self, filter: ParcelFilter) -> Result<Vec<ParcelModel>, Error> {
        let query = match filter.sender_id {
            Some(sender_id) => doc! { "sender_id": sender_id },
            None => doc! {},
        };

        self.parcels
            .find_all(
                query,
                FindOptions::builder()
                    .sort(doc! { "created_at": 1, "_id": 1 })
                    .build(),
            )
            .await
    }

    async fn find_otp(&self, tracking_id: &str) -> Result<Option<DeliveryOtpModel>, Error> {
        self.otps
            .find_one(doc! { "_id": tracking_id }, None)
            .await
            .map_err(Into::into)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> Result<(), Error> {
        transaction!(self, session => self.in_transaction_commit(&commit, &mut session))
    }

    async fn history(&self, parcel_id: ObjectId) -> Result<Vec<HandoverRecordModel>, Error> {
        self.records
            .find_all(
                doc! { "parcel_id": parcel_id },
                FindOptions::builder()
                    .sort(doc! { "timestamp": 1, "sequence": 1 })
                    .build(),
            )
            .await
    }

    async fn history_by_handler(
        &self,
        handler_id: ObjectId,
    ) -> Result<Vec<HandoverRecordModel>, Error> {
        self.records
            .find_all(
                doc! {
                    "$or": [
                        { "from_handler_id": handler_id },
                        { "to_handler_id": handler_id },
                        { "actor_id": handler_id },
                    ]
                },
                FindOptions::builder()
                    .sort(doc! { "timestamp": 1, "sequence": 1 })
                    .build(),
            )
            .await
    }

    async fn raise_alert(&self, alert: &TamperAlertModel) -> Result<(), Error> {
        transaction!(self, session => self.in_transaction_raise(alert, &mut session))
    }

    async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<TamperAlertModel>, Error> {
        let mut query = doc! {};
        if let Some(parcel_id) = filter.parcel_id {
            query.insert("parcel_id", parcel_id);
        }
        if let Some(resolved) = filter.resolved {
            query.insert("resolved", resolved);
        }

        self.alerts
            .find_all(
                query,
                FindOptions::builder()
                    .sort(doc! { "timestamp": -1, "_id": -1 })
                    .build(),
            )
            .await
    }

    async fn resolve_alert(
        &self,
        alert_id: ObjectId,
        admin_id: ObjectId,
        resolved_at: bson::DateTime,
    ) -> Result<TamperAlertModel, Error> {
        transaction!(self, session => self.in_transaction_resolve(alert_id, admin_id, resolved_at, &mut session))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        api::v1::{lifecycle::ParcelStatus, parcel::tests::sample_parcel},
        store::{
            tests::{sample_alert, step},
            Store,
        },
    };

    async fn connect() -> MongoStore {
        dotenvy::dotenv().ok();
        let mongodb_url =
            std::env::var("MONGODB_URI").expect("MONGODB_URI is required for mongo tests");

        let database_name = format!("parceltrack-test-{}", ObjectId::new().to_hex());
        let store = MongoStore::connect(&mongodb_url, &database_name)
            .await
            .unwrap();
        store.run_migration().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_unique_tracking_id() {
        let store = connect().await;
        let parcel = crate::api::v1::parcel::tests::sample_parcel(ObjectId::new(), "TRK-0000ABCD");

        store.insert_parcel(&parcel).await.unwrap();

        let mut duplicate = parcel.clone();
        duplicate.id = ObjectId::new();
        let err = store.insert_parcel(&duplicate).await.unwrap_err();
        assert_matches!(err, Error::MustUniqueError(field) if field == "tracking_id");

        let found = store
            .find_parcel_by_tracking_id("TRK-0000ABCD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, parcel.id);
    }

    async fn stored(store: &MongoStore, tracking_id: &str) -> ParcelModel {
        store
            .find_parcel_by_tracking_id(tracking_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_commit_rejects_stale_version() {
        let store = connect().await;
        let parcel = sample_parcel(ObjectId::new(), "TRK-000000C1");
        store.insert_parcel(&parcel).await.unwrap();

        store
            .commit_transition(step(&parcel, 0, ParcelStatus::PickedUp, OtpChange::Keep))
            .await
            .unwrap();

        let err = store
            .commit_transition(step(&parcel, 1, ParcelStatus::PickedUp, OtpChange::Keep))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict);

        let current = stored(&store, "TRK-000000C1").await;
        assert_eq!(current.version, 1);
        assert_eq!(current.status, ParcelStatus::PickedUp);
        assert_eq!(store.history(parcel.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_duplicate_sequence_rolls_back_parcel() {
        let store = connect().await;
        let parcel = sample_parcel(ObjectId::new(), "TRK-000000C2");
        store.insert_parcel(&parcel).await.unwrap();

        let first = step(&parcel, 0, ParcelStatus::PickedUp, OtpChange::Keep);
        let picked_up = first.parcel.clone();
        store.commit_transition(first).await.unwrap();

        let err = store
            .commit_transition(step(&picked_up, 0, ParcelStatus::InTransit, OtpChange::Keep))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Conflict);

        let current = stored(&store, "TRK-000000C2").await;
        assert_eq!(current.version, picked_up.version);
        assert_eq!(current.status, ParcelStatus::PickedUp);
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_otp_is_consumed_once() {
        let store = connect().await;
        let mut parcel = sample_parcel(ObjectId::new(), "TRK-000000C3");
        parcel.status = ParcelStatus::InTransit;
        store.insert_parcel(&parcel).await.unwrap();

        let otp = DeliveryOtpModel::issue(&parcel.tracking_id, 6, bson::DateTime::now());
        let issue = step(&parcel, 0, ParcelStatus::OutForDelivery, OtpChange::Issue(otp.clone()));
        let out_for_delivery = issue.parcel.clone();
        store.commit_transition(issue).await.unwrap();

        let wrong = if otp.code == "000000" { "111111" } else { "000000" };
        let err = store
            .commit_transition(step(
                &out_for_delivery,
                1,
                ParcelStatus::Delivered,
                OtpChange::Consume {
                    code: wrong.to_string(),
                },
            ))
            .await
            .unwrap_err();
        assert_matches!(err, Error::OtpInvalid);

        let deliver = step(
            &out_for_delivery,
            1,
            ParcelStatus::Delivered,
            OtpChange::Consume {
                code: otp.code.clone(),
            },
        );
        let delivered = deliver.parcel.clone();
        store.commit_transition(deliver).await.unwrap();

        let err = store
            .commit_transition(step(
                &delivered,
                2,
                ParcelStatus::Delivered,
                OtpChange::Consume {
                    code: otp.code.clone(),
                },
            ))
            .await
            .unwrap_err();
        assert_matches!(err, Error::OtpInvalid);

        let current = stored(&store, "TRK-000000C3").await;
        assert_eq!(current.version, delivered.version);
        assert_eq!(store.history(parcel.id).await.unwrap().len(), 2);
        assert!(store.find_otp(&parcel.tracking_id).await.unwrap().unwrap().consumed);
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_resolve_alerts() {
        let store = connect().await;
        let parcel = sample_parcel(ObjectId::new(), "TRK-000000C4");
        store.insert_parcel(&parcel).await.unwrap();

        let mut flagged = step(&parcel, 0, ParcelStatus::PickedUp, OtpChange::Keep);
        flagged.parcel.tampering_flag = true;
        let skipped = sample_alert(&parcel);
        flagged.alert = Some(skipped.clone());
        store.commit_transition(flagged).await.unwrap();

        let mismatch = sample_alert(&parcel);
        store.raise_alert(&mismatch).await.unwrap();

        let open = store
            .list_alerts(AlertFilter::open_for(parcel.id))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);

        let admin = ObjectId::new();
        store
            .resolve_alert(skipped.id, admin, bson::DateTime::now())
            .await
            .unwrap();
        assert!(stored(&store, "TRK-000000C4").await.tampering_flag);

        let err = store
            .resolve_alert(skipped.id, admin, bson::DateTime::now())
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyResolved(id) if id == skipped.id);

        let resolved = store
            .resolve_alert(mismatch.id, admin, bson::DateTime::now())
            .await
            .unwrap();
        assert_eq!(resolved.resolved_by, Some(admin));

        let current = stored(&store, "TRK-000000C4").await;
        assert!(!current.tampering_flag);
        assert_eq!(current.version, 4);

        let err = store
            .resolve_alert(ObjectId::new(), admin, bson::DateTime::now())
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotFound(_));
    }

    #[tokio::test]
    #[ignore = "requires a MongoDB replica set in MONGODB_URI"]
    async fn test_handler_history_indexes() {
        let store = connect().await;
        // Running again must skip applied versions.
        store.run_migration().await.unwrap();

        let names = store.records.list_index_names().await.unwrap();
        for wanted in [
            "to_handler_id_1_timestamp_1",
            "actor_id_1_timestamp_1",
            "from_handler_id_1_timestamp_1",
        ] {
            assert!(names.iter().any(|it| it == wanted), "missing {wanted}");
        }
    }
}
