use std::{collections::HashMap, sync::Arc};

use bson::oid::ObjectId;
use tokio::sync::{Mutex, RwLock};

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

use super::{AlertFilter, OtpChange, ParcelFilter, Store, TransitionCommit};

#[derive(Debug)]
struct ParcelSlot {
    parcel: ParcelModel,
    otp: Option<DeliveryOtpModel>,
    records: Vec<HandoverRecordModel>,
    alerts: Vec<TamperAlertModel>,
}

// Slot locks are never held while waiting on an index lock; the alert index
// is written only after the slot is released.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<ObjectId, UserModel>>,
    refresh_tokens: RwLock<HashMap<ObjectId, RefreshTokenModel>>,
    tracking_index: RwLock<HashMap<String, ObjectId>>,
    parcels: RwLock<HashMap<ObjectId, Arc<Mutex<ParcelSlot>>>>,
    alert_index: RwLock<HashMap<ObjectId, ObjectId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, parcel_id: ObjectId) -> Option<Arc<Mutex<ParcelSlot>>> {
        self.parcels.read().await.get(&parcel_id).cloned()
    }

    async fn slots(&self) -> Vec<Arc<Mutex<ParcelSlot>>> {
        self.parcels.read().await.values().cloned().collect()
    }
}

fn apply_otp_change(
    slot: &ParcelSlot,
    change: &OtpChange,
) -> Result<Option<DeliveryOtpModel>, Error> {
    match change {
        OtpChange::Keep => Ok(slot.otp.clone()),
        OtpChange::Issue(otp) => Ok(Some(otp.clone())),
        OtpChange::Consume { code } => match &slot.otp {
            Some(current) if current.is_live() && current.matches(code) => {
                let mut consumed = current.clone();
                consumed.consumed = true;
                Ok(Some(consumed))
            }
            _ => Err(Error::OtpInvalid),
        },
        OtpChange::Revoke => Ok(slot.otp.clone().map(|mut it| {
            if !it.consumed {
                it.revoked = true;
            }
            it
        })),
    }
}

#[axum::async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: &UserModel) -> Result<(), Error> {
        let mut users = self.users.write().await;

        if users.values().any(|it| it.email == user.email) {
            return Err(Error::DuplicateEmail);
        }

        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user_by_id(&self, id: ObjectId) -> Result<Option<UserModel>, Error> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserModel>, Error> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|it| it.email == email)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserModel>, Error> {
        let mut users: Vec<_> = self.users.read().await.values().cloned().collect();
        users.sort_by_key(|it| (it.created_at, it.id));
        Ok(users)
    }

    async fn update_user_role(
        &self,
        id: ObjectId,
        role: UserRole,
        updated_at: bson::DateTime,
    ) -> Result<Option<UserModel>, Error> {
        let mut users = self.users.write().await;

        Ok(users.get_mut(&id).map(|user| {
            user.role = role;
            user.updated_at = updated_at;
            user.clone()
        }))
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenModel) -> Result<(), Error> {
        self.refresh_tokens
            .write()
            .await
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, id: ObjectId) -> Result<Option<RefreshTokenModel>, Error> {
        Ok(self.refresh_tokens.read().await.get(&id).cloned())
    }

    async fn delete_refresh_token(&self, id: ObjectId) -> Result<bool, Error> {
        Ok(self.refresh_tokens.write().await.remove(&id).is_some())
    }

    async fn insert_parcel(&self, parcel: &ParcelModel) -> Result<(), Error> {
        let mut index = self.tracking_index.write().await;

        if index.contains_key(&parcel.tracking_id) {
            return Err(Error::MustUniqueError("tracking_id".to_string()));
        }

        self.parcels.write().await.insert(
            parcel.id,
            Arc::new(Mutex::new(ParcelSlot {
                parcel: parcel.clone(),
                otp: None,
                records: vec![],
                alerts: vec![],
            })),
        );
        index.insert(parcel.tracking_id.clone(), parcel.id);

        Ok(())
    }

    async fn find_parcel_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<ParcelModel>, Error> {
        let id = match self.tracking_index.read().await.get(tracking_id) {
            Some(id) => *id,
            None => return Ok(None),
        };

        match self.slot(id).await {
            Some(slot) => Ok(Some(slot.lock().await.parcel.clone())),
            None => Ok(None),
        }
    }

    async fn list_parcels(&self, filter: ParcelFilter) -> Result<Vec<ParcelModel>, Error> {
        let mut parcels = vec![];

        for slot in self.slots().await {
            let slot = slot.lock().await;
            if filter.sender_id.map_or(true, |it| slot.parcel.sender_id == it) {
                parcels.push(slot.parcel.clone());
            }
        }

        parcels.sort_by_key(|it| (it.created_at, it.id));
        Ok(parcels)
    }

    async fn find_otp(&self, tracking_id: &str) -> Result<Option<DeliveryOtpModel>, Error> {
        let id = match self.tracking_index.read().await.get(tracking_id) {
            Some(id) => *id,
            None => return Ok(None),
        };

        match self.slot(id).await {
            Some(slot) => Ok(slot.lock().await.otp.clone()),
            None => Ok(None),
        }
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> Result<(), Error> {
        let slot = self
            .slot(commit.parcel.id)
            .await
            .ok_or_else(|| Error::NotFound(Resource::Parcel(commit.parcel.tracking_id.clone())))?;

        let indexed = {
            let mut slot = slot.lock().await;

            if slot.parcel.version != commit.expected_version {
                return Err(Error::Conflict);
            }

            // Everything that can fail is checked before the first write.
            let otp = apply_otp_change(&slot, &commit.otp)?;

            slot.parcel = commit.parcel;
            slot.otp = otp;
            slot.records.push(commit.record);

            let indexed = commit.alert.as_ref().map(|it| (it.id, it.parcel_id));
            slot.alerts.extend(commit.alert);
            indexed
        };

        if let Some((alert_id, parcel_id)) = indexed {
            self.alert_index.write().await.insert(alert_id, parcel_id);
        }

        Ok(())
    }

    async fn history(&self, parcel_id: ObjectId) -> Result<Vec<HandoverRecordModel>, Error> {
        match self.slot(parcel_id).await {
            Some(slot) => Ok(slot.lock().await.records.clone()),
            None => Ok(vec![]),
        }
    }

    async fn history_by_handler(
        &self,
        handler_id: ObjectId,
    ) -> Result<Vec<HandoverRecordModel>, Error> {
        let mut records = vec![];

        for slot in self.slots().await {
            let slot = slot.lock().await;
            records.extend(
                slot.records
                    .iter()
                    .filter(|it| it.involves(handler_id))
                    .cloned(),
            );
        }

        records.sort_by_key(|it| (it.timestamp, it.sequence));
        Ok(records)
    }

    async fn raise_alert(&self, alert: &TamperAlertModel) -> Result<(), Error> {
        let slot = self
            .slot(alert.parcel_id)
            .await
            .ok_or_else(|| Error::NotFound(Resource::Parcel(alert.parcel_tracking_id.clone())))?;
        {
            let mut slot = slot.lock().await;

            slot.parcel.tampering_flag = true;
            slot.parcel.version += 1;
            slot.alerts.push(alert.clone());
        }

        self.alert_index
            .write()
            .await
            .insert(alert.id, alert.parcel_id);

        Ok(())
    }

    async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<TamperAlertModel>, Error> {
        let slots = match filter.parcel_id {
            Some(id) => self.slot(id).await.into_iter().collect(),
            None => self.slots().await,
        };

        let mut alerts = vec![];
        for slot in slots {
            let slot = slot.lock().await;
            alerts.extend(slot.alerts.iter().filter(|it| filter.matches(it)).cloned());
        }

        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(alerts)
    }

    async fn resolve_alert(
        &self,
        alert_id: ObjectId,
        admin_id: ObjectId,
        resolved_at: bson::DateTime,
    ) -> Result<TamperAlertModel, Error> {
        let parcel_id = self
            .alert_index
            .read()
            .await
            .get(&alert_id)
            .copied()
            .ok_or(Error::NotFound(Resource::Alert(alert_id)))?;

        let slot = self
            .slot(parcel_id)
            .await
            .ok_or(Error::NotFound(Resource::Alert(alert_id)))?;
        let mut slot = slot.lock().await;

        let alert = slot
            .alerts
            .iter_mut()
            .find(|it| it.id == alert_id)
            .ok_or(Error::NotFound(Resource::Alert(alert_id)))?;

        if alert.resolved {
            return Err(Error::AlreadyResolved(alert_id));
        }

        alert.resolved = true;
        alert.resolved_by = Some(admin_id);
        alert.resolved_at = Some(resolved_at);
        let resolved = alert.clone();

        if slot.alerts.iter().all(|it| it.resolved) {
            slot.parcel.tampering_flag = false;
        }
        slot.parcel.version += 1;

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        api::v1::{lifecycle::ParcelStatus, parcel::tests::sample_parcel},
        store::tests::{sample_alert, step},
    };

    #[tokio::test]
    async fn test_alert_commit_does_not_block_other_parcels() {
        let store = Arc::new(MemoryStore::new());
        let busy = sample_parcel(ObjectId::new(), "TRK-0000000A");
        let idle = sample_parcel(ObjectId::new(), "TRK-0000000B");
        store.insert_parcel(&busy).await.unwrap();
        store.insert_parcel(&idle).await.unwrap();

        let slot = store.slot(busy.id).await.unwrap();
        let guard = slot.lock().await;

        let mut commit = step(&busy, 0, ParcelStatus::PickedUp, OtpChange::Keep);
        commit.alert = Some(sample_alert(&busy));
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.commit_transition(commit).await }
        });
        tokio::task::yield_now().await;

        tokio::time::timeout(
            Duration::from_secs(1),
            store.raise_alert(&sample_alert(&idle)),
        )
        .await
        .expect("alert on another parcel waited for a busy slot")
        .unwrap();

        drop(guard);
        pending.await.unwrap().unwrap();

        let alerts = store.list_alerts(AlertFilter::default()).await.unwrap();
        assert_eq!(alerts.len(), 2);

        for alert in alerts {
            let resolved = store
                .resolve_alert(alert.id, ObjectId::new(), bson::DateTime::now())
                .await
                .unwrap();
            assert!(resolved.resolved);
        }

        let busy = store
            .find_parcel_by_tracking_id("TRK-0000000A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(busy.status, ParcelStatus::PickedUp);
        assert!(!busy.tampering_flag);
    }
}
