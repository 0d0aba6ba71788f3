pub mod account;
pub mod auth;
pub mod custody;
pub mod lifecycle;
pub mod otp;
pub mod parcel;
pub mod tamper;
pub mod token;
pub mod user;

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use argon2::Argon2;
    use axum::{extract::State, Json};
    use bson::oid::ObjectId;

    use crate::{
        app::AppState,
        config::{Config, LifecyclePolicy},
        notify::{DynNotifier, RecordingNotifier},
        store::{DynStore, MemoryStore},
    };

    use super::{
        auth::{UserModel, UserRole},
        custody::HandoverRecordModel,
        parcel::{ParcelModel, ParcelResponse},
        token::JwtState,
    };

    #[allow(dead_code)]
    pub struct Bootstrap {
        pub user_model: UserModel,
        pub user_password: String,
        pub app_state: AppState,
        pub notifier: Arc<RecordingNotifier>,
    }

    impl Bootstrap {
        pub fn store(&self) -> State<DynStore> {
            State(self.app_state.store.clone())
        }

        pub fn notifier(&self) -> State<DynNotifier> {
            State(self.app_state.notifier.clone())
        }

        pub fn policy(&self) -> State<LifecyclePolicy> {
            State(self.app_state.policy)
        }

        pub fn argon(&self) -> State<Argon2<'static>> {
            State(self.app_state.argon.clone())
        }

        pub fn jwt_state(&self) -> State<JwtState> {
            State(self.app_state.jwt_state.clone())
        }

        pub fn user_token(&self) -> String {
            super::token::generate_access_token(&self.app_state.jwt_state, &self.user_model)
                .unwrap()
                .token
        }

        pub async fn user_refresh_token(&self) -> String {
            super::auth::create_refresh_token(
                &self.app_state.jwt_state,
                &self.app_state.argon,
                &self.app_state.store,
                &self.user_model,
            )
            .await
            .unwrap()
        }

        pub fn user_id(&self) -> ObjectId {
            self.user_model.id
        }

        pub async fn derive(&self, email: &str, password: &str, role: UserRole) -> Bootstrap {
            let user = create_user(&self.app_state, email, password, role).await;

            Bootstrap {
                user_model: user,
                user_password: password.to_string(),
                app_state: self.app_state.clone(),
                notifier: self.notifier.clone(),
            }
        }

        pub async fn create_parcel(&self) -> ParcelResponse {
            let Json(parcel) = super::parcel::create(
                self.store(),
                self.notifier(),
                self.user_model.clone(),
                crate::util::JsonBody(super::parcel::tests::create_request()),
            )
            .await
            .unwrap();

            parcel
        }

        pub async fn parcel(&self, tracking_id: &str) -> ParcelModel {
            self.app_state
                .store
                .find_parcel_by_tracking_id(tracking_id)
                .await
                .unwrap()
                .unwrap()
        }

        pub async fn history(&self, parcel_id: ObjectId) -> Vec<HandoverRecordModel> {
            self.app_state.store.history(parcel_id).await.unwrap()
        }
    }

    pub async fn create_user(
        app: &AppState,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> UserModel {
        super::auth::create_user(
            &app.store,
            &app.argon,
            super::auth::CreateUserRequest {
                name: email.split('@').next().unwrap_or(email).to_string(),
                email: email.to_string(),
                password: password.to_string(),
                confirm_password: password.to_string(),
                address: None,
                phone: None,
                role,
            },
        )
        .await
        .unwrap()
    }

    pub async fn bootstrap() -> Bootstrap {
        let config = Config::in_memory(b"bootstrap-test-secret");
        let notifier = Arc::new(RecordingNotifier::default());

        let app_state = AppState::with_parts(
            &config,
            Arc::new(MemoryStore::new()),
            notifier.clone(),
        )
        .unwrap();

        let password = "password";
        let user = create_user(&app_state, "example@example.com", password, UserRole::Admin).await;

        Bootstrap {
            user_model: user,
            user_password: password.to_string(),
            app_state,
            notifier,
        }
    }
}
