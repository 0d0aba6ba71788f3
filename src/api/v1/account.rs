use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Resource},
    store::DynStore,
    util::{now, JsonBody, PathObjectId},
};

use super::auth::{UserModel, UserResponse, UserRole};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexResponse {
    pub accounts: Vec<UserResponse>,
}

pub async fn index(
    State(store): State<DynStore>,
    user: UserModel,
) -> Result<Json<IndexResponse>, Error> {
    match user.role {
        UserRole::Admin => {}
        UserRole::Sender | UserRole::Handler => return Err(Error::NotAuthorized),
    }

    let accounts = store.list_users().await?;

    Ok(Json(IndexResponse {
        accounts: accounts.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetRoleRequest {
    pub role: UserRole,
}

#[tracing::instrument(skip_all, fields(admin = %user.id, account = %account_id))]
pub async fn set_role(
    State(store): State<DynStore>,
    user: UserModel,
    PathObjectId(account_id): PathObjectId,
    JsonBody(request): JsonBody<SetRoleRequest>,
) -> Result<Json<UserResponse>, Error> {
    match user.role {
        UserRole::Admin => {}
        UserRole::Sender | UserRole::Handler => return Err(Error::NotAuthorized),
    }

    if account_id == user.id && request.role != UserRole::Admin {
        return Err(Error::InvalidInput(
            "administrators cannot remove their own admin role".to_string(),
        ));
    }

    let account = store
        .update_user_role(account_id, request.role, now())
        .await?
        .ok_or(Error::NotFound(Resource::User(account_id)))?;

    tracing::info!(role = %account.role, "account role changed");

    Ok(Json(account.into()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::{extract::FromRequestParts, Json};
    use bson::oid::ObjectId;

    use crate::{
        api::v1::{auth::UserRole, tests::bootstrap},
        error::Error,
        util::{JsonBody, PathObjectId},
    };

    #[tokio::test]
    async fn test_index() {
        let bootstrap = bootstrap().await;
        let sender = bootstrap
            .derive("sender@test.com", "password", UserRole::Sender)
            .await;

        let Json(response) = super::index(bootstrap.store(), bootstrap.user_model.clone())
            .await
            .unwrap();
        assert_eq!(response.accounts.len(), 2);

        let err = super::index(sender.store(), sender.user_model.clone())
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotAuthorized);
    }

    #[tokio::test]
    async fn test_set_role_takes_effect_immediately() {
        let bootstrap = bootstrap().await;
        let sender = bootstrap
            .derive("sender@test.com", "password", UserRole::Sender)
            .await;

        // Token minted while the account was still a sender.
        let token = sender.user_token();

        let Json(updated) = super::set_role(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(sender.user_id()),
            JsonBody(super::SetRoleRequest {
                role: UserRole::Handler,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.role, UserRole::Handler);

        let (mut parts, _) = axum::http::request::Request::get("http://localhost")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();

        let model =
            crate::api::v1::auth::UserModel::from_request_parts(&mut parts, &bootstrap.app_state)
                .await
                .unwrap();
        assert_eq!(model.role, UserRole::Handler);
    }

    #[tokio::test]
    async fn test_set_role_errors() {
        let bootstrap = bootstrap().await;
        let handler = bootstrap
            .derive("handler@test.com", "password", UserRole::Handler)
            .await;

        let err = super::set_role(
            handler.store(),
            handler.user_model.clone(),
            PathObjectId(handler.user_id()),
            JsonBody(super::SetRoleRequest {
                role: UserRole::Admin,
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotAuthorized);

        let err = super::set_role(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(ObjectId::new()),
            JsonBody(super::SetRoleRequest {
                role: UserRole::Handler,
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotFound(_));

        let err = super::set_role(
            bootstrap.store(),
            bootstrap.user_model.clone(),
            PathObjectId(bootstrap.user_id()),
            JsonBody(super::SetRoleRequest {
                role: UserRole::Sender,
            }),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::InvalidInput(_));
    }
}
