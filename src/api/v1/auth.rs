use argon2::Argon2;
use axum::{
    extract::{FromRef, FromRequestParts, State},
    headers::{authorization::Bearer, Authorization, Cookie},
    http::{header::SET_COOKIE, request::Parts},
    Json, RequestPartsExt, TypedHeader,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tap::TapFallible;
use validator::Validate;

use crate::{
    config::BootstrapAdmin,
    error::{Error, UnauthorizedType},
    store::DynStore,
    util::{hash_password, now, verify_password, FormattedDateTime, JsonBody, ObjectIdString},
};

use super::token::{
    decode_access_token, decode_refresh_token, generate_access_token,
    generate_refresh_token_model, JwtState, RefreshTokenClaims,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,

    pub name: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,

    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Sender,
    Handler,
    Admin,
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sender => "sender",
            Self::Handler => "handler",
            Self::Admin => "admin",
        })
    }
}

#[derive(Debug)]
pub struct UserAccess {
    pub id: ObjectId,
    pub role: UserRole,
}

impl UserAccess {
    pub fn from_token(jwt_state: &JwtState, token: &str) -> Result<Self, Error> {
        let token = decode_access_token(jwt_state, token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        if token.claims.is_expired() {
            return Err(Error::Unauthorized(UnauthorizedType::InvalidAccessToken));
        }

        Ok(Self {
            id: token.claims.sub.0,
            role: token.claims.user_role,
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserAccess
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(token)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidAccessToken))?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, token.token())
    }
}

#[derive(Debug)]
pub struct RefreshToken(String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshToken
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let cookie = parts
            .extract::<TypedHeader<Cookie>>()
            .await
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("cookie not found"))?;

        let refresh_token = cookie
            .get("refresh_token")
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
            .tap_err(|_| tracing::debug!("token not found"))?;

        Ok(Self(refresh_token.to_string()))
    }
}

#[derive(Debug)]
pub struct RefreshClaim(pub RefreshTokenClaims, pub String);

impl RefreshClaim {
    pub fn from_token(jwt_state: &JwtState, refresh_token: String) -> Result<Self, Error> {
        let token = decode_refresh_token(jwt_state, &refresh_token)
            .map_err(|_| Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

        Ok(Self(token.claims, refresh_token))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RefreshClaim
where
    JwtState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let RefreshToken(refresh_token) = parts.extract::<RefreshToken>().await?;

        let jwt = JwtState::from_ref(state);

        Self::from_token(&jwt, refresh_token)
    }
}

impl UserModel {
    pub async fn from_id(id: ObjectId, store: &DynStore) -> Result<Self, Error> {
        store
            .find_user_by_id(id)
            .await?
            .ok_or(Error::Unauthorized(UnauthorizedType::InvalidAccessToken))
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, UserRole::Handler | UserRole::Admin)
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserModel
where
    JwtState: FromRef<S>,
    DynStore: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let access = parts.extract_with_state::<UserAccess, _>(state).await?;
        let store = DynStore::from_ref(state);
        Self::from_id(access.id, &store).await
    }
}

#[derive(Validate, Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 8, max = 64))]
    pub password: String,

    #[validate(must_match = "password")]
    pub confirm_password: String,

    #[validate(length(max = 256))]
    #[serde(default)]
    pub address: Option<String>,

    #[validate(length(max = 32))]
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: ObjectIdString,

    pub name: String,
    pub email: String,
    pub role: UserRole,
    pub address: Option<String>,
    pub phone: Option<String>,

    pub created_at: FormattedDateTime,
    pub updated_at: FormattedDateTime,
}

impl From<UserModel> for UserResponse {
    fn from(value: UserModel) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            email: value.email,
            role: value.role,
            address: value.address,
            phone: value.phone,

            created_at: value.created_at.into(),
            updated_at: value.updated_at.into(),
        }
    }
}

#[derive(Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 124))]
    pub name: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(min = 8, max = 64))]
    pub password: String,

    #[validate(must_match = "password")]
    pub confirm_password: String,

    pub address: Option<String>,
    pub phone: Option<String>,

    pub role: UserRole,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|it| it.trim().to_string())
        .filter(|it| !it.is_empty())
}

pub async fn create_user(
    store: &DynStore,
    argon: &Argon2<'_>,
    request: CreateUserRequest,
) -> Result<UserModel, Error> {
    let request = CreateUserRequest {
        name: request.name.trim().to_string(),
        email: normalize_email(&request.email),
        ..request
    };
    request.validate()?;

    let model = UserModel {
        id: ObjectId::new(),
        name: request.name,
        email: request.email,
        password: hash_password(argon, &request.password)?,
        role: request.role,
        address: non_blank(request.address),
        phone: non_blank(request.phone),
        created_at: now(),
        updated_at: now(),
    };
    store.insert_user(&model).await?;

    Ok(model)
}

#[tracing::instrument(skip_all)]
pub async fn register(
    State(store): State<DynStore>,
    State(argon): State<Argon2<'static>>,
    JsonBody(request): JsonBody<RegisterRequest>,
) -> Result<Json<UserResponse>, Error> {
    let user = create_user(
        &store,
        &argon,
        CreateUserRequest {
            name: request.name,
            email: request.email,
            password: request.password,
            confirm_password: request.confirm_password,
            address: request.address,
            phone: request.phone,
            role: UserRole::Sender,
        },
    )
    .await?;

    tracing::info!(user_id = %user.id, "user registered");

    Ok(Json(user.into()))
}

pub async fn seed_admin(
    store: &DynStore,
    argon: &Argon2<'_>,
    admin: &BootstrapAdmin,
) -> Result<UserModel, Error> {
    let email = normalize_email(&admin.email);

    match store.find_user_by_email(&email).await? {
        Some(user) if user.role == UserRole::Admin => Ok(user),
        Some(user) => {
            tracing::info!(user_id = %user.id, "promoting bootstrap admin");
            store
                .update_user_role(user.id, UserRole::Admin, now())
                .await?
                .ok_or(Error::NotFound(crate::error::Resource::User(user.id)))
        }
        None => {
            tracing::info!(%email, "creating bootstrap admin");
            create_user(
                store,
                argon,
                CreateUserRequest {
                    name: "Administrator".to_string(),
                    email,
                    password: admin.password.clone(),
                    confirm_password: admin.password.clone(),
                    address: None,
                    phone: None,
                    role: UserRole::Admin,
                },
            )
            .await
        }
    }
}

pub async fn create_refresh_token(
    jwt_state: &JwtState,
    argon: &Argon2<'_>,
    store: &DynStore,
    user: &UserModel,
) -> Result<String, Error> {
    let (model, token) = generate_refresh_token_model(jwt_state, argon, user)?;

    store.insert_refresh_token(&model).await?;

    Ok(token)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub refresh_token: String,
    pub access_token: String,
    pub expired_at: FormattedDateTime,
    pub user: UserResponse,
}

#[tracing::instrument(skip_all)]
pub async fn login(
    State(store): State<DynStore>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    JsonBody(request): JsonBody<LoginRequest>,
) -> Result<([(axum::http::HeaderName, String); 1], Json<LoginResponse>), Error> {
    let user = store
        .find_user_by_email(&normalize_email(&request.email))
        .await?;

    let user = match user {
        Some(user) if verify_password(&argon, &request.password, &user.password) => user,
        _ => return Err(Error::InvalidCredentials),
    };

    let refresh_token = create_refresh_token(&jwt_state, &argon, &store, &user).await?;
    let access_token = generate_access_token(&jwt_state, &user)?;

    tracing::info!(user_id = %user.id, "user logged in");

    Ok((
        [(
            SET_COOKIE,
            format!("refresh_token={}; HttpOnly; Path=/", refresh_token),
        )],
        Json(LoginResponse {
            refresh_token,
            access_token: access_token.token,
            expired_at: access_token.expired_at.into(),
            user: user.into(),
        }),
    ))
}

#[tracing::instrument(skip_all)]
pub async fn logout(
    State(store): State<DynStore>,
    RefreshClaim(claim, _): RefreshClaim,
) -> Result<[(axum::http::HeaderName, &'static str); 1], Error> {
    if !store.delete_refresh_token(claim.sub.0).await? {
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    Ok([(SET_COOKIE, "refresh_token=; HttpOnly; Path=/; Max-Age=0")])
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefreshAccessTokenResponse {
    pub access_token: String,
    pub expired_at: FormattedDateTime,
}

pub async fn refresh_access_token(
    State(store): State<DynStore>,
    State(jwt_state): State<JwtState>,
    State(argon): State<Argon2<'static>>,
    RefreshClaim(claim, refresh_token): RefreshClaim,
) -> Result<Json<RefreshAccessTokenResponse>, Error> {
    let model = store
        .find_refresh_token(claim.sub.0)
        .await?
        .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))
        .tap_err(|_| tracing::debug!("refresh token {} is not stored", claim.sub.0))?;

    if claim.is_expired() || !verify_password(&argon, &refresh_token, &model.token) {
        store.delete_refresh_token(model.id).await?;
        return Err(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken));
    }

    let user = store
        .find_user_by_id(claim.user_id.0)
        .await?
        .ok_or(Error::Unauthorized(UnauthorizedType::InvalidRefreshToken))?;

    let access_token = generate_access_token(&jwt_state, &user)?;

    Ok(Json(RefreshAccessTokenResponse {
        access_token: access_token.token,
        expired_at: access_token.expired_at.into(),
    }))
}
