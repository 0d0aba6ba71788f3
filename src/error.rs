use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::api::v1::lifecycle::{ParcelStatus, TransitionTarget};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("{0}")]
    InvalidInput(String),

    #[error("malformed request body: {0}")]
    MalformedBody(String),

    #[error("{0} not found")]
    NotFound(Resource),

    #[error("No resource found")]
    NoResource,

    #[error("{0}")]
    PasswordHashError(#[from] password_hash::Error),

    #[error("{0}")]
    DatabaseError(#[from] mongodb::error::Error),

    #[error("{0}")]
    JWTError(#[from] jsonwebtoken::errors::Error),

    #[error("{0} must unique")]
    MustUniqueError(String),

    #[error("email is already registered")]
    DuplicateEmail,

    #[error("Wrong email or password")]
    InvalidCredentials,

    #[error("{0}")]
    Unauthorized(UnauthorizedType),

    #[error("You have no permission to access this resource")]
    NotAuthorized,

    #[error("{0}")]
    BSONSerError(#[from] bson::ser::Error),

    #[error("{0}")]
    BSONDeError(#[from] bson::de::Error),

    #[error("cannot move parcel from {current} to {requested}")]
    InvalidTransition {
        current: ParcelStatus,
        requested: TransitionTarget,
    },

    #[error("a delivery OTP is required to mark the parcel as delivered")]
    OtpRequired,

    #[error("invalid OTP or parcel not ready for delivery")]
    OtpInvalid,

    #[error("tamper alert {0} is already resolved")]
    AlreadyResolved(ObjectId),

    #[error("the resource was modified concurrently, retry with fresh state")]
    Conflict,

    #[error("could not allocate a unique tracking id")]
    TrackingIdExhausted,
}

#[derive(Debug)]
pub enum Resource {
    Parcel(String),
    Alert(ObjectId),
    User(ObjectId),
    Id(String),
    Route(Uri),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parcel(tracking_id) => write!(f, "parcel {tracking_id}"),
            Self::Alert(id) => write!(f, "tamper alert {id}"),
            Self::User(id) => write!(f, "user {id}"),
            Self::Id(id) => write!(f, "{id}"),
            Self::Route(uri) => write!(f, "{uri}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnauthorizedType {
    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<serde_json::Value>,
    pub r#type: String,
    pub message: String,
}

impl From<Error> for ErrorJson {
    fn from(err: Error) -> Self {
        let message = err.to_string();

        let r#type = err.to_string_variant();

        let errors = match err {
            Error::ValidationError(err) => serde_json::to_value(err).ok(),
            Error::InvalidTransition { current, requested } => Some(serde_json::json!({
                "current": current,
                "requested": requested,
            })),
            Error::InvalidInput(..)
            | Error::MalformedBody(..)
            | Error::NotFound(..)
            | Error::NoResource
            | Error::PasswordHashError(..)
            | Error::DatabaseError(..)
            | Error::JWTError(..)
            | Error::BSONSerError(..)
            | Error::BSONDeError(..)
            | Error::MustUniqueError(..)
            | Error::DuplicateEmail
            | Error::InvalidCredentials
            | Error::Unauthorized(..)
            | Error::NotAuthorized
            | Error::OtpRequired
            | Error::OtpInvalid
            | Error::AlreadyResolved(..)
            | Error::Conflict
            | Error::TrackingIdExhausted => None,
        };

        Self {
            errors,
            message,
            r#type,
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(..) | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::MalformedBody(..) => StatusCode::BAD_REQUEST,
            Self::ValidationError(..)
            | Self::InvalidInput(..)
            | Self::MustUniqueError(..)
            | Self::OtpRequired => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotAuthorized => StatusCode::FORBIDDEN,
            Self::NotFound(..) | Self::NoResource => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. }
            | Self::OtpInvalid
            | Self::AlreadyResolved(..)
            | Self::DuplicateEmail
            | Self::Conflict => StatusCode::CONFLICT,
            Self::PasswordHashError(..)
            | Self::DatabaseError(..)
            | Self::JWTError(..)
            | Self::BSONSerError(..)
            | Self::BSONDeError(..)
            | Self::TrackingIdExhausted => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_string_variant(&self) -> String {
        macro_rules! match_var {
            ($id:ident !) => {
                Self::$id
            };
            ($id:ident (..)) => {
                Self::$id(..)
            };
            ($id:ident {..}) => {
                Self::$id { .. }
            };
        }

        macro_rules! variant {
            (@kind $name:ident) => {
                stringify!($name)
            };
            (@kind $name:ident $kind:ident) => {
                stringify!($kind)
            };
            ($($name:ident $tt:tt $(=> $kind:ident)?),+) => {
                match self {
                    $(
                        match_var!($name $tt) => {
                            variant!(@kind $name $($kind)?)
                       }
                    )+
                }
            };
        }

        // Input problems all surface under one kind.
        variant! {
            NotFound(..),
            NoResource!,
            NotAuthorized!,
            DuplicateEmail!,
            InvalidCredentials!,
            OtpRequired!,
            OtpInvalid!,
            Conflict!,
            TrackingIdExhausted!,
            ValidationError(..),
            InvalidInput(..) => ValidationError,
            MalformedBody(..) => ValidationError,
            PasswordHashError(..),
            DatabaseError(..),
            JWTError(..),
            BSONSerError(..),
            BSONDeError(..),
            MustUniqueError(..),
            Unauthorized(..),
            AlreadyResolved(..),
            InvalidTransition {..}
        }
        .to_string()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("error: {:?}", self);
        } else {
            tracing::debug!("request rejected: {:?}", self);
        }

        let error = ErrorJson::from(self);

        (status, Json(error)).into_response()
    }
}

impl From<PathRejection> for Error {
    fn from(_value: PathRejection) -> Self {
        Self::NoResource
    }
}

impl From<JsonRejection> for Error {
    fn from(value: JsonRejection) -> Self {
        match value {
            JsonRejection::JsonDataError(err) => Self::InvalidInput(err.body_text()),
            rejection => Self::MalformedBody(rejection.body_text()),
        }
    }
}

impl From<QueryRejection> for Error {
    fn from(value: QueryRejection) -> Self {
        Self::InvalidInput(value.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_status() {
        let err = Error::InvalidTransition {
            current: ParcelStatus::Created,
            requested: TransitionTarget::Status(ParcelStatus::Delivered),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let json = ErrorJson::from(err);
        assert_eq!(json.r#type, "InvalidTransition");
        assert_eq!(
            json.errors,
            Some(serde_json::json!({ "current": "Created", "requested": "Delivered" }))
        );

        assert_eq!(Error::OtpInvalid.to_string_variant(), "OtpInvalid");
        assert_eq!(Error::NotAuthorized.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::NotFound(Resource::Parcel("TRK-00000000".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::AlreadyResolved(ObjectId::new()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_input_errors_share_validation_kind() {
        let invalid = Error::InvalidInput("origin is required".to_string());
        assert_eq!(invalid.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(invalid.to_string_variant(), "ValidationError");

        let malformed = Error::MalformedBody("EOF while parsing".to_string());
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(malformed.to_string_variant(), "ValidationError");

        assert_eq!(Error::DuplicateEmail.to_string_variant(), "DuplicateEmail");
        assert_eq!(Error::DuplicateEmail.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::InvalidCredentials.to_string_variant(),
            "InvalidCredentials"
        );
        assert_eq!(
            Error::InvalidCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::NotAuthorized.to_string_variant(), "NotAuthorized");
    }
}
