use axum::Json;

use super::auth::{UserModel, UserResponse};

pub async fn profile(user: UserModel) -> Json<UserResponse> {
    Json(user.into())
}
