use actix_web::{HttpResponse, web};
use ovpnward_types::{ActionResponse, LoginRequest};

use crate::auth::{AuthSettings, clear_auth_cookie, create_token, set_auth_cookie, verify_password};
use crate::error::ApiError;
use crate::extract::AdminSession;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/auth")
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout)),
    );
}

#[tracing::instrument(skip_all)]
async fn login(
    body: web::Json<LoginRequest>,
    settings: web::Data<AuthSettings>,
) -> Result<HttpResponse, ApiError> {
    if body.password.is_empty() {
        return Err(ApiError::Validation("password is required".into()));
    }
    if !verify_password(&settings.admin_password_hash, &body.password)? {
        tracing::info!("login failed: invalid password");
        return Err(ApiError::Unauthorized("invalid credentials".into()));
    }

    let token = create_token(&settings.jwt_secret)?;
    tracing::info!("admin login");

    Ok(HttpResponse::Ok()
        .cookie(set_auth_cookie(&token))
        .json(ActionResponse::ok()))
}

#[tracing::instrument(skip_all)]
async fn logout(_admin: AdminSession) -> HttpResponse {
    HttpResponse::Ok()
        .cookie(clear_auth_cookie())
        .json(ActionResponse::ok())
}
