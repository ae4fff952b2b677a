use std::future::{Ready, ready};

use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};

use crate::auth::{AuthSettings, COOKIE_NAME, Claims, validate_token};
use crate::error::ApiError;

#[derive(Debug)]
pub struct AdminSession {
    pub claims: Claims,
}

impl FromRequest for AdminSession {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract_session(req))
    }
}

fn extract_session(req: &HttpRequest) -> Result<AdminSession, ApiError> {
    let settings = req
        .app_data::<Data<AuthSettings>>()
        .ok_or(ApiError::Internal)?;

    let cookie = req.cookie(COOKIE_NAME).ok_or_else(ApiError::unauthenticated)?;
    let claims = validate_token(cookie.value(), &settings.jwt_secret)?;

    Ok(AdminSession { claims })
}
