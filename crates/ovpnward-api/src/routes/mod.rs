pub mod auth;
pub mod clients;
pub mod groups;
pub mod sessions;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{HttpResponse, web};

use crate::auth::AuthSettings;
use crate::sessions::{ConfiguredSource, SessionReconciler};
use crate::store::{GroupRegistry, IdentityLedger};

pub type Reconciler = SessionReconciler<ConfiguredSource>;

/// Where `GET /api/rejected` looks.
#[derive(Debug, Clone)]
pub struct RejectedLog {
    pub path: Option<PathBuf>,
    pub tail_lines: usize,
}

#[derive(Clone)]
pub struct Services {
    pub groups: Arc<GroupRegistry>,
    pub ledger: Arc<IdentityLedger>,
    pub sessions: Arc<Reconciler>,
    pub auth: AuthSettings,
    pub rejected: RejectedLog,
}

impl Services {
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::from(Arc::clone(&self.groups)))
            .app_data(web::Data::from(Arc::clone(&self.ledger)))
            .app_data(web::Data::from(Arc::clone(&self.sessions)))
            .app_data(web::Data::new(self.auth.clone()))
            .app_data(web::Data::new(self.rejected.clone()))
            .route("/health", web::get().to(health))
            .configure(auth::configure)
            .configure(groups::configure)
            .configure(clients::configure)
            .configure(sessions::configure);
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
