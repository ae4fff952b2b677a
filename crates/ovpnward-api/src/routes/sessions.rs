use actix_web::{HttpResponse, web};
use ovpnward_types::{ConnectedResponse, RejectedResponse};

use super::{Reconciler, RejectedLog};
use crate::extract::AdminSession;
use crate::sessions::rejected;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/connected", web::get().to(connected))
        .route("/api/status", web::get().to(status))
        .route("/api/rejected", web::get().to(rejected_clients));
}

#[tracing::instrument(skip_all)]
async fn connected(_admin: AdminSession, sessions: web::Data<Reconciler>) -> HttpResponse {
    HttpResponse::Ok().json(ConnectedResponse {
        clients: sessions.connected(),
    })
}

#[tracing::instrument(skip_all)]
async fn status(_admin: AdminSession, sessions: web::Data<Reconciler>) -> HttpResponse {
    HttpResponse::Ok().json(sessions.status())
}

#[tracing::instrument(skip_all)]
async fn rejected_clients(_admin: AdminSession, log: web::Data<RejectedLog>) -> HttpResponse {
    let clients = rejected::rejected_clients(log.path.as_deref(), log.tail_lines).await;
    HttpResponse::Ok().json(RejectedResponse { clients })
}
