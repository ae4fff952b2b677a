// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{HttpResponse, web};
use ovpnward_types::{
    ActionResponse, ClientSummary, ClientsResponse, CreateClientRequest, CreateClientResponse,
    RevokeClientRequest,
};

use crate::error::ApiError;
use crate::extract::AdminSession;
use crate::store::IdentityLedger;

const PROFILE_CONTENT_TYPE: &str = "application/x-openvpn-profile";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/clients", web::get().to(list_clients))
        .route("/api/create", web::post().to(create_client))
        .route("/api/revoke", web::post().to(revoke_client))
        .route("/download/{name}", web::get().to(download));
}

#[tracing::instrument(skip_all)]
async fn list_clients(_admin: AdminSession, ledger: web::Data<IdentityLedger>) -> HttpResponse {
    let mut clients: Vec<ClientSummary> = ledger
        .list_clients(false)
        .into_iter()
        .map(|c| ClientSummary {
            name: c.name,
            group: c.group_id,
            ip: c.ip.to_string(),
        })
        .collect();
    clients.sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.name.cmp(&b.name)));
    HttpResponse::Ok().json(ClientsResponse { clients })
}

#[tracing::instrument(skip_all, fields(name = %body.name, group = %body.group))]
async fn create_client(
    _admin: AdminSession,
    body: web::Json<CreateClientRequest>,
    ledger: web::Data<IdentityLedger>,
) -> Result<HttpResponse, ApiError> {
    let (client, _bundle) = ledger
        .create_client(&body.name, &body.group, &body.password)
        .await?;
    Ok(HttpResponse::Ok().json(CreateClientResponse {
        success: true,
        name: client.name,
        ip: client.ip.to_string(),
        group: client.group_id,
    }))
}

#[tracing::instrument(skip_all, fields(name = %body.name))]
async fn revoke_client(
    _admin: AdminSession,
    body: web::Json<RevokeClientRequest>,
    ledger: web::Data<IdentityLedger>,
) -> Result<HttpResponse, ApiError> {
    ledger.revoke_client(&body.name, &body.password).await?;
    Ok(HttpResponse::Ok().json(ActionResponse::ok()))
}

#[tracing::instrument(skip(_admin, ledger))]
async fn download(
    _admin: AdminSession,
    path: web::Path<String>,
    ledger: web::Data<IdentityLedger>,
) -> Result<HttpResponse, ApiError> {
    let bundle = ledger.download(&path)?;
    Ok(HttpResponse::Ok()
        .content_type(PROFILE_CONTENT_TYPE)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(bundle.file_name())],
        })
        .body(bundle.profile))
}
