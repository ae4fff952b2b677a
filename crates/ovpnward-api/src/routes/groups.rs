use actix_web::{HttpResponse, web};
use ovpnward_types::{
    ActionResponse, CreateGroupResponse, GroupCounters, GroupRequest, GroupView, GroupsResponse,
    NextRangeResponse, OrderedGroups, RecalculateResponse,
};

use crate::error::ApiError;
use crate::extract::AdminSession;
use crate::store::{AddressRange, Group, GroupRegistry, IdentityLedger};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/groups", web::get().to(list_groups))
        .route("/api/groups", web::post().to(create_group))
        .route("/api/groups/{id}", web::put().to(update_group))
        .route("/api/next-group-range", web::get().to(next_group_range))
        .route("/api/recalculate", web::post().to(recalculate));
}

fn capacity(range: &AddressRange) -> u32 {
    u32::try_from(range.len()).unwrap_or(u32::MAX)
}

fn group_view(group: &Group, registry: &GroupRegistry, ledger: &IdentityLedger) -> GroupView {
    let next_ip = registry
        .cursor(&group.id)
        .map_or(u64::from(group.range.start), |c| c.next);
    GroupView {
        name: group.name.clone(),
        icon: group.icon.clone(),
        range_start: group.range.start,
        range_end: group.range.end,
        next_ip,
        start_ip: group.range.start_ip().to_string(),
        end_ip: group.range.end_ip().to_string(),
        capacity: capacity(&group.range),
        client_count: ledger.client_count(&group.id),
        is_system: group.is_system,
        can_see_all: group.can_see_all,
    }
}

#[tracing::instrument(skip_all)]
async fn list_groups(
    _admin: AdminSession,
    registry: web::Data<GroupRegistry>,
    ledger: web::Data<IdentityLedger>,
) -> HttpResponse {
    let groups = registry
        .list_groups()
        .iter()
        .map(|g| (g.id.clone(), group_view(g, &registry, &ledger)))
        .collect();
    HttpResponse::Ok().json(GroupsResponse {
        groups: OrderedGroups(groups),
    })
}

#[tracing::instrument(skip(_admin, registry, ledger))]
async fn create_group(
    _admin: AdminSession,
    body: web::Json<GroupRequest>,
    registry: web::Data<GroupRegistry>,
    ledger: web::Data<IdentityLedger>,
) -> Result<HttpResponse, ApiError> {
    let group = registry
        .create_group(&body.name, body.icon.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(CreateGroupResponse {
        success: true,
        group_id: group.id.clone(),
        group: group_view(&group, &registry, &ledger),
    }))
}

#[tracing::instrument(skip(_admin, registry))]
async fn update_group(
    _admin: AdminSession,
    path: web::Path<String>,
    body: web::Json<GroupRequest>,
    registry: web::Data<GroupRegistry>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    registry
        .update_group(&id, &body.name, body.icon.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(ActionResponse::ok()))
}

#[tracing::instrument(skip_all)]
async fn next_group_range(
    _admin: AdminSession,
    registry: web::Data<GroupRegistry>,
) -> HttpResponse {
    let body = match registry.preview() {
        Some(range) => NextRangeResponse {
            available: true,
            start_ip: Some(range.start_ip().to_string()),
            end_ip: Some(range.end_ip().to_string()),
            capacity: Some(capacity(&range)),
        },
        None => NextRangeResponse {
            available: false,
            start_ip: None,
            end_ip: None,
            capacity: None,
        },
    };
    HttpResponse::Ok().json(body)
}

#[tracing::instrument(skip_all)]
async fn recalculate(
    _admin: AdminSession,
    ledger: web::Data<IdentityLedger>,
) -> Result<HttpResponse, ApiError> {
    let usage = ledger.recalculate().await?;
    let groups = usage
        .into_iter()
        .map(|(id, u)| {
            (
                id,
                GroupCounters {
                    next_ip: u.cursor.next,
                    reclaimed: u.cursor.reclaimed,
                    active: u.active,
                },
            )
        })
        .collect();
    Ok(HttpResponse::Ok().json(RecalculateResponse {
        success: true,
        groups,
    }))
}
