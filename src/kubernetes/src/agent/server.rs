use std::{net::IpAddr, sync::Arc};

use actix_web::{
    error::{InternalError, QueryPayloadError},
    get,
    http::StatusCode,
    web::{self, Data},
    HttpRequest, HttpResponse, Responder,
};
use bgpcp_bgp::{
    error::Error as BgpError,
    family::Family,
    manager::RouterManager,
    path::{RouteQuery, TableType},
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;

use crate::{context::State, tables::ReconcileErrorTable};

use super::controller::{ControllerState, StateHandle};

/// What the read API serves from.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<dyn RouterManager>,
    pub errors: Arc<ReconcileErrorTable>,
    pub controller: StateHandle,
}

/// Register every route of the agent on an actix app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(query_error))
        .service(index)
        .service(health)
        .service(ready)
        .service(metrics_)
        .service(peers)
        .service(routes)
        .service(route_policies)
        .service(errors);
}

fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(&err);
    InternalError::from_response(err, response).into()
}

fn bad_request(err: &dyn std::fmt::Display) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": err.to_string() }))
}

fn disabled() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(json!({ "error": "BGP Control Plane is disabled" }))
}

fn from_bgp(err: BgpError) -> HttpResponse {
    let status = match err {
        BgpError::RouterNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpResponse::build(status).json(json!({ "error": err.to_string() }))
}

#[derive(Debug, Deserialize)]
struct PeersQuery {
    asn: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RoutesQuery {
    asn: Option<u32>,
    family: Option<String>,
    table: Option<String>,
    neighbor: Option<IpAddr>,
}

impl RoutesQuery {
    fn to_route_query(&self) -> Result<RouteQuery, BgpError> {
        let family = self
            .family
            .as_deref()
            .map(|f| f.parse::<Family>())
            .transpose()?;
        let table = self
            .table
            .as_deref()
            .map(|t| t.parse::<TableType>())
            .transpose()?
            .unwrap_or_default();
        Ok(RouteQuery {
            family,
            table,
            neighbor: self.neighbor,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorsQuery {
    instance: Option<String>,
}

#[get("/bgp/peers")]
async fn peers(api: Data<ApiState>, query: web::Query<PeersQuery>) -> impl Responder {
    if api.controller.get() == ControllerState::Disabled {
        return disabled();
    }
    match api.manager.get_peers(query.asn).await {
        Ok(peers) => HttpResponse::Ok().json(peers),
        Err(e) => from_bgp(e),
    }
}

#[get("/bgp/routes")]
async fn routes(api: Data<ApiState>, query: web::Query<RoutesQuery>) -> impl Responder {
    if api.controller.get() == ControllerState::Disabled {
        return disabled();
    }
    let route_query = match query.to_route_query() {
        Ok(q) => q,
        Err(e) => return bad_request(&e),
    };
    match api.manager.get_routes(query.asn, &route_query).await {
        Ok(routes) => HttpResponse::Ok().json(routes),
        Err(e) => from_bgp(e),
    }
}

#[get("/bgp/route-policies")]
async fn route_policies(api: Data<ApiState>, query: web::Query<PeersQuery>) -> impl Responder {
    if api.controller.get() == ControllerState::Disabled {
        return disabled();
    }
    match api.manager.get_route_policies(query.asn).await {
        Ok(policies) => {
            let policies: Vec<_> = policies.into_values().flatten().collect();
            HttpResponse::Ok().json(policies)
        }
        Err(e) => from_bgp(e),
    }
}

#[get("/bgp/errors")]
async fn errors(api: Data<ApiState>, query: web::Query<ErrorsQuery>) -> impl Responder {
    if api.controller.get() == ControllerState::Disabled {
        return disabled();
    }
    let rows = match &query.instance {
        Some(instance) => api.errors.list_instance(instance),
        None => api.errors.list(),
    };
    HttpResponse::Ok().json(rows)
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(api: Data<ApiState>, _: HttpRequest) -> impl Responder {
    match api.controller.get() {
        ControllerState::Idle | ControllerState::Reconciling | ControllerState::Disabled => {
            HttpResponse::Ok().json("ready")
        }
        state => HttpResponse::ServiceUnavailable().json(state.to_string()),
    }
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(e) => HttpResponse::InternalServerError().json(json!({ "error": e.to_string() })),
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
