//! API route handlers

pub mod access;
pub mod admin;
pub mod ingest;
pub mod query;
pub mod replication;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/collections", get(admin::list_collections))
        .route("/api/featureflags", get(admin::feature_flags))
        .route("/:collection", get(query::query).post(ingest::post))
        .route("/:collection/delete", post(ingest::delete))
        .route("/:collection/stats", get(admin::stats))
        .route("/:collection/captures", get(admin::captures))
        .route("/:collection/aliases", get(admin::aliases))
        .route("/:collection/sequence", get(replication::sequence))
        .route("/:collection/changes", get(replication::changes))
        .route(
            "/:collection/truncate_replication",
            post(replication::truncate),
        );

    if state.config().experimental_access_control {
        router = router
            .route(
                "/:collection/ap/:accesspoint",
                get(query::query_access_point),
            )
            .route(
                "/:collection/ap/:accesspoint/check",
                get(access::check).post(access::check_bulk),
            )
            .route(
                "/:collection/access/rules",
                get(access::list_rules).post(access::post_rules),
            )
            .route("/:collection/access/rules/new", get(access::new_rule))
            .route(
                "/:collection/access/rules/:ruleId",
                get(access::get_rule).delete(access::delete_rule),
            )
            .route(
                "/:collection/access/policies",
                get(access::list_policies).post(access::post_policy),
            )
            .route(
                "/:collection/access/policies/:policyId",
                get(access::get_policy),
            );
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
