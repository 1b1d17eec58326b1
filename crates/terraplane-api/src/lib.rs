//! terraplane-api — REST API for Terraplane.
//!
//! Thin axum handlers over the [`DeploymentService`]. Every response uses
//! the `{ success, data, error }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/projects/{project}/deployments` | List a project's deployments |
//! | POST | `/api/v1/projects/{project}/deployments` | Create a deployment |
//! | POST | `/api/v1/projects/{project}/refresh` | Queue a refresh of the project |
//! | GET | `/api/v1/projects/{project}/quota` | Quota limits and usage |
//! | PUT | `/api/v1/projects/{project}/quota` | Replace quota limits |
//! | POST | `/api/v1/projects/{project}/providers` | Register a provider |
//! | GET | `/api/v1/deployments/{id}` | Get deployment details |
//! | DELETE | `/api/v1/deployments/{id}?force=&user=` | Delete or destroy a deployment |
//! | POST | `/api/v1/deployments/{id}/start` | Start (or retry) a deployment |
//! | GET | `/api/v1/deployments/{id}/logs` | Executor log lines |
//! | POST | `/api/v1/templates` | Register a template |
//! | GET | `/api/v1/templates/{id}` | Get a template |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use terraplane_deploy::DeploymentService;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: DeploymentService,
}

/// Build the complete API router.
pub fn build_router(service: DeploymentService) -> Router {
    let state = ApiState { service };

    let api_routes = Router::new()
        .route(
            "/projects/{project}/deployments",
            get(handlers::list_deployments).post(handlers::create_deployment),
        )
        .route("/projects/{project}/refresh", post(handlers::refresh_project))
        .route(
            "/projects/{project}/quota",
            get(handlers::get_quota).put(handlers::set_quota),
        )
        .route("/projects/{project}/providers", post(handlers::register_provider))
        .route(
            "/deployments/{id}",
            get(handlers::get_deployment).delete(handlers::delete_deployment),
        )
        .route("/deployments/{id}/start", post(handlers::start_deployment))
        .route("/deployments/{id}/logs", get(handlers::deployment_logs))
        .route("/templates", post(handlers::register_template))
        .route("/templates/{id}", get(handlers::get_template))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
