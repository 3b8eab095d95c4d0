//! canary-api — REST interface to the canary controller.
//!
//! CI pipelines submit rollouts here; operators promote, roll back and
//! resolve degraded services.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/rollouts` | Submit a rollout request |
//! | GET | `/api/v1/releases` | List all service releases |
//! | GET | `/api/v1/releases/{service}` | Get one release |
//! | GET | `/api/v1/releases/{service}/history` | Rollout records, oldest first |
//! | GET | `/api/v1/releases/{service}/groups` | Instance groups and their last health verdict |
//! | POST | `/api/v1/releases/{service}/promote` | Promote the canary under evaluation |
//! | POST | `/api/v1/releases/{service}/rollback` | Abandon the rollout in progress |
//! | POST | `/api/v1/releases/{service}/resolve` | Clear a degraded service |
//! | GET | `/api/v1/routes` | Current weight map |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use canary_controller::CanaryController;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: CanaryController,
}

/// Build the complete API router.
pub fn build_router(controller: CanaryController) -> Router {
    let state = ApiState { controller };

    let api_routes = Router::new()
        .route("/rollouts", post(handlers::submit_rollout))
        .route("/releases", get(handlers::list_releases))
        .route("/releases/{service}", get(handlers::get_release))
        .route("/releases/{service}/history", get(handlers::release_history))
        .route("/releases/{service}/groups", get(handlers::release_groups))
        .route("/releases/{service}/promote", post(handlers::promote))
        .route("/releases/{service}/rollback", post(handlers::rollback))
        .route("/releases/{service}/resolve", post(handlers::resolve))
        .route("/routes", get(handlers::list_routes))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
