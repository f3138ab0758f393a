//! Defines routes for the cart operations.
//!
//! ## Structure
//! - **Cart endpoints** (`uid` is everything after the leading `/`)
//!   - `GET    /{*uid}`: stream the bundle as a tar archive
//!   - `HEAD   /{*uid}`: cart status
//!   - `POST   /{*uid}`: stage files into a new cart
//!   - `DELETE /{*uid}`: delete every live cart for the uid
//!
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`
//!
//! `/` answers every cart verb with the usual "invalid uid" error rather
//! than a bare 404.

use crate::{
    handlers::{
        cart_handlers::{delete_cart, get_cart, head_cart, missing_uid, stage_cart},
        health_handlers::{healthz, readyz},
    },
    services::cart_service::CartService,
};
use axum::{Router, routing::get};

/// Build the router carrying `CartService` as shared state.
pub fn routes() -> Router<CartService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/",
            get(missing_uid)
                .head(missing_uid)
                .post(missing_uid)
                .delete(missing_uid),
        )
        .route(
            "/{*uid}",
            get(get_cart)
                .head(head_cart)
                .post(stage_cart)
                .delete(delete_cart),
        )
}
