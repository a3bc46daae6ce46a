//! REST surface. Three thin handler modules sitting above the same core
//! components the socket path uses — `store`, `auth_service`, `broadcaster`
//! — so a REST request and a socket frame can never see divergent state.

pub mod auth;
pub mod conversations;
pub mod messages;
pub mod users;

use crate::auth::AuthMiddleware;
use crate::broadcaster::Broadcaster;
use crate::hub::Hub;
use crate::pubsub::PubSub;
use crate::store::DbPool;
use crate::token::TokenService;
use axum::extract::FromRef;
use std::sync::Arc;

/// Composite Axum state. Every field is cheap to clone (pools and `Arc`s),
/// matching the teacher's `AppState` shape.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: DbPool,
    pub pubsub: Arc<dyn PubSub>,
    pub hub: Arc<Hub>,
    pub tokens: TokenService,
    pub auth_middleware: AuthMiddleware,
    pub broadcaster: Broadcaster,
}
