pub mod auth;
pub mod refresh;
pub mod routes;
pub mod state;

pub use refresh::RefreshRegistry;
pub use routes::create_router;
pub use state::AppState;
