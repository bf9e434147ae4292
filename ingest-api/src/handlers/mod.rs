mod app;
mod publish;
mod query;

pub use app::{add_routes, AppState};
