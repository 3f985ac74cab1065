pub mod http;
pub mod types;

pub use http::{router, AppState};
