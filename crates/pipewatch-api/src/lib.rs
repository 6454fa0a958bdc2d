pub mod handlers;
pub mod router;
pub mod types;

pub use router::api_router;
