// API module
//
// HTTP presentation layer over the Blockchain service

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use routes::configure_routes;
