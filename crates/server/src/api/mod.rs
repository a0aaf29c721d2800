pub mod audit;
pub mod certificates;
pub mod handlers;
pub mod middleware;
pub mod orchestrator;
pub mod routes;

pub use routes::create_router;
