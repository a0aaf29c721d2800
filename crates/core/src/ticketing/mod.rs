//! Ticketing system abstraction and the ServiceNow implementation.

mod servicenow;
mod types;

pub use servicenow::ServiceNowClient;
pub use types::*;
