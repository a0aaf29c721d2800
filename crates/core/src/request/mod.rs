//! Certificate request types and the request validator.

mod types;
mod validator;

pub use types::*;
pub use validator::{
    common_name, is_distinguished_name, is_dns_name, parse_ttl, RequestValidator,
};
