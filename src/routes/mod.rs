pub mod auth;
pub mod rate_limit;
#[allow(clippy::module_inception)]
pub mod routes;
