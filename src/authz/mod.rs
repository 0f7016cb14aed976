//! Per-user, per-resource authorization for the tracking API.
//!
//! A request is classified by [`routes::RouteTable`], its parameters are read
//! by [`params::RequestParams`], and the user's effective level on the target
//! comes from [`resolver::Resolver`]. [`middleware::authorize`] ties these
//! together and runs the after-response [`hooks`].

pub mod authn;
pub mod filter;
pub mod hooks;
pub mod middleware;
pub mod params;
pub mod permissions;
pub mod resolver;
pub mod routes;
pub mod token;
