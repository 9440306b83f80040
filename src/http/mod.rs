//! Request/response snapshots and the network side of the agent.

mod client;
mod request;
mod response;

pub use client::{Fetcher, HttpFetcher};
pub use request::Request;
pub use response::Response;
