//! The offline cache agent: install, activate and fetch handlers.

mod handlers;
mod manifest;
mod router;

pub use handlers::{ActivateReport, CacheAgent};
pub use manifest::{Manifest, DEFAULT_MANIFEST};
pub use router::{RouteMatcher, Strategy};
