pub mod models;
pub mod repo;
pub mod service;

pub use models::*;
pub use repo::*;
pub use service::*;
