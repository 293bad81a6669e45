pub mod models;
pub mod paseto;
pub mod repo;
pub mod service;

pub use models::*;
pub use paseto::*;
pub use repo::*;
pub use service::*;
