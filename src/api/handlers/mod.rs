//! API handlers for atesti.
//!
//! Route handlers are grouped by concern: `auth` carries the grant, passkey,
//! and session endpoints; `health` reports service and database status.

pub mod auth;
pub mod health;
