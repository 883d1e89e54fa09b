//! Serde event types exchanged with the host application.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` with camelCase
//! field names so they can be logged or forwarded as JSON unchanged.

pub mod events;
