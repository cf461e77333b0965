//! UI-facing event types.
//!
//! The cycle core has no network or file surface; its boundary is these
//! serde-serializable events broadcast to whatever front end hosts it.

pub mod events;
