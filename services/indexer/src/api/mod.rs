//! Control surface: HTTP control endpoints and the WebSocket progress
//! stream. Authentication happens out-of-band in the surrounding glue; the
//! caller identity arrives as a plain user id.

pub mod http;
pub mod stream;
