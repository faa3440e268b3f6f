//! HTTP admission gate and the demo server that hosts it.

mod gate;
mod server;

pub use gate::{
    too_many_requests, AdmissionGate, AdmissionLayer, IdentityResolver, API_KEY_HEADER,
    BLOCKED_MESSAGE, REAL_IP_HEADER,
};
pub use server::HttpServer;
