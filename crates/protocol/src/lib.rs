//! Wire protocol shared by Tether clients and servers.
//!
//! Every frame is a JSON [`envelope::Message`]; request/response pairs are
//! correlated by the envelope `id`, push events by the subscription id in
//! their payload.

pub mod constants;
pub mod envelope;
pub mod messages;
