//! The `broker` module ties the membership store and the connection
//! registry together.
//!
//! - `lifecycle`: connect/disconnect handling and the disconnect cascade.
//! - `engine`: topic fan-out with self-healing eviction.
//! - `hub`: the facade handlers and the transport talk to.

pub mod engine;
pub mod gate;
pub mod hub;
pub mod lifecycle;
pub mod message;

pub use engine::{BroadcastPolicy, Broadcaster, DeliveryFailure, DeliveryReport, FailureReason};
pub use gate::ClientGates;
pub use hub::Hub;
pub use lifecycle::{CloseOutcome, Lifecycle, LifecycleSettings, OpenOutcome};
pub use message::Message;
