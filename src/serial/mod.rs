//! Framed binary control protocol and the host-facing control plane.

pub mod catalog;
pub mod child;
pub mod control;
pub mod event;
pub mod frame;

pub use catalog::Catalog;
pub use control::{Controller, ControllerConfig, Mode};
pub use event::{Event, EventId};
pub use frame::{encode, FrameReader, MAX_PAYLOAD, SOH};
