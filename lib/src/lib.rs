mod api;
pub mod codec;
mod config;
pub mod drill;
mod event;
pub mod handshake;
mod message;
pub mod shot;

pub use api::*;
pub use config::*;
pub use drill::{Drill, DrillError, DrillLibrary, DrillLookup, DrillStep, Level};
pub use event::*;
pub use handshake::{Handshake, HandshakeStage, HandshakeStep};
pub use message::*;
pub use shot::{Rotation, ShotParameters, ShotPhysics};
