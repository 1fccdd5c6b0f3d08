pub mod controller;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use controller::context::Context as ControllerContext;
pub use controller::{ControllerId, State};
pub use error::{Error, Result};
