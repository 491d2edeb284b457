mod channel_error;
mod fleet_error;

pub use channel_error::ChannelError;
pub use fleet_error::{FleetError, FleetErrorKind};
