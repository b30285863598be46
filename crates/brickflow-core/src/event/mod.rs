pub mod bus;
pub mod overlay;

pub use bus::{EventBus, Handler, ScopedEmitter, SubscriptionId};
pub use overlay::{OverlayChannel, OverlayError};
