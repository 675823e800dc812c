pub mod bus;
pub mod emitter;
pub mod types;

pub use bus::{BroadcastBus, Envelope, EventBus};
pub use emitter::{Delivery, EmitterHandle, TransitionEmitter};
pub use types::{TransitionDetail, TransitionEvent, TransitionType};
