// Network layer: receiver input sessions and the result feed. Framing is
// deliberately thin; everything interesting happens in the coordinator.

pub mod listener;
pub mod messages;
