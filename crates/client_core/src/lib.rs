pub mod bus;
pub mod hooks;
pub mod notifications;
pub mod reconcile;
pub mod store;
pub mod transport;

pub use bus::{EventBus, Subscription};
pub use hooks::{HookHandle, Hooks};
pub use notifications::{NotificationCenter, Toast, ToastFeed};
pub use reconcile::{PollHandle, PollState, ReconciliationConfig};
pub use store::{AuthoritativeStore, HttpStore};
pub use transport::{ConnectionState, EventStream, EventStreamHandle, TransportConfig};

#[cfg(test)]
mod tests;
