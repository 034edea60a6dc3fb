pub mod broadcast;
pub mod presence;
pub mod router;
pub mod session;

pub use broadcast::NotificationBroadcaster;
pub use presence::PresenceNotifier;
pub use router::DeliveryRouter;
pub use session::{ClientHandle, ConnId, SessionRegistry};
