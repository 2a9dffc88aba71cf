pub mod broker;
pub mod correlation;
pub mod error;
pub mod gate;
pub mod params;
pub mod random;
pub mod subscriptions;

pub use broker::{Broker, BrokerStats, Outbound};
pub use correlation::{CorrelationError, CorrelationTable, PendingCall};
pub use error::DispatchError;
pub use gate::AuthorizationGate;
pub use params::Method;
pub use random::{CallIdSource, OsCallIds};
pub use subscriptions::SubscriptionRegistry;
