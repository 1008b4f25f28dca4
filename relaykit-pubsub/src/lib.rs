//! Topic-based publish/subscribe over a message broker.
//!
//! [`PubSubServer`] is the capability surface the rest of a service uses.
//! [`RedisPubSub`] backs it with Redis Streams; [`LocalPubSub`] serves
//! single-node deployments without a broker.

pub mod auth;
pub mod config;
pub mod error;
pub mod factory;
pub mod local;
pub mod publication;
pub mod redis_pubsub;
pub mod registry;
pub mod server;
pub mod waiter;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{AccessPolicy, Authenticator, Authorizer, Operation, RequestContext};
pub use config::PushServerConfig;
pub use error::{Error, Result};
pub use factory::BrokerClientFactory;
pub use local::LocalPubSub;
pub use publication::Publication;
pub use redis_pubsub::RedisPubSub;
pub use registry::{PublicationSender, Subscription, SubscriptionId};
pub use server::{new_pubsub_server, ConnectionState, PubSubServer};
pub use waiter::Waiter;
