//! Persisted document types
//!
//! Entities reference each other by id only; the database is the single
//! source of truth and no in-memory structure outlives a scheduling tick.

mod callback;
mod connector;
mod container;
mod node;
mod task;

pub use callback::{CallbackContent, CallbackPayload, Telemetry};
pub use connector::{Connector, NotificationAccess, NotificationAuth, NotificationConnector};
pub use container::{ApplicationContainer, DataContainer};
pub use node::{DeadNode, NodeRecord};
pub use task::{ApplicationContainerDescription, RegistryAuth, Task, TaskGroup};
