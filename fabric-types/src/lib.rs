pub mod agent;
pub mod connection;
pub mod fab;
pub mod meta;
pub mod store;
pub mod vpc;
pub mod wiring;

pub use connection::{Connection, ConnectionKind, Link, Port};
pub use meta::{LabelSelector, Meta};
pub use store::{Object, StoreClient, StoreError};
pub use wiring::{External, Gateway, Server, Switch, SwitchRole};
