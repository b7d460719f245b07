//! prefork - run a server as a group of processes sharing one listening port.
//!
//! See [`prefork`](crate::prefork) for the process model.

pub mod app;
pub mod error;
pub mod logging;
pub mod prefork;
pub mod tls;

pub use error::{PreforkError, Result};
pub use prefork::{
    Listener, Prefork, PreforkConfig, ProcessRole, ServeFn, Service, bind, is_worker,
};
