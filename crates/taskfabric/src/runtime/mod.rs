//! Worker runtime and stream ingress.

mod ingress;
mod worker;

pub use ingress::{GroupHealth, Ingress, IngressError};
pub use worker::{WorkerHandle, WorkerRuntime};
