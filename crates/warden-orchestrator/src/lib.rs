//! Wires the pipeline, policy engine, admin service, message bus, and
//! scheduler into one running process: the part of the system that has no
//! single-responsibility crate of its own because its job is composition.
//!
//! Grounds on `examples/original_source/yeoman/app/bootstrap.py` for the
//! shape of the wiring, and on the teacher's `skynet-gateway` for the
//! logging/config bootstrap idiom.

pub mod null_ports;
pub mod ports;
pub mod service;

pub use ports::TypingNotifierPort;
pub use service::OrchestratorService;
