// src/oracle/mod.rs - Asynchronous client for the simulation oracle

pub mod correlator;
pub mod link;
pub mod protocol;
pub mod session;

pub use correlator::Correlator;
pub use link::OracleLink;
pub use protocol::{ModelRef, Parameter, SessionId};
pub use session::{Session, SessionLane};
