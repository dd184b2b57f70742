//! Process entrypoint library: configuration loading, collaborator
//! bootstrap, and loop dispatch for the `dcp` binary.

pub mod error;
pub mod runtime;

pub use error::DcpError;
pub use runtime::Engine;
