// Relay fabric — stateless request piping and stateful circuits

mod circuit;
mod service;

pub use circuit::RelayCircuit;
pub use service::{RelayDataOutcome, RelayService, RelayStats};
