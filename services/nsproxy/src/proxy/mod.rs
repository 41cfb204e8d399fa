//! L4 TCP forwarding.
//!
//! ```text
//! Client -> Dispatcher -> BackendRegistry::next -> dial -> relay -> Backend
//! ```

mod dispatcher;
mod relay;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use relay::{relay, RelayEnd, RelayStats};
