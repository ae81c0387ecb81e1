pub mod queue;
pub mod session;

pub use queue::*;
pub use session::*;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
