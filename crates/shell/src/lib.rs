//! Persistent shell session manager: so that consecutive commands share
//! environment and working directory, and so a command that
//! wants live input can be driven interactively via [`ShellPool::write_stdin`].
//!
//! Polling for the sentinel line is deliberate: the child's stdout is a
//! single undifferentiated byte stream, so a
//! dedicated background task continuously drains it into a
//! [`stream::RetainedStream`] and callers poll that buffer for the marker
//! rather than trying to frame the pipe itself.

mod error;
mod pool;
mod session;
mod stream;

pub use error::{Result, ShellError};
pub use pool::{ShellPool, SessionInfo};
pub use session::{CommandOutput, CompletedBlock, WriteStdinOutput};
pub use stream::RetainedStream;
