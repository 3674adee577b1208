//! Small shared helpers.

use std::error::Error;
use std::fmt;

/// Displays an error together with its full `source()` chain.
///
/// Non-fatal failures are logged and swallowed all over this crate; a
/// bare `Display` of the outer error often hides the interesting cause
/// (an io error under a protocol error, a hyper error under a reqwest
/// one). Log sites wrap the error in this so the whole chain lands in
/// one log field, `: `-separated.
pub struct ErrorChain<'a>(pub &'a dyn Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {cause}")?;
            source = cause.source();
        }
        Ok(())
    }
}
