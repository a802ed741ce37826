use std::{error::Error, fmt};

/// Renders an error followed by its chain of sources, separated by `: `.
///
/// `anyhow` does the same with `{:#}`. This is for typed errors that go straight into a log line.
pub fn err_with_src<'a>(e: &'a (dyn Error + 'static)) -> ErrorWithSources<'a> {
    ErrorWithSources { e }
}

pub struct ErrorWithSources<'a> {
    e: &'a (dyn Error + 'static),
}

impl fmt::Display for ErrorWithSources<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.e)?;

        let mut source = self.e.source();
        while let Some(e) = source {
            write!(f, ": {e}")?;
            source = e.source();
        }

        Ok(())
    }
}
