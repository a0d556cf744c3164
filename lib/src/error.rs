use thiserror::Error;

#[derive(Error, Debug)]
pub enum WzError {
    #[error("I/O error: {0}, {1}")]
    Io(String, #[source] std::io::Error),
    #[error("Malformed archive: {0}")]
    Format(String),
    #[error("No cipher key matches the probe string")]
    Locale,
    #[error("Additional context for error: {0}, {1}")]
    Context(String, #[source] Box<WzError>),
}

impl WzError {
    pub fn add_context(self, message: impl Into<String>) -> Self {
        Self::Context(message.into(), Box::new(self))
    }
}
