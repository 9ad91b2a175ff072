use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("element name already registered: {0}")]
    DuplicateElement(String),
    #[error("no element for path: {0}")]
    NoSuchElement(String),
    #[error("downstream refused the request for: {0}")]
    RegistrationFailure(String),
    #[error("element is closing")]
    CloseInProgress,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid regular expression: {0}")]
    InvalidRegex(#[from] regex::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
