/// Session error types.
#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    UpstreamName(rustls::pki_types::InvalidDnsNameError),
    /// The flight's leader went away before publishing a result.
    FlightAbandoned,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::UpstreamName(e) => write!(f, "invalid upstream host: {}", e),
            SessionError::FlightAbandoned => write!(f, "in-flight query was abandoned"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<rustls::pki_types::InvalidDnsNameError> for SessionError {
    fn from(e: rustls::pki_types::InvalidDnsNameError) -> Self {
        SessionError::UpstreamName(e)
    }
}
