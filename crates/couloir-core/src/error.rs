use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouloirError {
    #[error("Invalid protocol preface: {0}")]
    InvalidProtocol(String),

    #[error("Couloir host {0} is already opened")]
    HostTaken(String),

    #[error("Invalid couloir host {0}")]
    InvalidHost(String),

    #[error("Invalid couloir key. Please restart your couloir client.")]
    UnknownKey,

    #[error("Invalid password")]
    AuthFailed,

    #[error("No couloir is opened for {0}")]
    NoSuchCouloir(String),

    #[error("Cannot reach the local server: {0}")]
    LocalDialFailed(String),

    #[error("Certificate error: {0}")]
    Cert(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CouloirError>;
