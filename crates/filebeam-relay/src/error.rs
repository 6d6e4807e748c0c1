//! Error types for the relay

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal startup errors. Each one ends the process with a non-zero exit code.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RelayError {
    /// Classify a bind failure for `addr`
    pub fn from_bind(addr: SocketAddr, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            RelayError::PortInUse { port: addr.port() }
        } else {
            RelayError::Listen { addr, source }
        }
    }
}

/// Per-event errors. These are logged and the event is dropped; the client
/// never hears about them.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("malformed payload for {event}: {source}")]
    MalformedPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("event announces {0} binary frames, more than allowed")]
    TooManyAttachments(usize),

    #[error("binary frame of {0} bytes with no event waiting for it")]
    UnexpectedBinary(usize),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_in_use_maps_to_port_in_use() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let err = RelayError::from_bind(addr, io::Error::from(io::ErrorKind::AddrInUse));

        assert!(matches!(err, RelayError::PortInUse { port: 5000 }));
        assert_eq!(err.to_string(), "port 5000 is already in use");
    }

    #[test]
    fn test_other_bind_errors_keep_source() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let err = RelayError::from_bind(addr, io::Error::from(io::ErrorKind::PermissionDenied));

        match err {
            RelayError::Listen { addr: a, source } => {
                assert_eq!(a, addr);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
