use std::io;
use thiserror::Error;

/// Errors visible to callers of the byte-stream channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("device is no longer attached")]
    DeviceAbsent,

    #[error("operation would block")]
    WouldBlock,

    #[error("interrupted while waiting")]
    Interrupted,

    #[error("transport was reset")]
    TransportReset,

    #[error("transfer failed")]
    Io,

    #[error("out of memory for transfer buffer")]
    OutOfMemory,

    #[error("destination buffer is smaller than the requested count")]
    BadAddress,
}

impl ChannelError {
    pub fn kind(self) -> io::ErrorKind {
        match self {
            ChannelError::DeviceAbsent => io::ErrorKind::NotConnected,
            ChannelError::WouldBlock => io::ErrorKind::WouldBlock,
            ChannelError::Interrupted => io::ErrorKind::Interrupted,
            ChannelError::TransportReset => io::ErrorKind::ConnectionReset,
            ChannelError::Io => io::ErrorKind::Other,
            ChannelError::OutOfMemory => io::ErrorKind::OutOfMemory,
            ChannelError::BadAddress => io::ErrorKind::InvalidInput,
        }
    }
}

impl From<ChannelError> for io::Error {
    fn from(err: ChannelError) -> Self {
        io::Error::new(err.kind(), err)
    }
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let err: io::Error = ChannelError::WouldBlock.into();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let err: io::Error = ChannelError::TransportReset.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "transport was reset");

        assert_eq!(ChannelError::Interrupted.kind(), io::ErrorKind::Interrupted);
        assert_eq!(ChannelError::DeviceAbsent.kind(), io::ErrorKind::NotConnected);
    }
}
