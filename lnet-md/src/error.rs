use crate::handle::MdHandle;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MdError {
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("out of memory allocating MD with {niov} fragments")]
    OutOfMemory { niov: usize },

    #[error("no such MD: {0}")]
    NotFound(MdHandle),

    #[error("injected failure: errno {0}")]
    Injected(i32),
}

impl MdError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        MdError::InvalidArg(msg.into())
    }

    /// Negative errno reported to callers that speak the C convention.
    pub fn errno(&self) -> i32 {
        match self {
            MdError::InvalidArg(_) => -libc::EINVAL,
            MdError::OutOfMemory { .. } => -libc::ENOMEM,
            MdError::NotFound(_) => -libc::ENOENT,
            MdError::Injected(errno) => *errno,
        }
    }
}

pub type Result<T> = std::result::Result<T, MdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MdError::invalid("x").errno(), -libc::EINVAL);
        assert_eq!(MdError::OutOfMemory { niov: 3 }.errno(), -libc::ENOMEM);
        assert_eq!(MdError::NotFound(MdHandle::INVALID).errno(), -libc::ENOENT);
        assert_eq!(MdError::Injected(-libc::EPROTO).errno(), -libc::EPROTO);
    }
}
