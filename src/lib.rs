// numakv - NUMA-aware memory subsystem for key-value stores
// Node-local allocation, per-value hotness tracking and value migration

#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod clock;
pub mod command;
pub mod config;
pub mod context;
pub mod hotness;
pub mod keyspace;
pub mod maintenance;
pub mod migrate;
pub mod numa;
pub mod policy;
pub mod scheduler;
pub mod value;

// Re-exports for convenience
pub use alloc::{NodeAllocator, NodeBuf, Tier};
pub use config::NumaConfig;
pub use context::NumaContext;
pub use numa::{NodeId, NodeMemory, SimulatedTopology, SystemTopology};
pub use value::{PlainValue, Value};

/// numakv error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("Unsupported type: {0}")]
        UnsupportedType(String),

        #[error("Already exists: {0}")]
        AlreadyExists(String),

        /// A queued migration exceeded its wait bound
        #[error("Timeout: {0}")]
        Timeout(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Stable short code used in control-surface replies
        pub fn kind(&self) -> &'static str {
            match self {
                Error::InvalidArgument(_) => "invalid-argument",
                Error::NotFound(_) => "not-found",
                Error::OutOfMemory(_) => "out-of-memory",
                Error::UnsupportedType(_) => "unsupported-type",
                Error::AlreadyExists(_) => "already-exists",
                Error::Timeout(_) => "timeout",
                Error::Config(_) => "config",
                Error::Internal(_) => "internal",
            }
        }

        /// The message without the kind prefix
        pub fn message(&self) -> &str {
            match self {
                Error::InvalidArgument(m)
                | Error::NotFound(m)
                | Error::OutOfMemory(m)
                | Error::UnsupportedType(m)
                | Error::AlreadyExists(m)
                | Error::Timeout(m)
                | Error::Config(m)
                | Error::Internal(m) => m,
            }
        }
    }

    impl From<::config::ConfigError> for Error {
        fn from(e: ::config::ConfigError) -> Self {
            Error::Config(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
