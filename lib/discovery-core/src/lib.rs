//! Core service discovery functionality
//!
//! This library provides:
//! - Service records and the heartbeat payload that produces them
//! - Path normalization and longest-prefix request resolution
//! - The service registry with its liveness sweep

pub mod clock;
pub mod error;
pub mod path;
pub mod record;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use path::{normalize_path, PathMatcher};
pub use record::{HeartbeatMessage, ServiceRecord};
pub use registry::{RegistryConfig, ResolvedPath, ServiceRegistry};
