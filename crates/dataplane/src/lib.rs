#![doc = include_str!("../README.md")]
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`DataplaneError`, `PolicyPhase`)
//! - [`config`]: Dataplane configuration (`DataPlaneConfig`, builder)
//! - [`platform`]: Platform capabilities (`Platform` trait, `PlatformKind`)
//! - [`endpoint`]: Pod and endpoint records (`NpmPod`, `HostEndpoint`, `NpmEndpoint`)
//! - [`backend`]: External dataplane abstraction (`DataplaneBackend` trait, `NoopBackend`)
//! - [`ipsets`]: IP set types and cache (`IpSet`, `IpSetManager`)
//! - [`policies`]: Translated policies and cache (`NpmNetworkPolicy`, `PolicyManager`)
//! - [`dataplane`]: Main orchestrator (`DataPlane`)
//!
//! # Architecture
//!
//! ```text
//! controller --> DataPlane --+--> IpSetManager --+
//!                            |                   +--> DataplaneBackend
//!                            +--> PolicyManager -+
//! ```

pub mod backend;
pub mod config;
pub mod dataplane;
pub mod endpoint;
pub mod error;
pub mod ipsets;
pub mod platform;
pub mod policies;

// --- Public API Re-exports ---

// Orchestrator
pub use dataplane::DataPlane;

// Configuration
pub use config::{DataPlaneConfig, DataPlaneConfigBuilder};

// Error
pub use error::{DataplaneError, PolicyPhase};

// Backend
pub use backend::{DataplaneBackend, IpSetUpdate, NoopBackend};

// Platform
pub use platform::{LinuxPlatform, Platform, PlatformKind, WindowsPlatform};

// Endpoints
pub use endpoint::{HostEndpoint, NpmEndpoint, NpmPod};

// IP sets
pub use ipsets::{
    IpSet, IpSetManager, IpSetSpec, MemberRef, ReferenceType, SetKind, SetMembers, SetType,
};

// Policies
pub use policies::{NpmNetworkPolicy, PolicyManager};
