//! 정책 캐시와 매니저

pub mod manager;
pub mod types;

pub use manager::PolicyManager;
pub use types::NpmNetworkPolicy;
