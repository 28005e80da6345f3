//! IPSet 캐시와 매니저
//!
//! - [`types`]: 셋 타입, 멤버 데이터, 정책 쪽 셋 기술
//! - [`manager`]: 해시/리스트 캐시를 소유하는 [`IpSetManager`]

pub mod manager;
pub mod types;

pub use manager::IpSetManager;
pub use types::{IpSet, IpSetSpec, MemberRef, ReferenceType, SetKind, SetMembers, SetType};
