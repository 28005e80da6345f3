//! 데이터플레인 에러 타입
//!
//! [`DataplaneError`]는 IPSet/정책 캐시와 오케스트레이터에서 발생하는 모든 에러를 표현합니다.
//! `From<DataplaneError> for NetpolError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.
//!
//! 소유자 불일치로 인한 stale 업데이트는 에러가 아닙니다. 해당 경로는 로그만 남기고
//! `Ok(())`를 반환합니다.

use std::fmt;

use netpol_core::error::{DataplaneFailure, NetpolError};

use crate::ipsets::{SetKind, SetType};

/// 정책 전이(AddPolicy/RemovePolicy/UpdatePolicy) 중 실패한 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyPhase {
    /// 셀렉터 셋 생성 및 참조 등록
    SelectorReferences,
    /// 규칙 셋 생성 및 참조 등록
    RuleReferences,
    /// 정책을 적용할 엔드포인트 계산
    EndpointResolution,
    /// 정책 매니저에 커밋 (백엔드 프로그래밍 포함)
    PolicyCommit,
    /// 정책 매니저에서 제거 (백엔드 프로그래밍 포함)
    PolicyRemoval,
    /// 규칙 셋 참조 해제
    RuleDereference,
    /// 셀렉터 셋 참조 해제
    SelectorDereference,
    /// 정책 갱신 (백엔드 프로그래밍 포함)
    PolicyUpdate,
}

impl fmt::Display for PolicyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelectorReferences => "selector ipset references",
            Self::RuleReferences => "rule ipset references",
            Self::EndpointResolution => "endpoint resolution",
            Self::PolicyCommit => "policy commit",
            Self::PolicyRemoval => "policy removal",
            Self::RuleDereference => "rule ipset dereference",
            Self::SelectorDereference => "selector ipset dereference",
            Self::PolicyUpdate => "policy update",
        };
        f.write_str(name)
    }
}

/// 데이터플레인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum DataplaneError {
    /// 셋 또는 리스트가 캐시에 없음
    #[error("ipset {name} does not exist")]
    SetNotFound {
        /// 셋 이름
        name: String,
    },

    /// 정책이 캐시에 없음
    #[error("policy {name} does not exist")]
    PolicyNotFound {
        /// 정책 이름
        name: String,
    },

    /// 해시셋 연산을 리스트에 (또는 그 반대로) 요청함
    #[error("ipset {name} is a {actual}, expected a {expected}")]
    WrongKind {
        /// 셋 이름
        name: String,
        /// 연산이 요구하는 종류
        expected: SetKind,
        /// 실제 종류
        actual: SetKind,
    },

    /// IPv4가 아닌 주소
    #[error("address {address:?} is not IPv4, only IPv4 is supported")]
    UnsupportedFamily {
        /// 요청된 주소 문자열
        address: String,
    },

    /// 리스트를 자기 자신에 추가하려 함
    #[error("list {name} cannot be added to itself")]
    SelfReference {
        /// 리스트 이름
        name: String,
    },

    /// 해시/리스트 어느 쪽에도 대응하지 않는 셋 타입
    #[error("ipset {name} has type {set_type} which maps to no set kind")]
    UnknownKind {
        /// 셋 이름
        name: String,
        /// 요청된 셋 타입
        set_type: SetType,
    },

    /// 외부 백엔드 호출 실패
    #[error("backend {operation} failed: {reason}")]
    Backend {
        /// 실패한 백엔드 연산
        operation: String,
        /// 실패 사유
        reason: String,
    },

    /// 외부 백엔드 호출 타임아웃
    #[error("backend {operation} timed out after {secs}s")]
    Timeout {
        /// 타임아웃된 백엔드 연산
        operation: String,
        /// 적용된 타임아웃 (초)
        secs: u64,
    },

    /// 설정 또는 용량 제한 위반
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 정책 전이의 특정 단계 실패
    #[error("error while {phase}: {source}")]
    Phase {
        /// 실패한 단계
        phase: PolicyPhase,
        /// 원인 에러
        #[source]
        source: Box<DataplaneError>,
    },
}

impl DataplaneError {
    /// 원인 에러에 정책 전이 단계를 붙입니다.
    pub fn in_phase(self, phase: PolicyPhase) -> Self {
        Self::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// `Phase` 래퍼를 모두 벗긴 원인 에러를 반환합니다.
    pub fn root_cause(&self) -> &DataplaneError {
        match self {
            Self::Phase { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// 실패한 단계를 반환합니다 (가장 바깥쪽 래퍼 기준).
    pub fn phase(&self) -> Option<PolicyPhase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// 셋/정책 부재로 인한 에러인지 확인합니다.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::SetNotFound { .. } | Self::PolicyNotFound { .. }
        )
    }
}

impl From<DataplaneError> for NetpolError {
    fn from(err: DataplaneError) -> Self {
        let failure = match err.root_cause() {
            DataplaneError::SetNotFound { .. } | DataplaneError::PolicyNotFound { .. } => {
                DataplaneFailure::NotFound(err.to_string())
            }
            DataplaneError::WrongKind { .. }
            | DataplaneError::UnsupportedFamily { .. }
            | DataplaneError::SelfReference { .. }
            | DataplaneError::UnknownKind { .. }
            | DataplaneError::Config { .. } => DataplaneFailure::InvalidRequest(err.to_string()),
            DataplaneError::Backend { .. } | DataplaneError::Timeout { .. } => {
                DataplaneFailure::Backend(err.to_string())
            }
            // root_cause() never returns a Phase
            DataplaneError::Phase { .. } => DataplaneFailure::Backend(err.to_string()),
        };
        NetpolError::Dataplane(failure)
    }
}
