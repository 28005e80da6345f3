//! 플랫폼 능력 인터페이스
//!
//! 중첩 리스트 허용 여부와 엔드포인트 관리 여부는 대상 플랫폼에 따라 다릅니다.
//! 오케스트레이터는 [`Platform`] trait에만 의존합니다.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DataplaneError;

/// 플랫폼별 능력
pub trait Platform: Send + Sync {
    /// 플랫폼 이름
    fn name(&self) -> &'static str;

    /// 리스트셋이 다른 리스트셋을 멤버로 가질 수 있는지 여부
    fn supports_nested_lists(&self) -> bool;

    /// 정책을 파드 엔드포인트 단위로 적용하는지 여부
    fn manages_endpoints(&self) -> bool;
}

/// Linux: iptables가 셋을 직접 매칭하므로 엔드포인트를 다루지 않습니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn supports_nested_lists(&self) -> bool {
        false
    }

    fn manages_endpoints(&self) -> bool {
        false
    }
}

/// Windows: 정책이 HNS 엔드포인트에 붙고, 중첩 셋을 지원합니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn supports_nested_lists(&self) -> bool {
        true
    }

    fn manages_endpoints(&self) -> bool {
        true
    }
}

/// 설정에서 선택하는 플랫폼 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Linux (iptables + ipset)
    Linux,
    /// Windows (HNS)
    Windows,
}

impl PlatformKind {
    /// 빌드 대상 OS에 맞는 기본값
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    /// 플랫폼 구현을 생성합니다.
    pub fn build(self) -> Arc<dyn Platform> {
        match self {
            Self::Linux => Arc::new(LinuxPlatform),
            Self::Windows => Arc::new(WindowsPlatform),
        }
    }
}

impl Default for PlatformKind {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
        }
    }
}

impl FromStr for PlatformKind {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(DataplaneError::Config {
                field: "platform".to_owned(),
                reason: format!("unknown platform '{other}', expected 'linux' or 'windows'"),
            }),
        }
    }
}
