//! 데이터플레인 설정
//!
//! [`DataPlaneConfig`]는 core의 [`DataplaneSection`](netpol_core::config::DataplaneSection)을
//! 기반으로 오케스트레이터가 사용하는 타입화된 설정을 제공합니다.
//!
//! # 사용 예시
//! ```ignore
//! use netpol_core::config::NetpolConfig;
//! use netpol_dataplane::config::DataPlaneConfig;
//!
//! let core_config = NetpolConfig::default();
//! let config = DataPlaneConfig::from_core(&core_config.dataplane)?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DataplaneError;
use crate::platform::PlatformKind;

/// 기본 논리 네트워크 이름
pub const DEFAULT_NETWORK_NAME: &str = "azure";

/// 설정 상한값 상수
const MAX_BACKEND_TIMEOUT_SECS: u64 = 300;
const MAX_IPSETS_LIMIT: usize = 1_000_000;

/// 데이터플레인 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// 이 프로세스가 실행 중인 노드 이름 (다른 노드의 파드는 무시)
    pub node_name: String,
    /// 정책을 적용할 논리 네트워크 이름
    pub network_name: String,
    /// 대상 플랫폼
    pub platform: PlatformKind,
    /// 백엔드 호출 타임아웃 (초)
    pub backend_timeout_secs: u64,
    /// 캐시할 수 있는 셋 최대 수 (해시 + 리스트)
    pub max_ipsets: usize,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            network_name: DEFAULT_NETWORK_NAME.to_owned(),
            platform: PlatformKind::host(),
            backend_timeout_secs: 30,
            max_ipsets: 50_000,
        }
    }
}

impl DataPlaneConfig {
    /// core의 `DataplaneSection`에서 설정을 생성합니다.
    ///
    /// # Errors
    ///
    /// 플랫폼 이름을 해석할 수 없거나 값이 범위를 벗어나면 `DataplaneError::Config`
    pub fn from_core(core: &netpol_core::config::DataplaneSection) -> Result<Self, DataplaneError> {
        let config = Self {
            node_name: core.node_name.clone(),
            network_name: core.network_name.clone(),
            platform: core.platform.parse()?,
            backend_timeout_secs: core.backend_timeout_secs,
            max_ipsets: core.max_ipsets,
        };
        config.validate()?;
        Ok(config)
    }

    /// 백엔드 호출 타임아웃
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), DataplaneError> {
        if self.backend_timeout_secs == 0 || self.backend_timeout_secs > MAX_BACKEND_TIMEOUT_SECS {
            return Err(DataplaneError::Config {
                field: "backend_timeout_secs".to_owned(),
                reason: format!("must be 1-{MAX_BACKEND_TIMEOUT_SECS}"),
            });
        }

        if self.max_ipsets == 0 || self.max_ipsets > MAX_IPSETS_LIMIT {
            return Err(DataplaneError::Config {
                field: "max_ipsets".to_owned(),
                reason: format!("must be 1-{MAX_IPSETS_LIMIT}"),
            });
        }

        if self.network_name.trim().is_empty() {
            return Err(DataplaneError::Config {
                field: "network_name".to_owned(),
                reason: "network_name must not be empty".to_owned(),
            });
        }

        Ok(())
    }
}

/// 데이터플레인 설정 빌더
#[derive(Default)]
pub struct DataPlaneConfigBuilder {
    config: DataPlaneConfig,
}

impl DataPlaneConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 노드 이름을 설정합니다.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    /// 논리 네트워크 이름을 설정합니다.
    pub fn network_name(mut self, name: impl Into<String>) -> Self {
        self.config.network_name = name.into();
        self
    }

    /// 대상 플랫폼을 설정합니다.
    pub fn platform(mut self, platform: PlatformKind) -> Self {
        self.config.platform = platform;
        self
    }

    /// 백엔드 호출 타임아웃(초)을 설정합니다.
    pub fn backend_timeout_secs(mut self, secs: u64) -> Self {
        self.config.backend_timeout_secs = secs;
        self
    }

    /// 셋 최대 수를 설정합니다.
    pub fn max_ipsets(mut self, max: usize) -> Self {
        self.config.max_ipsets = max;
        self
    }

    /// 설정을 검증하고 `DataPlaneConfig`를 생성합니다.
    pub fn build(self) -> Result<DataPlaneConfig, DataplaneError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
