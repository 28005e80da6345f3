//! 설정 관리: netpol.toml 파싱 및 런타임 설정
//!
//! [`NetpolConfig`]는 모든 모듈의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`NETPOL_DATAPLANE_NODE_NAME=node-1` 형식)
//! 2. 설정 파일 (`netpol.toml`)
//! 3. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), netpol_core::error::NetpolError> {
//! use netpol_core::config::NetpolConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = NetpolConfig::load("netpol.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = NetpolConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, NetpolError};

/// 데이터플레인 설정 상한값
const MAX_BACKEND_TIMEOUT_SECS: u64 = 300;
const MAX_IPSETS_LIMIT: usize = 1_000_000;

/// netpol 통합 설정
///
/// `netpol.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetpolConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 데이터플레인 설정
    #[serde(default)]
    pub dataplane: DataplaneSection,
}

impl NetpolConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, NetpolError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, NetpolError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetpolError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                NetpolError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, NetpolError> {
        toml::from_str(toml_str).map_err(|e| {
            NetpolError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `NETPOL_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "NETPOL_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "NETPOL_GENERAL_LOG_FORMAT");

        override_string(&mut self.dataplane.node_name, "NETPOL_DATAPLANE_NODE_NAME");
        override_string(
            &mut self.dataplane.network_name,
            "NETPOL_DATAPLANE_NETWORK_NAME",
        );
        override_string(&mut self.dataplane.platform, "NETPOL_DATAPLANE_PLATFORM");
        override_u64(
            &mut self.dataplane.backend_timeout_secs,
            "NETPOL_DATAPLANE_BACKEND_TIMEOUT_SECS",
        );
        override_usize(
            &mut self.dataplane.max_ipsets,
            "NETPOL_DATAPLANE_MAX_IPSETS",
        );
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), NetpolError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        let valid_platforms = ["linux", "windows"];
        if !valid_platforms.contains(&self.dataplane.platform.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "dataplane.platform".to_owned(),
                reason: format!("must be one of: {}", valid_platforms.join(", ")),
            }
            .into());
        }

        if self.dataplane.network_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "dataplane.network_name".to_owned(),
                reason: "network_name must not be empty".to_owned(),
            }
            .into());
        }

        if self.dataplane.backend_timeout_secs == 0
            || self.dataplane.backend_timeout_secs > MAX_BACKEND_TIMEOUT_SECS
        {
            return Err(ConfigError::InvalidValue {
                field: "dataplane.backend_timeout_secs".to_owned(),
                reason: format!("must be between 1 and {MAX_BACKEND_TIMEOUT_SECS}"),
            }
            .into());
        }

        if self.dataplane.max_ipsets == 0 || self.dataplane.max_ipsets > MAX_IPSETS_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "dataplane.max_ipsets".to_owned(),
                reason: format!("must be between 1 and {MAX_IPSETS_LIMIT}"),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 데이터플레인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneSection {
    /// 이 에이전트가 실행 중인 노드 이름 (다른 노드의 파드는 무시)
    pub node_name: String,
    /// 정책을 적용할 컨테이너 네트워크 이름
    pub network_name: String,
    /// 대상 플랫폼 (linux, windows)
    pub platform: String,
    /// 백엔드 호출 타임아웃 (초)
    pub backend_timeout_secs: u64,
    /// 캐시할 수 있는 IPSet 최대 수
    pub max_ipsets: usize,
}

impl Default for DataplaneSection {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            network_name: "azure".to_owned(),
            platform: default_platform().to_owned(),
            backend_timeout_secs: 30,
            max_ipsets: 50_000,
        }
    }
}

fn default_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = NetpolConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.dataplane.network_name, "azure");
        assert_eq!(config.dataplane.backend_timeout_secs, 30);
        assert!(config.dataplane.node_name.is_empty());
    }

    #[test]
    fn default_config_passes_validation() {
        let config = NetpolConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn default_platform_follows_build_target() {
        let config = NetpolConfig::default();
        if cfg!(target_os = "windows") {
            assert_eq!(config.dataplane.platform, "windows");
        } else {
            assert_eq!(config.dataplane.platform, "linux");
        }
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = NetpolConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.dataplane.network_name, "azure");
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[general]
log_level = "debug"

[dataplane]
node_name = "aks-node-0"
platform = "windows"
"#;
        let config = NetpolConfig::parse(toml).unwrap();
        assert_eq!(config.general.log_level, "debug");
        // log_format은 기본값 유지
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.dataplane.node_name, "aks-node-0");
        assert_eq!(config.dataplane.platform, "windows");
        assert_eq!(config.dataplane.max_ipsets, 50_000);
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let result = NetpolConfig::parse("invalid = [[[toml");
        assert!(matches!(
            result.unwrap_err(),
            NetpolError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = NetpolConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = NetpolConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_unknown_platform() {
        let mut config = NetpolConfig::default();
        config.dataplane.platform = "freebsd".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dataplane.platform"));
    }

    #[test]
    fn validate_rejects_empty_network_name() {
        let mut config = NetpolConfig::default();
        config.dataplane.network_name = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("network_name"));
    }

    #[test]
    fn validate_rejects_zero_backend_timeout() {
        let mut config = NetpolConfig::default();
        config.dataplane.backend_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_backend_timeout_above_limit() {
        let mut config = NetpolConfig::default();
        config.dataplane.backend_timeout_secs = 301;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backend_timeout_secs"));
    }

    #[test]
    fn validate_rejects_max_ipsets_out_of_range() {
        let mut config = NetpolConfig::default();
        config.dataplane.max_ipsets = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dataplane.max_ipsets"));

        config.dataplane.max_ipsets = 1_000_001;
        assert!(config.validate().is_err());

        config.dataplane.max_ipsets = 1_000_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: #[serial] 테스트이므로 다른 테스트와 환경변수를 동시에 조작하지 않습니다.
        unsafe { std::env::set_var("TEST_NETPOL_STR", "overridden") };
        override_string(&mut val, "TEST_NETPOL_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_NETPOL_STR") };
    }

    #[test]
    #[serial]
    fn env_override_u64_invalid_keeps_original() {
        let mut val = 30;
        // SAFETY: #[serial] 테스트이므로 다른 테스트와 환경변수를 동시에 조작하지 않습니다.
        unsafe { std::env::set_var("TEST_NETPOL_U64_BAD", "thirty") };
        override_u64(&mut val, "TEST_NETPOL_U64_BAD");
        assert_eq!(val, 30);
        unsafe { std::env::remove_var("TEST_NETPOL_U64_BAD") };
    }

    #[test]
    #[serial]
    fn apply_env_overrides_updates_dataplane_section() {
        let mut config = NetpolConfig::default();
        // SAFETY: #[serial] 테스트이므로 다른 테스트와 환경변수를 동시에 조작하지 않습니다.
        unsafe {
            std::env::set_var("NETPOL_DATAPLANE_NODE_NAME", "node-7");
            std::env::set_var("NETPOL_DATAPLANE_MAX_IPSETS", "1234");
        }
        config.apply_env_overrides();
        unsafe {
            std::env::remove_var("NETPOL_DATAPLANE_NODE_NAME");
            std::env::remove_var("NETPOL_DATAPLANE_MAX_IPSETS");
        }
        assert_eq!(config.dataplane.node_name, "node-7");
        assert_eq!(config.dataplane.max_ipsets, 1234);
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_NETPOL_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = NetpolConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = NetpolConfig::parse(&toml_str).unwrap();
        assert_eq!(config.dataplane.network_name, parsed.dataplane.network_name);
        assert_eq!(config.dataplane.platform, parsed.dataplane.platform);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let result = NetpolConfig::from_file("/nonexistent/path/netpol.toml").await;
        assert!(matches!(
            result.unwrap_err(),
            NetpolError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
