//! netpol 공통 크레이트
//!
//! 데이터플레인 크레이트와 이를 사용하는 컨트롤러가 공유하는
//! 에러 분류, 설정, 메트릭 이름, 로깅 초기화를 제공합니다.
//!
//! - [`error`]: 최상위 에러 (`NetpolError`)와 설정 에러
//! - [`config`]: `netpol.toml` 로딩 및 환경변수 오버라이드
//! - [`metrics`]: Prometheus 메트릭 이름 상수
//! - [`logging`]: `tracing-subscriber` 초기화

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, DataplaneFailure, NetpolError};

// 설정
pub use config::{DataplaneSection, GeneralConfig, NetpolConfig};
