//! 에러 타입: 도메인별 에러 정의

/// netpol 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum NetpolError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 데이터플레인 처리 에러
    #[error("dataplane error: {0}")]
    Dataplane(#[from] DataplaneFailure),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 데이터플레인 처리 에러 (상위 레이어용 요약 분류)
///
/// 세부 분류는 `netpol-dataplane`의 `DataplaneError`가 가지고 있으며,
/// 이 타입은 컨트롤러 레이어가 재시도 여부를 판단할 수 있을 정도로만 구분합니다.
#[derive(Debug, thiserror::Error)]
pub enum DataplaneFailure {
    /// 셋 또는 정책을 찾을 수 없음
    #[error("not found: {0}")]
    NotFound(String),

    /// 요청이 캐시 상태와 맞지 않음 (잘못된 종류, 자기 참조 등)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 외부 백엔드 호출 실패 (재시도 대상)
    #[error("backend failure: {0}")]
    Backend(String),
}
