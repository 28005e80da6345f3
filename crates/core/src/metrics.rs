//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 데이터플레인 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `netpol_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! 레코더가 설치되지 않은 상태에서는 모든 기록이 no-op이며,
//! 기록 실패가 호출자에게 전파되는 일은 없습니다.
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::gauge;
//!
//! gauge!(netpol_core::metrics::IPSET_ENTRIES).increment(1.0);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 셋 이름 레이블 키
pub const LABEL_SET_NAME: &str = "set_name";

/// 셋 종류 레이블 키 (hash, list)
pub const LABEL_KIND: &str = "kind";

/// 정책 연산 레이블 키 (add, update, remove)
pub const LABEL_OPERATION: &str = "operation";

/// 결과 레이블 키 (success, failure)
pub const LABEL_RESULT: &str = "result";

// ─── IPSet 메트릭 ───────────────────────────────────────────────────

/// IPSet: 전체 엔트리 수 (gauge, 해시셋 IP + 리스트 멤버십)
pub const IPSET_ENTRIES: &str = "netpol_ipset_entries";

/// IPSet: 셋별 멤버 수 (gauge, label: set_name)
pub const IPSET_INVENTORY: &str = "netpol_ipset_inventory";

/// IPSet: 캐시된 셋 수 (gauge, label: kind)
pub const IPSETS: &str = "netpol_ipsets";

// ─── Policy 메트릭 ──────────────────────────────────────────────────

/// Policy: 캐시된 정책 수 (gauge)
pub const POLICIES: &str = "netpol_policies";

/// Policy: 정책 연산 수 (counter, labels: operation, result)
pub const POLICY_OPERATIONS_TOTAL: &str = "netpol_policy_operations_total";

// ─── DataPlane 메트릭 ───────────────────────────────────────────────

/// DataPlane: apply 호출 수 (counter)
pub const APPLY_DATAPLANE_TOTAL: &str = "netpol_apply_dataplane_total";

/// DataPlane: apply 실패 수 (counter)
pub const APPLY_DATAPLANE_FAILURES_TOTAL: &str = "netpol_apply_dataplane_failures_total";

/// DataPlane: apply 소요 시간 (histogram, 초)
pub const APPLY_DATAPLANE_DURATION_SECONDS: &str = "netpol_apply_dataplane_duration_seconds";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// apply 소요 시간 히스토그램 버킷 (초)
///
/// 1ms ~ 30s 범위 (백엔드 호출 포함)
pub const APPLY_DURATION_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_gauge!(
        IPSET_ENTRIES,
        "Total number of ipset entries (IP members and list memberships)"
    );
    describe_gauge!(IPSET_INVENTORY, "Number of members per ipset");
    describe_gauge!(IPSETS, "Number of cached ipsets by kind");

    describe_gauge!(POLICIES, "Number of network policies currently cached");
    describe_counter!(
        POLICY_OPERATIONS_TOTAL,
        "Total number of policy add/update/remove operations"
    );

    describe_counter!(
        APPLY_DATAPLANE_TOTAL,
        "Total number of dataplane flushes that programmed pending changes"
    );
    describe_counter!(
        APPLY_DATAPLANE_FAILURES_TOTAL,
        "Total number of failed dataplane flushes"
    );
    describe_histogram!(
        APPLY_DATAPLANE_DURATION_SECONDS,
        "Time to program pending ipset changes into the dataplane in seconds"
    );
}
