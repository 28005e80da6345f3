//! 정책 매니저
//!
//! 백엔드 프로그래밍이 성공한 뒤에만 캐시를 갱신하므로, 캐시는 프로그래밍되지 않은
//! 상태를 절대 반영하지 않습니다. 백엔드 호출 동안에는 캐시 락을 잡지 않습니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use netpol_core::metrics as m;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::backend::{DataplaneBackend, with_timeout};
use crate::error::DataplaneError;

use super::types::NpmNetworkPolicy;

/// 정책 캐시를 소유하는 매니저
pub struct PolicyManager<B: DataplaneBackend> {
    backend: Arc<B>,
    cache: Mutex<HashMap<String, NpmNetworkPolicy>>,
    backend_timeout: Duration,
}

impl<B: DataplaneBackend> PolicyManager<B> {
    /// 빈 캐시로 매니저를 생성합니다.
    pub fn new(backend: Arc<B>, backend_timeout: Duration) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            backend_timeout,
        }
    }

    /// 정책이 캐시에 있는지 확인합니다.
    pub fn policy_exists(&self, name: &str) -> bool {
        self.cache.lock().contains_key(name)
    }

    /// 캐시된 정책의 사본을 반환합니다.
    pub fn get_policy(&self, name: &str) -> Option<NpmNetworkPolicy> {
        self.cache.lock().get(name).cloned()
    }

    /// 캐시된 정책 수
    pub fn policy_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// 캐시된 모든 정책의 스냅샷
    pub fn policies(&self) -> Vec<NpmNetworkPolicy> {
        self.cache.lock().values().cloned().collect()
    }

    /// 정책을 프로그래밍한 뒤 캐시에 저장합니다.
    pub async fn add_policy(&self, policy: NpmNetworkPolicy) -> Result<(), DataplaneError> {
        let result = with_timeout(
            "program_policy",
            self.backend_timeout,
            self.backend.program_policy(&policy),
        )
        .await;
        record_operation("add", &result);
        if let Err(err) = result {
            error!(policy = %policy.name, error = %err, "failed to program policy");
            return Err(err);
        }

        debug!(policy = %policy.name, endpoints = policy.pod_endpoints.len(), "policy added");
        self.commit(policy);
        Ok(())
    }

    /// 프로그래밍된 정책을 새 버전으로 바꾸고 캐시된 객체를 교체합니다.
    ///
    /// # Errors
    ///
    /// 캐시에 없는 정책이면 `PolicyNotFound`
    pub async fn update_policy(&self, policy: NpmNetworkPolicy) -> Result<(), DataplaneError> {
        if !self.policy_exists(&policy.name) {
            return Err(DataplaneError::PolicyNotFound {
                name: policy.name.clone(),
            });
        }

        let result = with_timeout(
            "update_programmed_policy",
            self.backend_timeout,
            self.backend.update_programmed_policy(&policy),
        )
        .await;
        record_operation("update", &result);
        if let Err(err) = result {
            error!(policy = %policy.name, error = %err, "failed to update programmed policy");
            return Err(err);
        }

        debug!(policy = %policy.name, "policy updated");
        self.commit(policy);
        Ok(())
    }

    /// 프로그래밍된 정책을 제거한 뒤 캐시에서 내보냅니다.
    ///
    /// # Errors
    ///
    /// 캐시에 없는 정책이면 `PolicyNotFound`
    pub async fn remove_policy(&self, name: &str) -> Result<(), DataplaneError> {
        if !self.policy_exists(name) {
            return Err(DataplaneError::PolicyNotFound {
                name: name.to_owned(),
            });
        }

        let result = with_timeout(
            "remove_programmed_policy",
            self.backend_timeout,
            self.backend.remove_programmed_policy(name),
        )
        .await;
        record_operation("remove", &result);
        if let Err(err) = result {
            error!(policy = name, error = %err, "failed to remove programmed policy");
            return Err(err);
        }

        let count = {
            let mut cache = self.cache.lock();
            cache.remove(name);
            cache.len()
        };
        metrics::gauge!(m::POLICIES).set(count as f64);
        debug!(policy = name, "policy removed");
        Ok(())
    }

    /// 캐시를 비웁니다. 백엔드는 호출하지 않습니다.
    pub fn clear(&self) {
        self.cache.lock().clear();
        metrics::gauge!(m::POLICIES).set(0.0);
    }

    fn commit(&self, policy: NpmNetworkPolicy) {
        let count = {
            let mut cache = self.cache.lock();
            cache.insert(policy.name.clone(), policy);
            cache.len()
        };
        metrics::gauge!(m::POLICIES).set(count as f64);
    }
}

fn record_operation(operation: &'static str, result: &Result<(), DataplaneError>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::counter!(
        m::POLICY_OPERATIONS_TOTAL,
        m::LABEL_OPERATION => operation,
        m::LABEL_RESULT => outcome
    )
    .increment(1);
}
