//! Dataplane backend abstraction.
//!
//! The [`DataplaneBackend`] trait is the narrow interface through which cached
//! state reaches the real network stack (ipset/iptables on Linux, HNS on Windows).
//! Production code plugs in a platform backend; [`NoopBackend`] accepts every call
//! and is used where programming is a no-op. Tests use `MockBackend`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │    DataPlane     │
//! └───┬──────────┬───┘
//!     │          │
//!     ▼          ▼
//! IpSetManager  PolicyManager
//!     │          │
//!     └────┬─────┘
//!          ▼
//!  ┌────────────────┐
//!  │DataplaneBackend│ (trait)
//!  └────────────────┘
//!       │      │
//!       ▼      ▼
//!    Noop    Mock
//! ```
//!
//! Every backend call made by the managers is bounded by the configured
//! backend timeout; an elapsed timeout surfaces as `DataplaneError::Timeout`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::endpoint::HostEndpoint;
use crate::error::DataplaneError;
use crate::ipsets::{IpSet, SetKind};
use crate::policies::NpmNetworkPolicy;

/// A single set change sent to the backend during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSetUpdate {
    /// Create the set or replace its members with the snapshot.
    Upsert(IpSet),
    /// Destroy the set.
    Delete {
        /// Set name
        name: String,
        /// Kind the set had when it was deleted
        kind: SetKind,
    },
}

impl IpSetUpdate {
    /// Name of the affected set.
    pub fn name(&self) -> &str {
        match self {
            Self::Upsert(set) => &set.name,
            Self::Delete { name, .. } => name,
        }
    }

    /// Kind of the affected set.
    pub fn kind(&self) -> SetKind {
        match self {
            Self::Upsert(set) => set.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }
}

/// Trait abstracting the external dataplane.
///
/// The trait is `Send + Sync + 'static`, allowing the backend to be shared
/// between the managers behind an `Arc`.
///
/// # Error Handling
///
/// Implementations report failures as `DataplaneError::Backend`. The caller treats
/// any error as fatal to the current operation and never updates its cache for it.
pub trait DataplaneBackend: Send + Sync + 'static {
    /// Prepares the host for programming (creates base chains, etc).
    fn initialize(&self) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Removes everything this process programmed.
    fn reset(&self) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Resolves the ID of the logical network called `network_name`.
    fn network_id(
        &self,
        network_name: &str,
    ) -> impl Future<Output = Result<String, DataplaneError>> + Send;

    /// Lists the endpoints attached to a network.
    fn list_endpoints(
        &self,
        network_id: &str,
    ) -> impl Future<Output = Result<Vec<HostEndpoint>, DataplaneError>> + Send;

    /// Programs one set change. Changes become effective on [`flush`](Self::flush).
    fn program_ipset(
        &self,
        update: &IpSetUpdate,
    ) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Commits programmed set changes for a network.
    fn flush(&self, network_id: &str) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Programs a new policy.
    fn program_policy(
        &self,
        policy: &NpmNetworkPolicy,
    ) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Replaces a programmed policy with a new version.
    fn update_programmed_policy(
        &self,
        policy: &NpmNetworkPolicy,
    ) -> impl Future<Output = Result<(), DataplaneError>> + Send;

    /// Removes a programmed policy.
    fn remove_programmed_policy(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), DataplaneError>> + Send;
}

/// Runs a backend call with a deadline.
pub(crate) async fn with_timeout<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, DataplaneError>>,
) -> Result<T, DataplaneError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(DataplaneError::Timeout {
            operation: operation.to_owned(),
            secs: timeout.as_secs(),
        }),
    }
}

/// Backend that accepts every call without touching the host.
///
/// Linux programming happens outside this crate today, so this is what a Linux
/// dataplane runs with. The network ID is the network name itself and no
/// endpoints are reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl DataplaneBackend for NoopBackend {
    async fn initialize(&self) -> Result<(), DataplaneError> {
        debug!("noop backend initialize");
        Ok(())
    }

    async fn reset(&self) -> Result<(), DataplaneError> {
        debug!("noop backend reset");
        Ok(())
    }

    async fn network_id(&self, network_name: &str) -> Result<String, DataplaneError> {
        Ok(network_name.to_owned())
    }

    async fn list_endpoints(&self, _network_id: &str) -> Result<Vec<HostEndpoint>, DataplaneError> {
        Ok(Vec::new())
    }

    async fn program_ipset(&self, update: &IpSetUpdate) -> Result<(), DataplaneError> {
        debug!(set = update.name(), kind = %update.kind(), "noop backend program ipset");
        Ok(())
    }

    async fn flush(&self, network_id: &str) -> Result<(), DataplaneError> {
        debug!(network_id, "noop backend flush");
        Ok(())
    }

    async fn program_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), DataplaneError> {
        debug!(policy = %policy.name, "noop backend program policy");
        Ok(())
    }

    async fn update_programmed_policy(
        &self,
        policy: &NpmNetworkPolicy,
    ) -> Result<(), DataplaneError> {
        debug!(policy = %policy.name, "noop backend update policy");
        Ok(())
    }

    async fn remove_programmed_policy(&self, name: &str) -> Result<(), DataplaneError> {
        debug!(policy = name, "noop backend remove policy");
        Ok(())
    }
}

/// 테스트용 백엔드 호출 기록
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Initialize,
    Reset,
    NetworkId(String),
    ListEndpoints(String),
    ProgramIpSet(IpSetUpdate),
    Flush(String),
    ProgramPolicy(String),
    UpdatePolicy(String),
    RemovePolicy(String),
}

/// 테스트용 Mock 백엔드
///
/// 모든 호출을 기록하고, 연산 이름 단위로 실패나 지연을 시뮬레이션합니다.
/// 연산 이름은 trait 메서드 이름과 같습니다 (`"flush"`, `"program_policy"` 등).
#[cfg(test)]
#[derive(Default)]
pub struct MockBackend {
    calls: parking_lot::Mutex<Vec<BackendCall>>,
    failing: parking_lot::Mutex<std::collections::HashSet<&'static str>>,
    endpoints: parking_lot::Mutex<Vec<HostEndpoint>>,
    delay: Option<Duration>,
}

#[cfg(test)]
impl MockBackend {
    /// 항상 성공하는 mock 백엔드를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// list_endpoints가 반환할 엔드포인트를 지정합니다.
    pub fn with_endpoints(self, endpoints: Vec<HostEndpoint>) -> Self {
        *self.endpoints.lock() = endpoints;
        self
    }

    /// 주어진 연산이 실패하도록 설정합니다.
    pub fn with_failing(self, operation: &'static str) -> Self {
        self.failing.lock().insert(operation);
        self
    }

    /// 모든 호출을 지연시킵니다 (타임아웃 테스트용).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 실행 중에 연산 실패 여부를 바꿉니다.
    pub fn set_failing(&self, operation: &'static str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(operation);
        } else {
            set.remove(operation);
        }
    }

    /// 실행 중에 엔드포인트 목록을 바꿉니다.
    pub fn set_endpoints(&self, endpoints: Vec<HostEndpoint>) {
        *self.endpoints.lock() = endpoints;
    }

    /// 기록된 호출 목록
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// 기록된 호출을 비웁니다.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// 기록된 set 업데이트 목록
    pub fn ipset_updates(&self) -> Vec<IpSetUpdate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                BackendCall::ProgramIpSet(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    async fn record(
        &self,
        operation: &'static str,
        call: BackendCall,
    ) -> Result<(), DataplaneError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(call);
        if self.failing.lock().contains(operation) {
            return Err(DataplaneError::Backend {
                operation: operation.to_owned(),
                reason: "mock failure".to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
impl DataplaneBackend for MockBackend {
    async fn initialize(&self) -> Result<(), DataplaneError> {
        self.record("initialize", BackendCall::Initialize).await
    }

    async fn reset(&self) -> Result<(), DataplaneError> {
        self.record("reset", BackendCall::Reset).await
    }

    async fn network_id(&self, network_name: &str) -> Result<String, DataplaneError> {
        self.record("network_id", BackendCall::NetworkId(network_name.to_owned()))
            .await?;
        Ok(format!("{network_name}-id"))
    }

    async fn list_endpoints(&self, network_id: &str) -> Result<Vec<HostEndpoint>, DataplaneError> {
        self.record(
            "list_endpoints",
            BackendCall::ListEndpoints(network_id.to_owned()),
        )
        .await?;
        Ok(self.endpoints.lock().clone())
    }

    async fn program_ipset(&self, update: &IpSetUpdate) -> Result<(), DataplaneError> {
        self.record("program_ipset", BackendCall::ProgramIpSet(update.clone()))
            .await
    }

    async fn flush(&self, network_id: &str) -> Result<(), DataplaneError> {
        self.record("flush", BackendCall::Flush(network_id.to_owned()))
            .await
    }

    async fn program_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), DataplaneError> {
        self.record(
            "program_policy",
            BackendCall::ProgramPolicy(policy.name.clone()),
        )
        .await
    }

    async fn update_programmed_policy(
        &self,
        policy: &NpmNetworkPolicy,
    ) -> Result<(), DataplaneError> {
        self.record(
            "update_programmed_policy",
            BackendCall::UpdatePolicy(policy.name.clone()),
        )
        .await
    }

    async fn remove_programmed_policy(&self, name: &str) -> Result<(), DataplaneError> {
        self.record(
            "remove_programmed_policy",
            BackendCall::RemovePolicy(name.to_owned()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_calls_in_order() {
        let backend = MockBackend::new();
        backend.initialize().await.unwrap();
        backend.flush("azure-id").await.unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::Initialize,
                BackendCall::Flush("azure-id".to_owned())
            ]
        );
    }

    #[tokio::test]
    async fn mock_fails_configured_operation() {
        let backend = MockBackend::new().with_failing("flush");
        let err = backend.flush("azure-id").await.unwrap_err();
        assert!(matches!(err, DataplaneError::Backend { .. }));
        // 실패한 호출도 기록됨
        assert_eq!(backend.calls().len(), 1);

        backend.set_failing("flush", false);
        backend.flush("azure-id").await.unwrap();
    }

    #[tokio::test]
    async fn mock_network_id_is_derived_from_name() {
        let backend = MockBackend::new();
        assert_eq!(backend.network_id("azure").await.unwrap(), "azure-id");
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed_to_timeout_error() {
        let backend = MockBackend::new().with_delay(Duration::from_secs(60));
        let err = with_timeout("flush", Duration::from_secs(5), backend.flush("x"))
            .await
            .unwrap_err();
        match err {
            DataplaneError::Timeout { operation, secs } => {
                assert_eq!(operation, "flush");
                assert_eq!(secs, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn with_timeout_passes_result_through() {
        let backend = MockBackend::new();
        let id = with_timeout("network_id", Duration::from_secs(5), backend.network_id("azure"))
            .await
            .unwrap();
        assert_eq!(id, "azure-id");
    }

    #[tokio::test]
    async fn noop_backend_accepts_everything() {
        let backend = NoopBackend;
        backend.initialize().await.unwrap();
        assert_eq!(backend.network_id("azure").await.unwrap(), "azure");
        assert!(backend.list_endpoints("azure").await.unwrap().is_empty());
        backend
            .program_policy(&NpmNetworkPolicy::new("p"))
            .await
            .unwrap();
        backend.remove_programmed_policy("p").await.unwrap();
    }

    #[test]
    fn update_reports_name_and_kind() {
        let update = IpSetUpdate::Delete {
            name: "nslabel-team".to_owned(),
            kind: SetKind::ListSet,
        };
        assert_eq!(update.name(), "nslabel-team");
        assert_eq!(update.kind(), SetKind::ListSet);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn backends_are_send_sync() {
        assert_send_sync::<NoopBackend>();
        assert_send_sync::<MockBackend>();
    }
}
