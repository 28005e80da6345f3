//! 데이터플레인 오케스트레이터 -- 정책과 IPSet 참조 관리, 엔드포인트 계산, 일괄 반영
//!
//! [`DataPlane`]은 [`IpSetManager`]와 [`PolicyManager`]를 조합하여 컨트롤러 계층에
//! 하나의 API를 제공합니다. 멤버십 변경은 캐시에만 쌓이고 [`DataPlane::apply_data_plane`]
//! 한 번으로 백엔드에 반영됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! controller ──> DataPlane
//!                   |
//!        ┌──────────┼─────────────┐
//!        v          v             v
//!  IpSetManager  PolicyManager  endpoint cache
//!        |          |
//!        └────┬─────┘
//!             v
//!      DataplaneBackend
//! ```
//!
//! # 정책 전이
//!
//! - AddPolicy: 셀렉터 셋 참조 → 규칙 셋 참조 → 리스트 멤버 반영 → 엔드포인트 계산 → 커밋
//! - RemovePolicy: 캐시된 정책 조회 → 정책 제거 → 규칙 셋 해제 → 셀렉터 셋 해제
//! - UpdatePolicy: 새 참조 등록 → 갱신 → 더 이상 쓰지 않는 참조 해제
//!
//! 전이 중 실패한 단계는 [`PolicyPhase`]로 감싸서 반환하며, 이미 등록된 참조는
//! 되돌리지 않습니다. 같은 호출을 재시도하면 수렴합니다.
//!
//! 같은 이름의 정책에 대한 전이(`add_policy`, `update_policy`, `remove_policy`와
//! `update_pod`의 정책 갱신)는 이름별 비동기 락으로 직렬화됩니다. 이름이 다른 정책은
//! 서로 막지 않습니다.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use netpol_core::metrics as m;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::backend::{DataplaneBackend, with_timeout};
use crate::config::DataPlaneConfig;
use crate::endpoint::{HostEndpoint, NpmEndpoint, NpmPod};
use crate::error::{DataplaneError, PolicyPhase};
use crate::ipsets::{IpSet, IpSetManager, IpSetSpec, ReferenceType, SetType};
use crate::platform::Platform;
use crate::policies::{NpmNetworkPolicy, PolicyManager};

/// 데이터플레인 오케스트레이터
///
/// 여러 컨트롤러 워커가 동시에 호출해도 안전합니다. 캐시 락은 메모리 변경 동안에만
/// 잡히고 백엔드 호출 중에는 풀려 있습니다. `apply_data_plane`은 비동기 가드로
/// 직렬화되어, 오래된 스냅샷이 새 스냅샷보다 늦게 반영되지 않습니다.
///
/// # 사용 예시
/// ```ignore
/// let dp = DataPlane::new(config, Arc::new(NoopBackend))?;
/// dp.initialize_data_plane().await?;
///
/// dp.add_to_set(&["ns-default"], "10.0.0.4", "default/web-0")?;
/// dp.add_policy(policy).await?;
/// dp.apply_data_plane().await?;
/// ```
pub struct DataPlane<B: DataplaneBackend> {
    config: DataPlaneConfig,
    backend: Arc<B>,
    platform: Arc<dyn Platform>,
    ipset_manager: IpSetManager<B>,
    policy_manager: PolicyManager<B>,
    /// 파드 키 → 엔드포인트
    endpoint_cache: Mutex<HashMap<String, NpmEndpoint>>,
    network_id: RwLock<String>,
    apply_guard: tokio::sync::Mutex<()>,
    /// 정책 이름 → 전이 락
    transitions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    applies: AtomicU64,
    apply_failures: AtomicU64,
}

impl<B: DataplaneBackend> DataPlane<B> {
    /// 설정의 플랫폼으로 오케스트레이터를 생성합니다.
    ///
    /// # Errors
    ///
    /// 설정 검증에 실패하면 `Config`
    pub fn new(config: DataPlaneConfig, backend: Arc<B>) -> Result<Self, DataplaneError> {
        let platform = config.platform.build();
        Self::with_platform(config, backend, platform)
    }

    /// 플랫폼 구현을 직접 지정하여 오케스트레이터를 생성합니다.
    ///
    /// # Errors
    ///
    /// 설정 검증에 실패하면 `Config`
    pub fn with_platform(
        config: DataPlaneConfig,
        backend: Arc<B>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, DataplaneError> {
        config.validate()?;

        let ipset_manager = IpSetManager::new(Arc::clone(&backend), platform.as_ref(), &config);
        let policy_manager = PolicyManager::new(Arc::clone(&backend), config.backend_timeout());
        let network_id = RwLock::new(config.network_name.clone());

        info!(
            node = %config.node_name,
            network = %config.network_name,
            platform = platform.name(),
            "dataplane created"
        );

        Ok(Self {
            config,
            backend,
            platform,
            ipset_manager,
            policy_manager,
            endpoint_cache: Mutex::new(HashMap::new()),
            network_id,
            apply_guard: tokio::sync::Mutex::new(()),
            transitions: Mutex::new(HashMap::new()),
            applies: AtomicU64::new(0),
            apply_failures: AtomicU64::new(0),
        })
    }

    // --- lifecycle ---

    /// 백엔드를 초기화하고 네트워크 ID를 확인합니다.
    ///
    /// 엔드포인트를 관리하는 플랫폼에서는 엔드포인트 캐시도 백엔드 기준으로 갱신합니다.
    pub async fn initialize_data_plane(&self) -> Result<(), DataplaneError> {
        let timeout = self.config.backend_timeout();
        with_timeout("initialize", timeout, self.backend.initialize()).await?;

        let network_id = with_timeout(
            "network_id",
            timeout,
            self.backend.network_id(&self.config.network_name),
        )
        .await?;
        *self.network_id.write() = network_id.clone();

        if self.platform.manages_endpoints() {
            self.refresh_pod_endpoints(&network_id).await?;
        }

        info!(
            network = %self.config.network_name,
            network_id = %network_id,
            platform = self.platform.name(),
            "dataplane initialized"
        );
        Ok(())
    }

    /// 백엔드에 프로그래밍된 상태를 지우고 모든 캐시를 비웁니다.
    pub async fn reset_data_plane(&self) -> Result<(), DataplaneError> {
        // 진행 중인 반영이 끝난 뒤에 비움
        let _guard = self.apply_guard.lock().await;

        with_timeout("reset", self.config.backend_timeout(), self.backend.reset()).await?;

        self.ipset_manager.clear();
        self.policy_manager.clear();
        self.endpoint_cache.lock().clear();
        self.transitions
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        info!("dataplane reset");
        Ok(())
    }

    /// 지난 반영 이후 쌓인 셋 변경을 백엔드에 한 번에 반영합니다.
    ///
    /// 변경이 없으면 백엔드를 호출하지 않습니다. 동시에 호출되면 차례로 실행됩니다.
    pub async fn apply_data_plane(&self) -> Result<(), DataplaneError> {
        let _guard = self.apply_guard.lock().await;
        let network_id = self.network_id();

        let started = Instant::now();
        let result = self.ipset_manager.apply_ip_sets(&network_id).await;
        metrics::counter!(m::APPLY_DATAPLANE_TOTAL).increment(1);

        match result {
            Ok(applied) => {
                self.applies.fetch_add(1, Ordering::Relaxed);
                if applied > 0 {
                    metrics::histogram!(m::APPLY_DATAPLANE_DURATION_SECONDS)
                        .record(started.elapsed().as_secs_f64());
                }
                debug!(network_id = %network_id, applied, "apply dataplane finished");
                Ok(())
            }
            Err(err) => {
                self.apply_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::APPLY_DATAPLANE_FAILURES_TOTAL).increment(1);
                error!(network_id = %network_id, error = %err, "failed to apply dataplane");
                Err(err)
            }
        }
    }

    // --- policies ---

    /// 정책을 추가합니다. 같은 이름의 정책이 이미 있으면 갱신으로 처리합니다.
    ///
    /// # Errors
    ///
    /// 실패한 단계를 담은 `Phase` 에러. 앞 단계에서 등록된 참조는 남아 있으며,
    /// 같은 호출을 재시도하면 수렴합니다.
    pub async fn add_policy(&self, policy: NpmNetworkPolicy) -> Result<(), DataplaneError> {
        let _transition = self.lock_policy(&policy.name).await;
        self.add_policy_locked(policy).await
    }

    async fn add_policy_locked(&self, mut policy: NpmNetworkPolicy) -> Result<(), DataplaneError> {
        if self.policy_manager.policy_exists(&policy.name) {
            debug!(policy = %policy.name, "policy already exists, updating instead");
            return self.update_policy_locked(policy).await;
        }

        self.add_ip_set_references(
            &policy.pod_selector_ip_sets,
            &policy.name,
            ReferenceType::Selector,
        )
        .map_err(|e| e.in_phase(PolicyPhase::SelectorReferences))?;
        self.add_ip_set_references(
            &policy.rule_ip_sets,
            &policy.name,
            ReferenceType::NetworkPolicyRule,
        )
        .map_err(|e| e.in_phase(PolicyPhase::RuleReferences))?;

        policy.pod_endpoints = self
            .resolve_endpoints(&policy)
            .map_err(|e| e.in_phase(PolicyPhase::EndpointResolution))?;

        let name = policy.name.clone();
        let endpoints: Vec<String> = policy.pod_endpoints.keys().cloned().collect();
        self.policy_manager
            .add_policy(policy)
            .await
            .map_err(|e| e.in_phase(PolicyPhase::PolicyCommit))?;
        self.attach_endpoints(&name, endpoints.iter().map(String::as_str));

        info!(policy = %name, endpoints = endpoints.len(), "policy added");
        Ok(())
    }

    /// 정책을 제거하고 참조하던 셋을 해제합니다.
    ///
    /// 캐시에 없는 정책이면 아무것도 하지 않고 `Ok(())`를 반환합니다.
    pub async fn remove_policy(&self, name: &str) -> Result<(), DataplaneError> {
        let transition = self.lock_policy(name).await;
        let result = self.remove_policy_locked(name).await;
        drop(transition);
        self.release_policy_lock(name);
        result
    }

    async fn remove_policy_locked(&self, name: &str) -> Result<(), DataplaneError> {
        // 해제 대상은 캐시된 객체가 기준
        let Some(policy) = self.policy_manager.get_policy(name) else {
            info!(policy = name, "policy not found, may have been removed already");
            return Ok(());
        };

        match self.policy_manager.remove_policy(name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(policy = name, "policy removed concurrently");
            }
            Err(err) => return Err(err.in_phase(PolicyPhase::PolicyRemoval)),
        }
        self.detach_endpoints(name, policy.pod_endpoints.keys().map(String::as_str));

        self.delete_ip_set_references(
            policy.rule_ip_sets.iter(),
            name,
            ReferenceType::NetworkPolicyRule,
        )
        .map_err(|e| e.in_phase(PolicyPhase::RuleDereference))?;
        self.delete_ip_set_references(
            policy.pod_selector_ip_sets.iter(),
            name,
            ReferenceType::Selector,
        )
        .map_err(|e| e.in_phase(PolicyPhase::SelectorDereference))?;

        info!(policy = name, "policy removed");
        Ok(())
    }

    /// 정책을 새 버전으로 교체합니다.
    ///
    /// 새 버전이 가리키는 셋은 백엔드 갱신 전에 생성/참조 등록되고, 새 버전이 더 이상
    /// 가리키지 않는 셋의 참조는 갱신 후에 해제됩니다. 참조가 모두 사라진 셋은 삭제됩니다.
    ///
    /// # Errors
    ///
    /// - 캐시에 없는 정책이면 `PolicyUpdate` 단계의 `PolicyNotFound`
    /// - 그 밖에는 실패한 단계를 담은 `Phase` 에러
    pub async fn update_policy(&self, policy: NpmNetworkPolicy) -> Result<(), DataplaneError> {
        let _transition = self.lock_policy(&policy.name).await;
        self.update_policy_locked(policy).await
    }

    async fn update_policy_locked(
        &self,
        mut policy: NpmNetworkPolicy,
    ) -> Result<(), DataplaneError> {
        let Some(old) = self.policy_manager.get_policy(&policy.name) else {
            return Err(DataplaneError::PolicyNotFound {
                name: policy.name.clone(),
            }
            .in_phase(PolicyPhase::PolicyUpdate));
        };

        self.add_ip_set_references(
            &policy.pod_selector_ip_sets,
            &policy.name,
            ReferenceType::Selector,
        )
        .map_err(|e| e.in_phase(PolicyPhase::SelectorReferences))?;
        self.add_ip_set_references(
            &policy.rule_ip_sets,
            &policy.name,
            ReferenceType::NetworkPolicyRule,
        )
        .map_err(|e| e.in_phase(PolicyPhase::RuleReferences))?;

        policy.pod_endpoints = self
            .resolve_endpoints(&policy)
            .map_err(|e| e.in_phase(PolicyPhase::EndpointResolution))?;

        let new = policy.clone();
        self.policy_manager
            .update_policy(policy)
            .await
            .map_err(|e| e.in_phase(PolicyPhase::PolicyUpdate))?;

        let dropped = old
            .pod_endpoints
            .keys()
            .filter(|key| !new.pod_endpoints.contains_key(*key))
            .map(String::as_str);
        self.detach_endpoints(&new.name, dropped);
        self.attach_endpoints(&new.name, new.pod_endpoints.keys().map(String::as_str));

        self.prune_list_members(&old, &new)
            .map_err(|e| e.in_phase(PolicyPhase::PolicyUpdate))?;

        let rule_names = new.rule_set_names();
        self.delete_ip_set_references(
            old.rule_ip_sets
                .iter()
                .filter(|s| !rule_names.contains(s.name.as_str())),
            &new.name,
            ReferenceType::NetworkPolicyRule,
        )
        .map_err(|e| e.in_phase(PolicyPhase::RuleDereference))?;

        let selector_names = new.selector_set_names();
        self.delete_ip_set_references(
            old.pod_selector_ip_sets
                .iter()
                .filter(|s| !selector_names.contains(s.name.as_str())),
            &new.name,
            ReferenceType::Selector,
        )
        .map_err(|e| e.in_phase(PolicyPhase::SelectorDereference))?;

        info!(policy = %new.name, endpoints = new.pod_endpoints.len(), "policy updated");
        Ok(())
    }

    /// 정책 이름의 전이 락을 잡습니다. 맵 락은 대기 전에 풀립니다.
    async fn lock_policy(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.transitions.lock().entry(name.to_owned()).or_default());
        lock.lock_owned().await
    }

    /// 아무도 기다리지 않는 전이 락을 맵에서 내보냅니다.
    fn release_policy_lock(&self, name: &str) {
        let mut transitions = self.transitions.lock();
        if transitions
            .get(name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            transitions.remove(name);
        }
    }

    // --- pods / endpoints ---

    /// 파드 변경을 엔드포인트 캐시와 정책에 반영합니다.
    ///
    /// 엔드포인트를 관리하지 않는 플랫폼이거나 다른 노드의 파드면 아무것도 하지 않습니다.
    /// 엔드포인트가 캐시에 없거나 IP가 바뀌었으면 백엔드에서 다시 찾아 엔트리를 교체합니다.
    /// 그 다음 캐시된 정책마다 셀렉터가 파드 IP를 고르는지 다시 계산하여, 고르면 이
    /// 엔드포인트에 적용하고 더 이상 고르지 않거나 엔드포인트가 사라졌으면 떼어냅니다.
    pub async fn update_pod(&self, pod: &NpmPod) -> Result<(), DataplaneError> {
        if !self.platform.manages_endpoints() {
            return Ok(());
        }
        if pod.node_name != self.config.node_name {
            debug!(pod = %pod.pod_key(), node = %pod.node_name, "ignoring pod on another node");
            return Ok(());
        }
        if pod.pod_ip.is_empty() {
            debug!(pod = %pod.pod_key(), "pod has no ip yet");
            return Ok(());
        }
        let ip = parse_pod_ip(&pod.pod_ip)?;
        let pod_key = pod.pod_key();

        let stale = self
            .endpoint_cache
            .lock()
            .get(&pod_key)
            .is_none_or(|endpoint| endpoint.ip != ip);
        if stale {
            let network_id = self.network_id();
            let endpoints = with_timeout(
                "list_endpoints",
                self.config.backend_timeout(),
                self.backend.list_endpoints(&network_id),
            )
            .await?;

            match endpoints.iter().find(|e| e.has_ip(ip)) {
                Some(host) => {
                    debug!(pod = %pod_key, endpoint = %host.id, ip = %ip, "endpoint cached");
                    self.endpoint_cache
                        .lock()
                        .insert(pod_key.clone(), NpmEndpoint::from_host(host, ip));
                }
                None => {
                    warn!(pod = %pod_key, ip = %ip, "no endpoint found for pod ip");
                    self.endpoint_cache.lock().remove(&pod_key);
                }
            }
        }

        let endpoint_id = self.endpoint(&pod_key).map(|e| e.id);
        let names: Vec<String> = self
            .policy_manager
            .policies()
            .into_iter()
            .map(|policy| policy.name)
            .collect();

        for name in names {
            let _transition = self.lock_policy(&name).await;
            // 락을 기다리는 동안 바뀌었을 수 있으므로 다시 읽음
            let Some(policy) = self.policy_manager.get_policy(&name) else {
                continue;
            };

            let wanted = match &endpoint_id {
                Some(id) => self.selects(&policy, ip)?.then(|| id.clone()),
                None => None,
            };
            if policy.pod_endpoints.get(&pod_key) == wanted.as_ref() {
                continue;
            }

            let mut updated = policy;
            match &wanted {
                Some(id) => updated.pod_endpoints.insert(pod_key.clone(), id.clone()),
                None => updated.pod_endpoints.remove(&pod_key),
            };
            self.policy_manager
                .update_policy(updated)
                .await
                .map_err(|e| e.in_phase(PolicyPhase::PolicyUpdate))?;

            match wanted {
                Some(id) => {
                    self.attach_endpoints(&name, std::iter::once(pod_key.as_str()));
                    info!(policy = %name, pod = %pod_key, endpoint = %id, "policy applied to pod endpoint");
                }
                None => {
                    self.detach_endpoints(&name, std::iter::once(pod_key.as_str()));
                    info!(policy = %name, pod = %pod_key, "policy detached from pod endpoint");
                }
            }
        }
        Ok(())
    }

    /// 정책의 셀렉터 해시셋이 `ip`를 고르는지 확인합니다.
    fn selects(&self, policy: &NpmNetworkPolicy, ip: Ipv4Addr) -> Result<bool, DataplaneError> {
        let selector = policy.selector_hash_set_names();
        if selector.is_empty() {
            return Ok(false);
        }
        let selected = self
            .ipset_manager
            .get_ips_from_selector_ip_sets(&selector)
            .map_err(|e| e.in_phase(PolicyPhase::EndpointResolution))?;
        Ok(selected.contains(&ip))
    }

    /// 백엔드의 엔드포인트 목록으로 캐시된 엔드포인트를 검증합니다.
    ///
    /// IP가 더 이상 보고되지 않는 엔트리는 제거하고, 남은 엔트리의 이름과 ID는
    /// 백엔드 기준으로 맞춥니다.
    async fn refresh_pod_endpoints(&self, network_id: &str) -> Result<(), DataplaneError> {
        let endpoints = with_timeout(
            "list_endpoints",
            self.config.backend_timeout(),
            self.backend.list_endpoints(network_id),
        )
        .await?;

        let by_ip: HashMap<Ipv4Addr, &HostEndpoint> = endpoints
            .iter()
            .flat_map(|endpoint| {
                endpoint.ip_addresses.iter().filter_map(move |addr| match addr {
                    IpAddr::V4(v4) => Some((*v4, endpoint)),
                    IpAddr::V6(_) => None,
                })
            })
            .collect();

        let mut cache = self.endpoint_cache.lock();
        cache.retain(|pod_key, cached| match by_ip.get(&cached.ip) {
            Some(host) => {
                cached.name.clone_from(&host.name);
                cached.id.clone_from(&host.id);
                true
            }
            None => {
                debug!(pod = %pod_key, ip = %cached.ip, "dropping endpoint no longer on network");
                false
            }
        });
        info!(
            network_id,
            host_endpoints = endpoints.len(),
            cached = cache.len(),
            "pod endpoints refreshed"
        );
        Ok(())
    }

    /// 정책의 셀렉터 해시셋이 고르는 파드의 엔드포인트를 계산합니다.
    fn resolve_endpoints(
        &self,
        policy: &NpmNetworkPolicy,
    ) -> Result<BTreeMap<String, String>, DataplaneError> {
        if !self.platform.manages_endpoints() {
            return Ok(BTreeMap::new());
        }
        let selector = policy.selector_hash_set_names();
        if selector.is_empty() {
            return Ok(BTreeMap::new());
        }

        let selected = self.ipset_manager.get_ips_from_selector_ip_sets(&selector)?;
        let cache = self.endpoint_cache.lock();
        Ok(cache
            .iter()
            .filter(|(_, endpoint)| selected.contains(&endpoint.ip))
            .map(|(pod_key, endpoint)| (pod_key.clone(), endpoint.id.clone()))
            .collect())
    }

    fn attach_endpoints<'a>(&self, policy: &str, pod_keys: impl Iterator<Item = &'a str>) {
        let mut cache = self.endpoint_cache.lock();
        for pod_key in pod_keys {
            if let Some(endpoint) = cache.get_mut(pod_key) {
                endpoint.policy_references.insert(policy.to_owned());
            }
        }
    }

    fn detach_endpoints<'a>(&self, policy: &str, pod_keys: impl Iterator<Item = &'a str>) {
        let mut cache = self.endpoint_cache.lock();
        for pod_key in pod_keys {
            if let Some(endpoint) = cache.get_mut(pod_key) {
                endpoint.policy_references.remove(policy);
            }
        }
    }

    // --- reference bookkeeping ---

    /// 셋을 생성(없으면)하고 참조를 등록한 뒤, 멤버를 가진 리스트는 멤버를 반영합니다.
    ///
    /// 리스트 멤버 셋은 정책이 참조하지 않으므로 여기서 만들지 않습니다. 멤버 셋이
    /// 아직 없으면 `SetNotFound`이며, 멤버를 만든 뒤 재시도하면 수렴합니다.
    fn add_ip_set_references(
        &self,
        sets: &[IpSetSpec],
        policy: &str,
        ref_type: ReferenceType,
    ) -> Result<(), DataplaneError> {
        for set in sets {
            self.ipset_manager
                .create_and_reference(&set.name, set.set_type, policy, ref_type)?;
        }

        for list in sets.iter().filter(|s| s.has_list_members()) {
            self.ipset_manager
                .add_to_list(&list.name, &list.member_names())?;
        }
        Ok(())
    }

    /// 참조를 해제하고, 참조가 모두 사라진 셋은 리스트 멤버를 비운 뒤 삭제합니다.
    ///
    /// 이미 삭제된 셋은 건너뜁니다.
    fn delete_ip_set_references<'a>(
        &self,
        sets: impl Iterator<Item = &'a IpSetSpec> + Clone,
        policy: &str,
        ref_type: ReferenceType,
    ) -> Result<(), DataplaneError> {
        for set in sets.clone() {
            match self
                .ipset_manager
                .delete_reference(&set.name, policy, ref_type)
            {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(set = %set.name, policy, "ipset already deleted, skipping dereference");
                }
                Err(err) => return Err(err),
            }
        }

        for set in sets {
            if self.ipset_manager.is_referenced(&set.name) {
                continue;
            }
            if set.has_list_members() {
                let members: Vec<&str> = set
                    .member_names()
                    .into_iter()
                    .filter(|member| self.ipset_manager.exists(member))
                    .collect();
                match self.ipset_manager.remove_from_list(&set.name, &members) {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!(set = %set.name, "list already deleted");
                    }
                    Err(err) => return Err(err),
                }
            }
            if self.ipset_manager.delete_ip_set_if_unreferenced(&set.name) {
                debug!(set = %set.name, policy, "deleted unreferenced ipset");
            }
        }
        Ok(())
    }

    /// 두 버전 모두에 있는 리스트에서 새 버전이 빼낸 멤버를 제거합니다.
    fn prune_list_members(
        &self,
        old: &NpmNetworkPolicy,
        new: &NpmNetworkPolicy,
    ) -> Result<(), DataplaneError> {
        let new_lists: HashMap<&str, &IpSetSpec> = new
            .pod_selector_ip_sets
            .iter()
            .chain(&new.rule_ip_sets)
            .map(|s| (s.name.as_str(), s))
            .collect();

        for old_list in old
            .pod_selector_ip_sets
            .iter()
            .chain(&old.rule_ip_sets)
            .filter(|s| s.has_list_members())
        {
            let Some(new_list) = new_lists.get(old_list.name.as_str()) else {
                continue;
            };
            let kept: HashSet<&str> = new_list.member_names().into_iter().collect();
            let removed: Vec<&str> = old_list
                .member_names()
                .into_iter()
                .filter(|member| !kept.contains(member) && self.ipset_manager.exists(member))
                .collect();
            if removed.is_empty() {
                continue;
            }
            debug!(list = %old_list.name, removed = removed.len(), "pruning list members");
            self.ipset_manager.remove_from_list(&old_list.name, &removed)?;
        }
        Ok(())
    }

    // --- ipset pass-throughs ---

    /// 셋을 생성합니다. 이미 있으면 아무것도 하지 않습니다.
    pub fn create_ip_set(&self, name: &str, set_type: SetType) -> Result<(), DataplaneError> {
        self.ipset_manager
            .create_ip_set(name, set_type)
            .inspect_err(|err| debug!(set = name, error = %err, "create ipset rejected"))
    }

    /// 셋을 삭제합니다. 정책이 참조하거나 리스트의 멤버인 셋은 삭제를 미룹니다.
    ///
    /// 실제로 삭제했으면 `true`를 반환합니다.
    pub fn delete_ip_set(&self, name: &str) -> bool {
        self.ipset_manager.delete_ip_set_if_unreferenced(name)
    }

    /// IP를 셋들에 추가합니다. 없는 셋은 자동 생성됩니다.
    pub fn add_to_set<S: AsRef<str>>(
        &self,
        set_names: &[S],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), DataplaneError> {
        self.ipset_manager
            .add_to_set(set_names, ip, pod_key)
            .inspect_err(|err| debug!(ip, pod_key, error = %err, "add to set rejected"))
    }

    /// IP를 셋들에서 제거합니다. 소유자가 다르면 stale 업데이트로 무시됩니다.
    pub fn remove_from_set<S: AsRef<str>>(
        &self,
        set_names: &[S],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), DataplaneError> {
        self.ipset_manager
            .remove_from_set(set_names, ip, pod_key)
            .inspect_err(|err| debug!(ip, pod_key, error = %err, "remove from set rejected"))
    }

    /// 셋들을 리스트의 멤버로 추가합니다.
    pub fn add_to_list<S: AsRef<str>>(
        &self,
        list_name: &str,
        set_names: &[S],
    ) -> Result<(), DataplaneError> {
        self.ipset_manager
            .add_to_list(list_name, set_names)
            .inspect_err(|err| debug!(list = list_name, error = %err, "add to list rejected"))
    }

    /// 셋들을 리스트에서 제거합니다.
    pub fn remove_from_list<S: AsRef<str>>(
        &self,
        list_name: &str,
        set_names: &[S],
    ) -> Result<(), DataplaneError> {
        self.ipset_manager
            .remove_from_list(list_name, set_names)
            .inspect_err(|err| debug!(list = list_name, error = %err, "remove from list rejected"))
    }

    /// 셀렉터 해시셋들의 IP 교집합
    pub fn get_ips_from_selector_ip_sets<S: AsRef<str>>(
        &self,
        set_names: &[S],
    ) -> Result<HashSet<Ipv4Addr>, DataplaneError> {
        self.ipset_manager.get_ips_from_selector_ip_sets(set_names)
    }

    // --- accessors ---

    /// 정책이 캐시에 있는지 확인합니다.
    pub fn policy_exists(&self, name: &str) -> bool {
        self.policy_manager.policy_exists(name)
    }

    /// 캐시된 정책의 사본
    pub fn get_policy(&self, name: &str) -> Option<NpmNetworkPolicy> {
        self.policy_manager.get_policy(name)
    }

    /// 캐시된 셋의 스냅샷
    pub fn get_ip_set(&self, name: &str) -> Option<IpSet> {
        self.ipset_manager.get_ip_set(name)
    }

    /// 캐시된 셋 수
    pub fn ip_set_count(&self) -> usize {
        self.ipset_manager.set_count()
    }

    /// 아직 반영되지 않은 셋 변경 수
    pub fn pending_changes(&self) -> usize {
        self.ipset_manager.pending_changes()
    }

    /// 파드 키로 캐시된 엔드포인트를 조회합니다.
    pub fn endpoint(&self, pod_key: &str) -> Option<NpmEndpoint> {
        self.endpoint_cache.lock().get(pod_key).cloned()
    }

    /// 현재 네트워크 ID. 초기화 전에는 네트워크 이름입니다.
    pub fn network_id(&self) -> String {
        self.network_id.read().clone()
    }

    /// 플랫폼 이름
    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    /// 성공한 반영 호출 수
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }

    /// 실패한 반영 호출 수
    pub fn apply_failure_count(&self) -> u64 {
        self.apply_failures.load(Ordering::Relaxed)
    }
}

fn parse_pod_ip(ip: &str) -> Result<Ipv4Addr, DataplaneError> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        Ok(IpAddr::V6(v6)) => v6.to_ipv4_mapped().ok_or_else(|| unsupported(ip)),
        Err(_) => Err(unsupported(ip)),
    }
}

fn unsupported(ip: &str) -> DataplaneError {
    DataplaneError::UnsupportedFamily {
        address: ip.to_owned(),
    }
}
