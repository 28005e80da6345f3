//! IPSet 매니저
//!
//! 해시셋 캐시와 리스트셋 캐시를 각각 독립된 락으로 보호합니다.
//! 두 캐시를 모두 건드리는 연산은 항상 **리스트 캐시 → 해시 캐시** 순서로 락을 잡습니다.
//! 파드 IP 변경처럼 이미 있는 해시셋만 다루는 경로는 해시 캐시 락만 잡으므로,
//! 리스트 멤버십 변경과 막히지 않고 병행됩니다.
//!
//! 멤버십 변경은 캐시만 갱신하고 해당 셋을 dirty로 표시합니다. 실제 백엔드 반영은
//! [`IpSetManager::apply_ip_sets`]에서 한 번에 수행됩니다.
//!
//! # 파드 소유권
//!
//! 해시셋의 각 IP는 정확히 하나의 파드 키가 소유합니다. 다른 파드 키로 다시 추가되면
//! 소유자를 덮어쓰고(last-writer-wins), 소유자가 아닌 파드 키로 들어온 삭제는
//! stale 업데이트로 간주하여 무시합니다.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use netpol_core::metrics as m;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{DataplaneBackend, IpSetUpdate, with_timeout};
use crate::config::DataPlaneConfig;
use crate::error::DataplaneError;
use crate::platform::Platform;

use super::types::{IpSet, MemberRef, ReferenceType, SetKind, SetMembers, SetType};

/// 삭제 시점의 리스트 간 연결. 삭제 순서를 정하는 데만 씁니다.
#[derive(Debug, Clone, Default)]
struct Removal {
    /// 이 셋이 품고 있던 리스트셋 멤버
    nested: Vec<String>,
    /// 이 셋을 멤버로 갖고 있던 리스트
    parents: Vec<String>,
}

/// 한 종류의 셋 캐시와 미반영 변경 목록
#[derive(Default)]
struct SetCache {
    sets: HashMap<String, IpSet>,
    /// 생성/변경되어 upsert가 필요한 셋
    dirty: BTreeSet<String>,
    /// 삭제되어 destroy가 필요한 셋
    deleted: BTreeMap<String, Removal>,
}

impl SetCache {
    fn mark_dirty(&mut self, name: &str) {
        self.deleted.remove(name);
        self.dirty.insert(name.to_owned());
    }

    fn mark_deleted(&mut self, name: &str, removal: Removal) {
        self.dirty.remove(name);
        self.deleted.insert(name.to_owned(), removal);
    }

    fn pending(&self) -> usize {
        self.dirty.len() + self.deleted.len()
    }
}

/// 백엔드로 보낼 셋 변경 묶음
struct PendingBatch {
    updates: Vec<IpSetUpdate>,
    /// 실패 시 되돌릴 리스트 삭제 정보
    removals: BTreeMap<String, Removal>,
}

/// IPSet 매니저
///
/// 해시/리스트 캐시를 소유하며, 셋 생성과 삭제, 멤버십, 정책 참조를 관리합니다.
pub struct IpSetManager<B: DataplaneBackend> {
    backend: Arc<B>,
    lists: Mutex<SetCache>,
    hashes: Mutex<SetCache>,
    nested_lists: bool,
    max_ipsets: usize,
    backend_timeout: Duration,
}

impl<B: DataplaneBackend> IpSetManager<B> {
    /// 빈 캐시로 매니저를 생성합니다.
    pub fn new(backend: Arc<B>, platform: &dyn Platform, config: &DataPlaneConfig) -> Self {
        Self {
            backend,
            lists: Mutex::new(SetCache::default()),
            hashes: Mutex::new(SetCache::default()),
            nested_lists: platform.supports_nested_lists(),
            max_ipsets: config.max_ipsets,
            backend_timeout: config.backend_timeout(),
        }
    }

    /// 리스트 캐시, 해시 캐시 순서로 락을 잡습니다.
    fn lock_both(&self) -> (MutexGuard<'_, SetCache>, MutexGuard<'_, SetCache>) {
        let lists = self.lists.lock();
        let hashes = self.hashes.lock();
        (lists, hashes)
    }

    fn check_capacity(&self, current: usize, additional: usize) -> Result<(), DataplaneError> {
        if current + additional > self.max_ipsets {
            return Err(DataplaneError::Config {
                field: "max_ipsets".to_owned(),
                reason: format!("cannot cache more than {} ipsets", self.max_ipsets),
            });
        }
        Ok(())
    }

    /// 셋을 생성합니다. 이미 있으면 아무것도 하지 않습니다.
    ///
    /// # Errors
    ///
    /// - `UnknownKind`: `set_type`이 해시/리스트 어느 쪽에도 대응하지 않음
    /// - `WrongKind`: 같은 이름의 셋이 다른 종류로 이미 존재함
    /// - `Config`: `max_ipsets` 초과
    pub fn create_ip_set(&self, name: &str, set_type: SetType) -> Result<(), DataplaneError> {
        let (mut lists, mut hashes) = self.lock_both();
        self.create_locked(&mut lists, &mut hashes, name, set_type)
    }

    /// 셋을 (없으면) 생성하고 정책 참조를 등록합니다.
    ///
    /// 생성과 참조 등록이 같은 락 안에서 일어나므로, 다른 정책이 마지막 참조를 풀며
    /// 셋을 지우는 중이어도 참조가 사라진 셋에 걸리지 않습니다.
    ///
    /// # Errors
    ///
    /// [`create_ip_set`](Self::create_ip_set)과 같습니다.
    pub fn create_and_reference(
        &self,
        name: &str,
        set_type: SetType,
        policy: &str,
        ref_type: ReferenceType,
    ) -> Result<(), DataplaneError> {
        let (mut lists, mut hashes) = self.lock_both();
        self.create_locked(&mut lists, &mut hashes, name, set_type)?;
        let set = lists
            .sets
            .get_mut(name)
            .or_else(|| hashes.sets.get_mut(name))
            .ok_or_else(|| not_found(name))?;
        set.add_reference(policy, ref_type);
        Ok(())
    }

    fn create_locked(
        &self,
        lists: &mut SetCache,
        hashes: &mut SetCache,
        name: &str,
        set_type: SetType,
    ) -> Result<(), DataplaneError> {
        let Some(kind) = set_type.kind() else {
            return Err(DataplaneError::UnknownKind {
                name: name.to_owned(),
                set_type,
            });
        };

        let total = lists.sets.len() + hashes.sets.len();
        let (target, other) = match kind {
            SetKind::HashSet => (&mut *hashes, &*lists),
            SetKind::ListSet => (&mut *lists, &*hashes),
        };

        if let Some(existing) = target.sets.get_mut(name) {
            // AddToSet가 자동 생성한 셋은 실제 용도를 이어받음
            if existing.set_type == SetType::Unknown {
                existing.set_type = set_type;
            }
            return Ok(());
        }
        if let Some(existing) = other.sets.get(name) {
            return Err(wrong_kind(name, kind, existing.kind()));
        }
        self.check_capacity(total, 1)?;

        target
            .sets
            .insert(name.to_owned(), IpSet::with_kind(name.to_owned(), set_type, kind));
        target.mark_dirty(name);
        debug!(set = name, %set_type, %kind, "created ipset");

        record_set_counts(lists, hashes);
        Ok(())
    }

    /// 여러 해시셋에 IP를 추가합니다. 없는 셋은 `Unknown` 타입 해시셋으로 생성됩니다.
    ///
    /// 모든 셋을 검증한 뒤에만 캐시를 변경합니다. 셋이 모두 있으면 해시 캐시 락만 잡습니다.
    ///
    /// # Errors
    ///
    /// - `UnsupportedFamily`: IPv4가 아닌 주소
    /// - `WrongKind`: 이름 중 하나가 리스트셋
    /// - `Config`: 자동 생성으로 `max_ipsets` 초과
    pub fn add_to_set<S: AsRef<str>>(
        &self,
        set_names: &[S],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), DataplaneError> {
        let addr = parse_ipv4(ip)?;
        {
            let mut hashes = self.hashes.lock();
            if set_names
                .iter()
                .all(|name| hashes.sets.contains_key(name.as_ref()))
            {
                let added = insert_member(&mut hashes, set_names, addr, pod_key);
                debug!(ip = %addr, pod_key, added, "added ip to sets");
                return Ok(());
            }
        }

        // 새 셋이 필요하면 리스트와의 이름 충돌, 용량까지 함께 확인
        let (lists, mut hashes) = self.lock_both();
        let mut missing = BTreeSet::new();
        for name in set_names {
            let name = name.as_ref();
            if lists.sets.contains_key(name) {
                return Err(wrong_kind(name, SetKind::HashSet, SetKind::ListSet));
            }
            if !hashes.sets.contains_key(name) {
                missing.insert(name);
            }
        }
        self.check_capacity(lists.sets.len() + hashes.sets.len(), missing.len())?;

        let added = insert_member(&mut hashes, set_names, addr, pod_key);
        if !missing.is_empty() {
            debug!(sets = ?missing, "auto-created hash sets");
            record_set_counts(&lists, &hashes);
        }
        debug!(ip = %addr, pod_key, added, "added ip to sets");
        Ok(())
    }

    /// 여러 해시셋에서 IP를 제거합니다.
    ///
    /// 현재 소유자가 `pod_key`와 다르면 stale 업데이트로 보고 해당 셋은 건드리지 않습니다.
    ///
    /// # Errors
    ///
    /// - `UnsupportedFamily`: IPv4가 아닌 주소
    /// - `SetNotFound`: 이름 중 하나가 존재하지 않음
    /// - `WrongKind`: 이름 중 하나가 리스트셋
    pub fn remove_from_set<S: AsRef<str>>(
        &self,
        set_names: &[S],
        ip: &str,
        pod_key: &str,
    ) -> Result<(), DataplaneError> {
        let addr = parse_ipv4(ip)?;
        let mut hashes = self.hashes.lock();

        let missing = set_names
            .iter()
            .map(|name| name.as_ref())
            .find(|name| !hashes.sets.contains_key(*name));
        if let Some(name) = missing {
            drop(hashes);
            return Err(self.missing_hash_set(name));
        }

        let mut removed = Vec::new();
        for name in set_names {
            let name = name.as_ref();
            let Some(ips) = hashes.sets.get_mut(name).and_then(IpSet::hash_members_mut) else {
                continue;
            };

            match ips.get(&addr).cloned() {
                Some(owner) if owner == pod_key => {
                    ips.remove(&addr);
                    removed.push(name);
                }
                Some(owner) => {
                    info!(
                        set = name,
                        ip = %addr,
                        owner = owner.as_str(),
                        pod_key,
                        "ignoring stale delete, ip is owned by another pod"
                    );
                }
                None => {
                    debug!(set = name, ip = %addr, "ip not in set");
                }
            }
        }

        for name in &removed {
            hashes.mark_dirty(name);
            record_entry_removed(name);
        }
        Ok(())
    }

    /// 리스트셋에 멤버 셋을 추가합니다.
    ///
    /// # Errors
    ///
    /// - `SelfReference`: 리스트를 자기 자신에 추가
    /// - `SetNotFound`: 리스트 또는 멤버가 존재하지 않음
    /// - `WrongKind`: 대상이 리스트셋이 아니거나, 중첩을 지원하지 않는 플랫폼에서 멤버가 리스트셋
    pub fn add_to_list<S: AsRef<str>>(
        &self,
        list_name: &str,
        member_names: &[S],
    ) -> Result<(), DataplaneError> {
        check_self_reference(list_name, member_names)?;
        let (mut lists, mut hashes) = self.lock_both();
        check_list(&lists, &hashes, list_name)?;
        let members = self.resolve_members(&lists, &hashes, member_names)?;

        let mut changed = false;
        let mut added = Vec::new();
        if let Some(entries) = lists
            .sets
            .get_mut(list_name)
            .and_then(IpSet::list_members_mut)
        {
            for (name, member) in &members {
                match entries.insert((*name).to_owned(), *member) {
                    Some(previous) if previous == *member => {}
                    Some(_) => {
                        debug!(list = list_name, member = *name, "replaced list member reference");
                        changed = true;
                    }
                    None => {
                        added.push(*name);
                        changed = true;
                    }
                }
            }
        }

        for (name, member) in &members {
            let cache = match member.kind {
                SetKind::HashSet => &mut *hashes,
                SetKind::ListSet => &mut *lists,
            };
            if let Some(set) = cache.sets.get_mut(*name) {
                set.member_of_lists.insert(list_name.to_owned());
            }
        }
        for _ in &added {
            record_entry_added(list_name);
        }
        if changed {
            lists.mark_dirty(list_name);
        }
        debug!(list = list_name, added = added.len(), "added members to list");
        Ok(())
    }

    /// 리스트셋에서 멤버 셋을 제거합니다. 멤버가 아닌 셋은 무시합니다.
    ///
    /// # Errors
    ///
    /// [`add_to_list`](Self::add_to_list)와 같은 검증을 수행합니다.
    pub fn remove_from_list<S: AsRef<str>>(
        &self,
        list_name: &str,
        member_names: &[S],
    ) -> Result<(), DataplaneError> {
        check_self_reference(list_name, member_names)?;
        let (mut lists, mut hashes) = self.lock_both();
        check_list(&lists, &hashes, list_name)?;
        let members = self.resolve_members(&lists, &hashes, member_names)?;

        let mut removed = Vec::new();
        if let Some(entries) = lists
            .sets
            .get_mut(list_name)
            .and_then(IpSet::list_members_mut)
        {
            for (name, _) in &members {
                if entries.remove(*name).is_some() {
                    removed.push(*name);
                }
            }
        }

        for (name, member) in &members {
            if !removed.contains(name) {
                continue;
            }
            let cache = match member.kind {
                SetKind::HashSet => &mut *hashes,
                SetKind::ListSet => &mut *lists,
            };
            if let Some(set) = cache.sets.get_mut(*name) {
                set.member_of_lists.remove(list_name);
            }
            record_entry_removed(list_name);
        }
        if !removed.is_empty() {
            lists.mark_dirty(list_name);
        }
        Ok(())
    }

    /// 셋을 캐시에서 무조건 제거합니다. 제거했으면 `true`를 반환합니다.
    ///
    /// 참조 여부는 확인하지 않습니다. 리스트를 지우면 멤버들의 역참조가 정리되고,
    /// 다른 리스트의 멤버였던 셋은 그 리스트에서도 빠집니다.
    pub fn delete_ip_set(&self, name: &str) -> bool {
        let (mut lists, mut hashes) = self.lock_both();
        let deleted = delete_locked(&mut lists, &mut hashes, name);
        if deleted {
            record_set_counts(&lists, &hashes);
        }
        deleted
    }

    /// 정책 참조도 리스트 멤버십도 없을 때만 셋을 제거합니다.
    pub fn delete_ip_set_if_unreferenced(&self, name: &str) -> bool {
        let (mut lists, mut hashes) = self.lock_both();
        let deletable = lists
            .sets
            .get(name)
            .or_else(|| hashes.sets.get(name))
            .map(IpSet::can_be_deleted);

        match deletable {
            None => false,
            Some(false) => {
                debug!(set = name, "ipset still in use, deletion deferred");
                false
            }
            Some(true) => {
                let deleted = delete_locked(&mut lists, &mut hashes, name);
                record_set_counts(&lists, &hashes);
                deleted
            }
        }
    }

    /// 정책 참조를 등록합니다. 같은 참조를 다시 등록해도 한 번으로 셉니다.
    ///
    /// # Errors
    ///
    /// 셋이 없으면 `SetNotFound`
    pub fn add_reference(
        &self,
        name: &str,
        policy: &str,
        ref_type: ReferenceType,
    ) -> Result<(), DataplaneError> {
        self.with_set_mut(name, |set| set.add_reference(policy, ref_type))
            .ok_or_else(|| not_found(name))
    }

    /// 정책 참조를 해제합니다. 없는 참조 해제는 무시합니다.
    ///
    /// # Errors
    ///
    /// 셋이 없으면 `SetNotFound`
    pub fn delete_reference(
        &self,
        name: &str,
        policy: &str,
        ref_type: ReferenceType,
    ) -> Result<(), DataplaneError> {
        self.with_set_mut(name, |set| set.delete_reference(policy, ref_type))
            .ok_or_else(|| not_found(name))
    }

    /// 셋에 정책 참조가 있는지 확인합니다. 셋이 없으면 `false`입니다.
    pub fn is_referenced(&self, name: &str) -> bool {
        self.with_set(name, IpSet::is_referenced).unwrap_or(false)
    }

    /// 셋이 캐시에 있는지 확인합니다.
    pub fn exists(&self, name: &str) -> bool {
        self.with_set(name, |_| ()).is_some()
    }

    /// 셋의 스냅샷을 반환합니다.
    pub fn get_ip_set(&self, name: &str) -> Option<IpSet> {
        self.with_set(name, IpSet::clone)
    }

    /// 리스트 캐시, 해시 캐시를 하나씩 잠그며 셋을 찾습니다. 두 락을 동시에 잡지 않습니다.
    fn with_set<R>(&self, name: &str, f: impl FnOnce(&IpSet) -> R) -> Option<R> {
        {
            let lists = self.lists.lock();
            if let Some(set) = lists.sets.get(name) {
                return Some(f(set));
            }
        }
        let hashes = self.hashes.lock();
        hashes.sets.get(name).map(f)
    }

    fn with_set_mut<R>(&self, name: &str, f: impl FnOnce(&mut IpSet) -> R) -> Option<R> {
        {
            let mut lists = self.lists.lock();
            if let Some(set) = lists.sets.get_mut(name) {
                return Some(f(set));
            }
        }
        let mut hashes = self.hashes.lock();
        hashes.sets.get_mut(name).map(f)
    }

    /// 해시 캐시에 없는 이름이 리스트셋인지 확인해 알맞은 에러를 만듭니다.
    fn missing_hash_set(&self, name: &str) -> DataplaneError {
        if self.lists.lock().sets.contains_key(name) {
            wrong_kind(name, SetKind::HashSet, SetKind::ListSet)
        } else {
            not_found(name)
        }
    }

    /// 캐시된 셋 수 (해시 + 리스트)
    pub fn set_count(&self) -> usize {
        let (lists, hashes) = self.lock_both();
        lists.sets.len() + hashes.sets.len()
    }

    /// 아직 백엔드에 반영되지 않은 셋 변경 수
    pub fn pending_changes(&self) -> usize {
        let (lists, hashes) = self.lock_both();
        lists.pending() + hashes.pending()
    }

    /// 모든 캐시와 미반영 변경을 비웁니다.
    pub fn clear(&self) {
        let (mut lists, mut hashes) = self.lock_both();
        for name in lists.sets.keys().chain(hashes.sets.keys()) {
            metrics::gauge!(m::IPSET_INVENTORY, m::LABEL_SET_NAME => name.clone()).set(0.0);
        }
        *lists = SetCache::default();
        *hashes = SetCache::default();
        metrics::gauge!(m::IPSET_ENTRIES).set(0.0);
        record_set_counts(&lists, &hashes);
    }

    /// 셀렉터 해시셋들의 IP 교집합을 계산합니다.
    ///
    /// 여러 라벨 셀렉터의 AND 의미를 구현합니다. 입력 순서와 무관하게 같은 결과를
    /// 반환하며, 셋 하나라도 비어 있으면 빈 집합입니다.
    ///
    /// # Errors
    ///
    /// - `SetNotFound`: 이름 중 하나가 존재하지 않음
    /// - `WrongKind`: 이름 중 하나가 리스트셋
    pub fn get_ips_from_selector_ip_sets<S: AsRef<str>>(
        &self,
        set_names: &[S],
    ) -> Result<HashSet<Ipv4Addr>, DataplaneError> {
        let missing = {
            let hashes = self.hashes.lock();
            match selector_members(&hashes, set_names) {
                Ok(members) => return Ok(intersect(members)),
                Err(name) => name,
            }
        };
        Err(self.missing_hash_set(missing))
    }

    /// 미반영 셋 변경을 백엔드에 한 번에 반영하고 `flush`합니다.
    ///
    /// 해시 upsert → 리스트 upsert → 리스트 삭제 → 해시 삭제 순서로 프로그래밍합니다.
    /// 리스트 upsert는 중첩 멤버 리스트가 먼저, 리스트 삭제는 부모 리스트가 먼저 나가므로
    /// 중첩 깊이와 무관하게 리스트가 존재하지 않는 멤버를 가리키는 순간이 없습니다.
    /// 변경이 없으면 백엔드를 호출하지 않습니다. 실패하면 변경은 다시 미반영 상태로 남습니다.
    ///
    /// 반영한 셋 변경 수를 반환합니다.
    pub async fn apply_ip_sets(&self, network_id: &str) -> Result<usize, DataplaneError> {
        let batch = self.take_pending();
        let count = batch.updates.len();
        if count == 0 {
            debug!(network_id, "no pending ipset changes");
            return Ok(0);
        }

        match self.program(network_id, &batch.updates).await {
            Ok(()) => {
                info!(network_id, updates = count, "applied ipset changes");
                Ok(count)
            }
            Err(err) => {
                warn!(
                    network_id,
                    updates = count,
                    error = %err,
                    "ipset apply failed, changes stay pending"
                );
                self.restore_pending(batch);
                Err(err)
            }
        }
    }

    /// 미반영 변경을 스냅샷으로 떼어내고 목록을 비웁니다.
    fn take_pending(&self) -> PendingBatch {
        let (mut lists, mut hashes) = self.lock_both();
        let hash_dirty = std::mem::take(&mut hashes.dirty);
        let list_dirty = std::mem::take(&mut lists.dirty);
        let list_deleted = std::mem::take(&mut lists.deleted);
        let hash_deleted = std::mem::take(&mut hashes.deleted);

        let mut updates: Vec<IpSetUpdate> = hash_dirty
            .iter()
            .filter_map(|name| hashes.sets.get(name).cloned())
            .map(IpSetUpdate::Upsert)
            .collect();

        let upsert_order = dependency_order(list_dirty.iter(), |name| {
            lists.sets.get(name).map(nested_list_names).unwrap_or_default()
        });
        updates.extend(
            upsert_order
                .iter()
                .filter_map(|name| lists.sets.get(name).cloned())
                .map(IpSetUpdate::Upsert),
        );

        // 부모 리스트가 먼저 지워져야 함
        let delete_order = dependency_order(list_deleted.keys(), |name| {
            let mut parents = list_deleted
                .get(name)
                .map(|removal| removal.parents.clone())
                .unwrap_or_default();
            parents.extend(
                list_deleted
                    .iter()
                    .filter(|(_, removal)| removal.nested.iter().any(|n| n == name))
                    .map(|(parent, _)| parent.clone()),
            );
            parents
        });
        updates.extend(delete_order.into_iter().map(|name| IpSetUpdate::Delete {
            name,
            kind: SetKind::ListSet,
        }));
        updates.extend(hash_deleted.into_keys().map(|name| IpSetUpdate::Delete {
            name,
            kind: SetKind::HashSet,
        }));

        PendingBatch {
            updates,
            removals: list_deleted,
        }
    }

    async fn program(&self, network_id: &str, updates: &[IpSetUpdate]) -> Result<(), DataplaneError> {
        for update in updates {
            with_timeout(
                "program_ipset",
                self.backend_timeout,
                self.backend.program_ipset(update),
            )
            .await?;
        }
        with_timeout("flush", self.backend_timeout, self.backend.flush(network_id)).await
    }

    /// 실패한 스냅샷을 현재 캐시 상태 기준으로 다시 미반영 목록에 넣습니다.
    fn restore_pending(&self, mut batch: PendingBatch) {
        let (mut lists, mut hashes) = self.lock_both();
        for update in &batch.updates {
            let cache = match update.kind() {
                SetKind::HashSet => &mut *hashes,
                SetKind::ListSet => &mut *lists,
            };
            let name = update.name();
            if cache.sets.contains_key(name) {
                cache.mark_dirty(name);
            } else if !cache.deleted.contains_key(name) {
                let removal = batch.removals.remove(name).unwrap_or_default();
                cache.mark_deleted(name, removal);
            }
        }
    }

    fn resolve_members<'a, S: AsRef<str>>(
        &self,
        lists: &SetCache,
        hashes: &SetCache,
        member_names: &'a [S],
    ) -> Result<Vec<(&'a str, MemberRef)>, DataplaneError> {
        member_names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                if let Some(set) = hashes.sets.get(name) {
                    return Ok((
                        name,
                        MemberRef {
                            kind: SetKind::HashSet,
                            set_type: set.set_type,
                        },
                    ));
                }
                match lists.sets.get(name) {
                    Some(set) if self.nested_lists => Ok((
                        name,
                        MemberRef {
                            kind: SetKind::ListSet,
                            set_type: set.set_type,
                        },
                    )),
                    Some(_) => Err(wrong_kind(name, SetKind::HashSet, SetKind::ListSet)),
                    None => Err(not_found(name)),
                }
            })
            .collect()
    }
}

fn parse_ipv4(ip: &str) -> Result<Ipv4Addr, DataplaneError> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(addr),
        Ok(IpAddr::V6(addr)) => addr
            .to_ipv4_mapped()
            .ok_or_else(|| unsupported_family(ip)),
        Err(_) => Err(unsupported_family(ip)),
    }
}

fn unsupported_family(ip: &str) -> DataplaneError {
    DataplaneError::UnsupportedFamily {
        address: ip.to_owned(),
    }
}

fn not_found(name: &str) -> DataplaneError {
    DataplaneError::SetNotFound {
        name: name.to_owned(),
    }
}

fn wrong_kind(name: &str, expected: SetKind, actual: SetKind) -> DataplaneError {
    DataplaneError::WrongKind {
        name: name.to_owned(),
        expected,
        actual,
    }
}

fn check_self_reference<S: AsRef<str>>(
    list_name: &str,
    member_names: &[S],
) -> Result<(), DataplaneError> {
    if member_names.iter().any(|m| m.as_ref() == list_name) {
        return Err(DataplaneError::SelfReference {
            name: list_name.to_owned(),
        });
    }
    Ok(())
}

fn check_list(lists: &SetCache, hashes: &SetCache, name: &str) -> Result<(), DataplaneError> {
    if lists.sets.contains_key(name) {
        Ok(())
    } else if hashes.sets.contains_key(name) {
        Err(wrong_kind(name, SetKind::ListSet, SetKind::HashSet))
    } else {
        Err(not_found(name))
    }
}

/// 이미 있는 해시셋들에 IP를 넣고, 새로 들어간 셋 수를 반환합니다.
fn insert_member<S: AsRef<str>>(
    hashes: &mut SetCache,
    set_names: &[S],
    addr: Ipv4Addr,
    pod_key: &str,
) -> usize {
    let mut inserted = Vec::new();
    for name in set_names {
        let name = name.as_ref();
        let set = hashes.sets.entry(name.to_owned()).or_insert_with(|| {
            IpSet::with_kind(name.to_owned(), SetType::Unknown, SetKind::HashSet)
        });
        let Some(ips) = set.hash_members_mut() else {
            continue;
        };

        match ips.get(&addr).cloned() {
            Some(owner) if owner == pod_key => {}
            Some(owner) => {
                info!(
                    set = name,
                    ip = %addr,
                    old_pod_key = owner.as_str(),
                    new_pod_key = pod_key,
                    "pod owner changed for ip, replacing owner"
                );
                ips.insert(addr, pod_key.to_owned());
            }
            None => {
                ips.insert(addr, pod_key.to_owned());
                inserted.push(name);
            }
        }
    }

    for name in &inserted {
        hashes.mark_dirty(name);
        record_entry_added(name);
    }
    inserted.len()
}

type HashMembers = HashMap<Ipv4Addr, String>;

/// 셀렉터 셋들의 멤버를 모읍니다. 없는 셋이 있으면 그 이름을 돌려줍니다.
fn selector_members<'c, 'n, S: AsRef<str>>(
    hashes: &'c SetCache,
    set_names: &'n [S],
) -> Result<Vec<&'c HashMembers>, &'n str> {
    set_names
        .iter()
        .map(|name| match hashes.sets.get(name.as_ref()).map(|s| &s.members) {
            Some(SetMembers::Hash(ips)) => Ok(ips),
            _ => Err(name.as_ref()),
        })
        .collect()
}

fn intersect(mut members: Vec<&HashMembers>) -> HashSet<Ipv4Addr> {
    // 가장 작은 셋부터 훑음
    members.sort_by_key(|ips| ips.len());
    let Some((smallest, rest)) = members.split_first() else {
        return HashSet::new();
    };
    smallest
        .keys()
        .filter(|ip| rest.iter().all(|other| other.contains_key(*ip)))
        .copied()
        .collect()
}

fn nested_list_names(set: &IpSet) -> Vec<String> {
    match &set.members {
        SetMembers::List(members) => members
            .iter()
            .filter(|(_, member)| member.kind == SetKind::ListSet)
            .map(|(name, _)| name.clone())
            .collect(),
        SetMembers::Hash(_) => Vec::new(),
    }
}

/// `names`를 깊이 우선 후위 순서로 정렬합니다. `deps`가 돌려준 이름 중 `names`에 있는 것이
/// 항상 먼저 나오며, 순환이 있어도 각 이름은 한 번만 나옵니다.
fn dependency_order<'a, F>(names: impl Iterator<Item = &'a String> + Clone, deps: F) -> Vec<String>
where
    F: Fn(&str) -> Vec<String>,
{
    fn visit<F: Fn(&str) -> Vec<String>>(
        name: &str,
        wanted: &BTreeSet<&str>,
        deps: &F,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !wanted.contains(name) || !seen.insert(name.to_owned()) {
            return;
        }
        for dep in deps(name) {
            visit(&dep, wanted, deps, seen, out);
        }
        out.push(name.to_owned());
    }

    let wanted: BTreeSet<&str> = names.clone().map(String::as_str).collect();
    let mut seen = HashSet::with_capacity(wanted.len());
    let mut out = Vec::with_capacity(wanted.len());
    for name in names {
        visit(name, &wanted, &deps, &mut seen, &mut out);
    }
    out
}

fn delete_locked(lists: &mut SetCache, hashes: &mut SetCache, name: &str) -> bool {
    let set = if let Some(set) = lists.sets.remove(name) {
        let removal = Removal {
            nested: nested_list_names(&set),
            parents: set.member_of_lists.iter().cloned().collect(),
        };
        lists.mark_deleted(name, removal);
        set
    } else if let Some(set) = hashes.sets.remove(name) {
        hashes.mark_deleted(name, Removal::default());
        set
    } else {
        return false;
    };

    if let SetMembers::List(members) = &set.members {
        for (member, member_ref) in members {
            let cache = match member_ref.kind {
                SetKind::HashSet => &mut *hashes,
                SetKind::ListSet => &mut *lists,
            };
            if let Some(member_set) = cache.sets.get_mut(member) {
                member_set.member_of_lists.remove(name);
            }
        }
    }

    let mut detached = Vec::new();
    for parent in &set.member_of_lists {
        let removed = lists
            .sets
            .get_mut(parent)
            .and_then(IpSet::list_members_mut)
            .is_some_and(|entries| entries.remove(name).is_some());
        if removed {
            detached.push(parent.as_str());
        }
    }
    for parent in detached {
        lists.mark_dirty(parent);
        record_entry_removed(parent);
    }

    if set.is_referenced() {
        warn!(
            set = name,
            selector_references = set.selector_references.len(),
            rule_references = set.rule_references.len(),
            "deleted ipset that is still referenced by policies"
        );
    }
    record_set_removed(&set);
    debug!(set = name, kind = %set.kind(), "deleted ipset");
    true
}

// --- 메트릭 (기록 실패는 전파하지 않음) ---

fn record_entry_added(set_name: &str) {
    metrics::gauge!(m::IPSET_ENTRIES).increment(1.0);
    metrics::gauge!(m::IPSET_INVENTORY, m::LABEL_SET_NAME => set_name.to_owned()).increment(1.0);
}

fn record_entry_removed(set_name: &str) {
    metrics::gauge!(m::IPSET_ENTRIES).decrement(1.0);
    metrics::gauge!(m::IPSET_INVENTORY, m::LABEL_SET_NAME => set_name.to_owned()).decrement(1.0);
}

fn record_set_removed(set: &IpSet) {
    metrics::gauge!(m::IPSET_ENTRIES).decrement(set.member_count() as f64);
    metrics::gauge!(m::IPSET_INVENTORY, m::LABEL_SET_NAME => set.name.clone()).set(0.0);
}

fn record_set_counts(lists: &SetCache, hashes: &SetCache) {
    metrics::gauge!(m::IPSETS, m::LABEL_KIND => SetKind::HashSet.as_str())
        .set(hashes.sets.len() as f64);
    metrics::gauge!(m::IPSETS, m::LABEL_KIND => SetKind::ListSet.as_str())
        .set(lists.sets.len() as f64);
}
