//! 통합 테스트 -- 공개 API로 데이터플레인 전체 흐름 검증
//!
//! 셋 멤버십 → 정책 추가/제거 → 일괄 반영 시나리오를 테스트 백엔드로 실행합니다.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use netpol_dataplane::{
    DataPlane, DataPlaneConfigBuilder, DataplaneError, HostEndpoint, IpSetSpec, IpSetUpdate,
    NpmNetworkPolicy, NpmPod, PlatformKind, PolicyPhase, ReferenceType, SetType,
};

// Test backend recording what reached the host
mod mock {
    use super::*;
    use netpol_dataplane::DataplaneBackend;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct TestBackend {
        pub updates: Mutex<Vec<IpSetUpdate>>,
        pub flushes: Mutex<Vec<String>>,
        pub programmed: Mutex<HashSet<String>>,
        pub endpoints: Mutex<Vec<HostEndpoint>>,
        fail_flush: Mutex<bool>,
    }

    impl TestBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn set_fail_flush(&self, fail: bool) {
            *self.fail_flush.lock().await = fail;
        }

        pub async fn flush_count(&self) -> usize {
            self.flushes.lock().await.len()
        }
    }

    impl DataplaneBackend for TestBackend {
        async fn initialize(&self) -> Result<(), DataplaneError> {
            Ok(())
        }

        async fn reset(&self) -> Result<(), DataplaneError> {
            self.updates.lock().await.clear();
            self.programmed.lock().await.clear();
            Ok(())
        }

        async fn network_id(&self, network_name: &str) -> Result<String, DataplaneError> {
            Ok(format!("{network_name}-net"))
        }

        async fn list_endpoints(
            &self,
            _network_id: &str,
        ) -> Result<Vec<HostEndpoint>, DataplaneError> {
            Ok(self.endpoints.lock().await.clone())
        }

        async fn program_ipset(&self, update: &IpSetUpdate) -> Result<(), DataplaneError> {
            self.updates.lock().await.push(update.clone());
            Ok(())
        }

        async fn flush(&self, network_id: &str) -> Result<(), DataplaneError> {
            if *self.fail_flush.lock().await {
                return Err(DataplaneError::Backend {
                    operation: "flush".to_owned(),
                    reason: "test failure".to_owned(),
                });
            }
            self.flushes.lock().await.push(network_id.to_owned());
            Ok(())
        }

        async fn program_policy(&self, policy: &NpmNetworkPolicy) -> Result<(), DataplaneError> {
            self.programmed.lock().await.insert(policy.name.clone());
            Ok(())
        }

        async fn update_programmed_policy(
            &self,
            policy: &NpmNetworkPolicy,
        ) -> Result<(), DataplaneError> {
            self.programmed.lock().await.insert(policy.name.clone());
            Ok(())
        }

        async fn remove_programmed_policy(&self, name: &str) -> Result<(), DataplaneError> {
            self.programmed.lock().await.remove(name);
            Ok(())
        }
    }
}

use mock::TestBackend;

fn dataplane(platform: PlatformKind) -> (Arc<TestBackend>, DataPlane<TestBackend>) {
    let config = DataPlaneConfigBuilder::new()
        .node_name("node-1")
        .platform(platform)
        .build()
        .unwrap();
    let backend = Arc::new(TestBackend::new());
    let dp = DataPlane::new(config, backend.clone()).unwrap();
    (backend, dp)
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn total_refs(dp: &DataPlane<TestBackend>, name: &str) -> usize {
    dp.get_ip_set(name).map_or(0, |set| {
        set.reference_count(ReferenceType::Selector)
            + set.reference_count(ReferenceType::NetworkPolicyRule)
    })
}

#[tokio::test]
async fn selector_intersection_scenario() {
    let (_backend, dp) = dataplane(PlatformKind::Linux);
    for name in ["setNs1", "setpod1", "setpod2", "setpod3"] {
        dp.create_ip_set(name, SetType::KeyLabelOfPod).unwrap();
    }
    dp.add_to_set(&["setNs1", "setpod1", "setpod2", "setpod3"], "10.0.0.1", "test")
        .unwrap();
    dp.add_to_set(&["setNs1", "setpod1", "setpod2", "setpod3"], "10.0.0.2", "test1")
        .unwrap();
    dp.add_to_set(&["setNs1", "setpod2", "setpod3"], "10.0.0.3", "test3")
        .unwrap();

    let expected = HashSet::from([ip("10.0.0.1"), ip("10.0.0.2")]);
    let forward = dp
        .get_ips_from_selector_ip_sets(&["setNs1", "setpod1", "setpod2", "setpod3"])
        .unwrap();
    let reversed = dp
        .get_ips_from_selector_ip_sets(&["setpod3", "setpod2", "setpod1", "setNs1"])
        .unwrap();
    assert_eq!(forward, expected);
    assert_eq!(reversed, expected);
}

#[tokio::test]
async fn ownership_overwrite_and_stale_delete() {
    let (_backend, dp) = dataplane(PlatformKind::Linux);
    dp.create_ip_set("ns-default", SetType::Namespace).unwrap();
    dp.add_to_set(&["ns-default"], "10.0.0.4", "default/old").unwrap();
    dp.add_to_set(&["ns-default"], "10.0.0.4", "default/new").unwrap();

    // 이전 소유자의 삭제는 무시됨
    dp.remove_from_set(&["ns-default"], "10.0.0.4", "default/old")
        .unwrap();
    let set = dp.get_ip_set("ns-default").unwrap();
    assert_eq!(set.owner_of(ip("10.0.0.4")), Some("default/new"));

    dp.remove_from_set(&["ns-default"], "10.0.0.4", "default/new")
        .unwrap();
    assert_eq!(dp.get_ip_set("ns-default").unwrap().member_count(), 0);
}

#[tokio::test]
async fn remove_from_missing_set_is_not_found() {
    let (_backend, dp) = dataplane(PlatformKind::Linux);
    let err = dp
        .remove_from_set(&["never-created"], "10.0.0.4", "default/web-0")
        .unwrap_err();
    assert!(matches!(err, DataplaneError::SetNotFound { .. }));
}

#[tokio::test]
async fn list_membership_scenarios() {
    let (_backend, dp) = dataplane(PlatformKind::Linux);
    dp.create_ip_set("L", SetType::KeyLabelOfNamespace).unwrap();
    dp.create_ip_set("S", SetType::Namespace).unwrap();

    dp.add_to_list("L", &["S"]).unwrap();
    dp.remove_from_list("L", &["S"]).unwrap();
    dp.remove_from_list("L", &["S"]).unwrap();
    assert_eq!(dp.get_ip_set("L").unwrap().member_count(), 0);

    let err = dp.add_to_list("L", &["never-created"]).unwrap_err();
    assert!(matches!(err, DataplaneError::SetNotFound { .. }));

    for name in ["L", "S"] {
        let err = dp.add_to_list(name, &[name]).unwrap_err();
        assert!(matches!(err, DataplaneError::SelfReference { .. }));
    }
}

#[tokio::test]
async fn nested_lists_depend_on_platform() {
    for (platform, allowed) in [(PlatformKind::Linux, false), (PlatformKind::Windows, true)] {
        let (_backend, dp) = dataplane(platform);
        dp.create_ip_set("nslabel-outer", SetType::KeyLabelOfNamespace)
            .unwrap();
        dp.create_ip_set("nslabel-inner", SetType::KeyLabelOfNamespace)
            .unwrap();
        let result = dp.add_to_list("nslabel-outer", &["nslabel-inner"]);
        assert_eq!(result.is_ok(), allowed, "platform {platform}");
    }
}

#[tokio::test]
async fn add_policy_twice_does_not_duplicate_references() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    let policy = NpmNetworkPolicy::new("allow-web")
        .with_selector_sets(vec![IpSetSpec::new("ns-default", SetType::Namespace)])
        .with_rule_sets(vec![IpSetSpec::new("ns-frontend", SetType::Namespace)]);

    dp.add_policy(policy.clone()).await.unwrap();
    dp.add_policy(policy).await.unwrap();

    assert_eq!(total_refs(&dp, "ns-default"), 1);
    assert_eq!(total_refs(&dp, "ns-frontend"), 1);
    assert!(backend.programmed.lock().await.contains("allow-web"));
}

#[tokio::test]
async fn add_then_remove_returns_sets_to_zero() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    // 리스트 멤버는 컨트롤러가 먼저 만들어 둠
    dp.create_ip_set("ns-a", SetType::Namespace).unwrap();
    dp.create_ip_set("ns-b", SetType::Namespace).unwrap();
    let team = IpSetSpec::new("nslabel-team", SetType::KeyLabelOfNamespace).with_members(vec![
        IpSetSpec::new("ns-a", SetType::Namespace),
        IpSetSpec::new("ns-b", SetType::Namespace),
    ]);
    let policy = NpmNetworkPolicy::new("allow-team")
        .with_selector_sets(vec![
            IpSetSpec::new("ns-default", SetType::Namespace),
            IpSetSpec::new("podlabel-app", SetType::KeyLabelOfPod),
        ])
        .with_rule_sets(vec![team]);

    dp.add_policy(policy).await.unwrap();
    assert_eq!(total_refs(&dp, "nslabel-team"), 1);
    assert_eq!(dp.get_ip_set("nslabel-team").unwrap().member_count(), 2);

    dp.remove_policy("allow-team").await.unwrap();
    assert!(!dp.policy_exists("allow-team"));
    for name in ["ns-default", "podlabel-app", "nslabel-team"] {
        assert!(dp.get_ip_set(name).is_none(), "{name} should be deleted");
    }
    // 리스트 멤버는 참조가 없으므로 이제 삭제 가능
    assert!(dp.delete_ip_set("ns-a"));
    assert!(dp.delete_ip_set("ns-b"));
    assert!(backend.programmed.lock().await.is_empty());

    // 재시도해도 안전
    dp.remove_policy("allow-team").await.unwrap();
}

#[tokio::test]
async fn failed_update_policy_reports_phase() {
    let (_backend, dp) = dataplane(PlatformKind::Linux);
    let err = dp
        .update_policy(NpmNetworkPolicy::new("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(PolicyPhase::PolicyUpdate));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn apply_batches_and_orders_updates() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    dp.initialize_data_plane().await.unwrap();

    dp.create_ip_set("nslabel-team", SetType::KeyLabelOfNamespace)
        .unwrap();
    dp.add_to_set(&["ns-a"], "10.0.0.1", "a/p1").unwrap();
    dp.add_to_set(&["ns-a"], "10.0.0.2", "a/p2").unwrap();
    dp.add_to_list("nslabel-team", &["ns-a"]).unwrap();
    dp.apply_data_plane().await.unwrap();

    assert_eq!(*backend.flushes.lock().await, vec!["azure-net".to_owned()]);
    let names: Vec<String> = backend
        .updates
        .lock()
        .await
        .iter()
        .map(|u| u.name().to_owned())
        .collect();
    assert_eq!(names, vec!["ns-a", "nslabel-team"]);

    // 변경 없음 → 백엔드 호출 없음
    dp.apply_data_plane().await.unwrap();
    assert_eq!(backend.flush_count().await, 1);
}

#[tokio::test]
async fn failed_flush_is_retried_on_next_apply() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    dp.add_to_set(&["ns-a"], "10.0.0.1", "a/p1").unwrap();

    backend.set_fail_flush(true).await;
    assert!(dp.apply_data_plane().await.is_err());
    assert_eq!(dp.pending_changes(), 1);

    backend.set_fail_flush(false).await;
    dp.apply_data_plane().await.unwrap();
    assert_eq!(dp.pending_changes(), 0);
    assert_eq!(backend.flush_count().await, 1);
}

#[tokio::test]
async fn concurrent_mutations_flush_once() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    let dp = Arc::new(dp);

    let mut handles = Vec::new();
    for i in 0..16u8 {
        let dp = Arc::clone(&dp);
        handles.push(tokio::spawn(async move {
            let ip = format!("10.0.1.{i}");
            let pod = format!("default/pod-{i}");
            dp.add_to_set(&["ns-default", "podlabel-app"], &ip, &pod)
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    dp.apply_data_plane().await.unwrap();
    assert_eq!(backend.flush_count().await, 1);
    assert_eq!(dp.get_ip_set("ns-default").unwrap().member_count(), 16);
    assert_eq!(
        dp.get_ips_from_selector_ip_sets(&["ns-default", "podlabel-app"])
            .unwrap()
            .len(),
        16
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_set_and_list_mutations_stay_consistent() {
    let (backend, dp) = dataplane(PlatformKind::Windows);
    let dp = Arc::new(dp);

    // 해시셋은 AddToSet 자동 생성과 CreateIPSet가 경쟁하고, 리스트는 여러 태스크가 동시에 만듦
    let mut handles = Vec::new();
    for i in 0..8usize {
        let pods = Arc::clone(&dp);
        handles.push(tokio::spawn(async move {
            let set = format!("ns-{i}");
            for n in 0..32 {
                let pod = format!("ns-{i}/pod-{n}");
                pods.add_to_set(&[set.as_str()], &format!("10.{i}.0.{n}"), &pod)?;
            }
            // 절반은 다시 제거
            for n in (0..32).step_by(2) {
                let pod = format!("ns-{i}/pod-{n}");
                pods.remove_from_set(&[set.as_str()], &format!("10.{i}.0.{n}"), &pod)?;
            }
            Ok::<_, DataplaneError>(())
        }));

        let lists = Arc::clone(&dp);
        handles.push(tokio::spawn(async move {
            let list = format!("nslabel-{}", i % 4);
            let member = format!("ns-{i}");
            lists.create_ip_set(&member, SetType::Namespace)?;
            lists.create_ip_set(&list, SetType::KeyLabelOfNamespace)?;
            lists.create_ip_set("nested-all", SetType::NestedLabelOfPod)?;
            lists.add_to_list(&list, &[member])?;
            lists.add_to_list("nested-all", &[list])?;
            Ok::<_, DataplaneError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..8 {
        let set = dp.get_ip_set(&format!("ns-{i}")).unwrap();
        assert_eq!(set.member_count(), 16, "ns-{i}");
        assert_eq!(set.set_type, SetType::Namespace);
        assert!(set.member_of_lists.contains(&format!("nslabel-{}", i % 4)));
    }
    for l in 0..4 {
        let list = dp.get_ip_set(&format!("nslabel-{l}")).unwrap();
        assert_eq!(list.member_count(), 2);
        assert!(list.member_of_lists.contains("nested-all"));
    }
    assert_eq!(dp.get_ip_set("nested-all").unwrap().member_count(), 4);

    dp.apply_data_plane().await.unwrap();
    assert_eq!(backend.flush_count().await, 1);
    let names: Vec<String> = backend
        .updates
        .lock()
        .await
        .iter()
        .map(|u| u.name().to_owned())
        .collect();
    assert_eq!(names.len(), 13);
    let position = |name: &str| names.iter().position(|n| n.as_str() == name).unwrap();
    for l in 0..4 {
        let list = format!("nslabel-{l}");
        assert!(position(list.as_str()) < position("nested-all"));
        assert!(position(format!("ns-{l}").as_str()) < position(list.as_str()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_of_one_policy_leave_consistent_references() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    let dp = Arc::new(dp);
    let selectors = ["ns-a", "ns-b", "ns-c"];
    let version = |n: usize| {
        NpmNetworkPolicy::new("allow-web")
            .with_selector_sets(vec![IpSetSpec::new(selectors[n % 3], SetType::Namespace)])
            .with_rule_sets(vec![IpSetSpec::new("ns-frontend", SetType::Namespace)])
    };

    let mut handles = Vec::new();
    for n in 0..24usize {
        let dp = Arc::clone(&dp);
        let policy = version(n);
        handles.push(tokio::spawn(async move {
            match n % 3 {
                0 => dp.add_policy(policy).await,
                1 => match dp.update_policy(policy).await {
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                },
                _ => dp.remove_policy("allow-web").await,
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // 캐시된 버전이 가리키는 셋만 정확히 한 번 참조됨
    match dp.get_policy("allow-web") {
        Some(policy) => {
            let selector = policy.pod_selector_ip_sets[0].name.clone();
            for name in selectors {
                let expected = usize::from(name == selector);
                assert_eq!(total_refs(&dp, name), expected, "{name}");
            }
            assert_eq!(total_refs(&dp, "ns-frontend"), 1);
            assert_eq!(dp.ip_set_count(), 2);
        }
        None => assert_eq!(dp.ip_set_count(), 0),
    }

    dp.remove_policy("allow-web").await.unwrap();
    assert_eq!(dp.ip_set_count(), 0);
    assert!(backend.programmed.lock().await.is_empty());
}

#[tokio::test]
async fn windows_policy_resolves_pod_endpoints() {
    let (backend, dp) = dataplane(PlatformKind::Windows);
    *backend.endpoints.lock().await = vec![HostEndpoint {
        name: "web-0-eth0".to_owned(),
        id: "hns-1".to_owned(),
        ip_addresses: vec!["10.0.0.4".parse().unwrap()],
    }];
    dp.initialize_data_plane().await.unwrap();

    dp.add_to_set(&["ns-default"], "10.0.0.4", "default/web-0").unwrap();
    dp.update_pod(&NpmPod::new("default", "web-0", "node-1", "10.0.0.4"))
        .await
        .unwrap();

    let policy = NpmNetworkPolicy::new("allow-web")
        .with_selector_sets(vec![IpSetSpec::new("ns-default", SetType::Namespace)]);
    dp.add_policy(policy).await.unwrap();

    let cached = dp.get_policy("allow-web").unwrap();
    assert_eq!(cached.pod_endpoints.get("default/web-0"), Some(&"hns-1".to_owned()));
    assert!(
        dp.endpoint("default/web-0")
            .unwrap()
            .policy_references
            .contains("allow-web")
    );
}

#[tokio::test]
async fn reset_clears_everything() {
    let (backend, dp) = dataplane(PlatformKind::Linux);
    dp.add_policy(
        NpmNetworkPolicy::new("allow-web")
            .with_selector_sets(vec![IpSetSpec::new("ns-default", SetType::Namespace)]),
    )
    .await
    .unwrap();
    dp.reset_data_plane().await.unwrap();

    assert_eq!(dp.ip_set_count(), 0);
    assert!(!dp.policy_exists("allow-web"));
    assert!(backend.programmed.lock().await.is_empty());
}
