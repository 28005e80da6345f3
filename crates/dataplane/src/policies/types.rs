//! 번역된 네트워크 정책 타입

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ipsets::{IpSetSpec, SetKind};

/// 컨트롤러가 번역한 NetworkPolicy
///
/// `pod_selector_ip_sets`는 정책이 적용될 파드를 고르고, `rule_ip_sets`는
/// ingress/egress 규칙의 매칭 조건에 쓰입니다. `pod_endpoints`는
/// 파드 키 → 엔드포인트 ID 매핑이며 엔드포인트를 관리하지 않는 플랫폼에서는 비어 있습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmNetworkPolicy {
    /// 정책 이름 (유일)
    pub name: String,
    /// 셀렉터 셋 (순서 유지)
    #[serde(default)]
    pub pod_selector_ip_sets: Vec<IpSetSpec>,
    /// 규칙 셋 (순서 유지)
    #[serde(default)]
    pub rule_ip_sets: Vec<IpSetSpec>,
    /// 파드 키 → 엔드포인트 ID
    #[serde(default)]
    pub pod_endpoints: BTreeMap<String, String>,
}

impl NpmNetworkPolicy {
    /// 셋이 없는 빈 정책을 생성합니다.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pod_selector_ip_sets: Vec::new(),
            rule_ip_sets: Vec::new(),
            pod_endpoints: BTreeMap::new(),
        }
    }

    /// 셀렉터 셋을 지정합니다.
    pub fn with_selector_sets(mut self, sets: Vec<IpSetSpec>) -> Self {
        self.pod_selector_ip_sets = sets;
        self
    }

    /// 규칙 셋을 지정합니다.
    pub fn with_rule_sets(mut self, sets: Vec<IpSetSpec>) -> Self {
        self.rule_ip_sets = sets;
        self
    }

    /// 엔드포인트 계산에 쓰이는 해시셋 종류의 셀렉터 셋 이름
    pub fn selector_hash_set_names(&self) -> Vec<&str> {
        self.pod_selector_ip_sets
            .iter()
            .filter(|s| s.kind() == Some(SetKind::HashSet))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// 셀렉터 셋 이름 집합
    pub fn selector_set_names(&self) -> BTreeSet<&str> {
        self.pod_selector_ip_sets
            .iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    /// 규칙 셋 이름 집합
    pub fn rule_set_names(&self) -> BTreeSet<&str> {
        self.rule_ip_sets.iter().map(|s| s.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsets::SetType;

    fn sample_policy() -> NpmNetworkPolicy {
        NpmNetworkPolicy::new("allow-web")
            .with_selector_sets(vec![
                IpSetSpec::new("ns-default", SetType::Namespace),
                IpSetSpec::new("podlabel-app:web", SetType::KeyValueLabelOfPod),
                IpSetSpec::new("nestedlabel-tier", SetType::NestedLabelOfPod),
            ])
            .with_rule_sets(vec![IpSetSpec::new("nslabel-team", SetType::KeyLabelOfNamespace)])
    }

    #[test]
    fn selector_hash_sets_skip_lists() {
        let policy = sample_policy();
        assert_eq!(
            policy.selector_hash_set_names(),
            vec!["ns-default", "podlabel-app:web"]
        );
    }

    #[test]
    fn set_name_collections() {
        let policy = sample_policy();
        assert_eq!(policy.selector_set_names().len(), 3);
        assert!(policy.rule_set_names().contains("nslabel-team"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: NpmNetworkPolicy = serde_json::from_str(r#"{"name":"deny-all"}"#).unwrap();
        assert_eq!(policy.name, "deny-all");
        assert!(policy.pod_selector_ip_sets.is_empty());
        assert!(policy.pod_endpoints.is_empty());
    }
}
