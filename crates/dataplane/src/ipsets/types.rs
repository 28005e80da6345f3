//! IPSet 도메인 타입
//!
//! 셋의 용도 태그([`SetType`])는 저장 형태([`SetKind`])를 결정합니다.
//! 해시셋은 IP → 소유 파드 키 매핑을, 리스트셋은 멤버 셋 이름 → [`MemberRef`] 매핑을 가집니다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::DataplaneError;

/// 셋의 용도 태그
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetType {
    /// 용도가 알려지지 않은 셋 (AddToSet 자동 생성 시에만 사용)
    Unknown,
    /// 네임스페이스의 모든 파드
    Namespace,
    /// 네임스페이스 라벨 키
    KeyLabelOfNamespace,
    /// 네임스페이스 라벨 키=값
    KeyValueLabelOfNamespace,
    /// 파드 라벨 키
    KeyLabelOfPod,
    /// 파드 라벨 키=값
    KeyValueLabelOfPod,
    /// 이름 있는 포트
    NamedPorts,
    /// 중첩 파드 라벨 (다중 값 셀렉터)
    NestedLabelOfPod,
    /// CIDR 블록
    CidrBlocks,
}

impl SetType {
    /// 이 타입의 셋이 저장되는 종류를 반환합니다.
    ///
    /// `Unknown`은 어느 종류에도 대응하지 않습니다.
    pub fn kind(self) -> Option<SetKind> {
        match self {
            Self::Namespace
            | Self::KeyLabelOfPod
            | Self::KeyValueLabelOfPod
            | Self::NamedPorts
            | Self::CidrBlocks => Some(SetKind::HashSet),
            Self::KeyLabelOfNamespace | Self::KeyValueLabelOfNamespace | Self::NestedLabelOfPod => {
                Some(SetKind::ListSet)
            }
            Self::Unknown => None,
        }
    }

    /// 문자열 표현
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Namespace => "namespace",
            Self::KeyLabelOfNamespace => "key_label_of_namespace",
            Self::KeyValueLabelOfNamespace => "key_value_label_of_namespace",
            Self::KeyLabelOfPod => "key_label_of_pod",
            Self::KeyValueLabelOfPod => "key_value_label_of_pod",
            Self::NamedPorts => "named_ports",
            Self::NestedLabelOfPod => "nested_label_of_pod",
            Self::CidrBlocks => "cidr_blocks",
        }
    }
}

impl fmt::Display for SetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 셋의 저장 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetKind {
    /// IP 주소를 담는 셋
    HashSet,
    /// 다른 셋을 담는 셋
    ListSet,
}

impl SetKind {
    /// 메트릭 라벨 등에 쓰이는 문자열 표현
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HashSet => "hash",
            Self::ListSet => "list",
        }
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashSet => f.write_str("hash set"),
            Self::ListSet => f.write_str("list set"),
        }
    }
}

/// 정책이 셋을 참조하는 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    /// 정책이 적용될 파드를 고르는 셀렉터
    Selector,
    /// ingress/egress 규칙의 매칭 조건
    NetworkPolicyRule,
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector => f.write_str("selector"),
            Self::NetworkPolicyRule => f.write_str("network policy rule"),
        }
    }
}

/// 리스트셋 멤버에 대한 참조
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef {
    /// 멤버 셋의 종류
    pub kind: SetKind,
    /// 멤버 셋의 용도 태그
    pub set_type: SetType,
}

/// 종류별 멤버 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetMembers {
    /// IP → 소유 파드 키
    Hash(HashMap<Ipv4Addr, String>),
    /// 멤버 셋 이름 → 멤버 참조
    List(BTreeMap<String, MemberRef>),
}

impl SetMembers {
    fn empty(kind: SetKind) -> Self {
        match kind {
            SetKind::HashSet => Self::Hash(HashMap::new()),
            SetKind::ListSet => Self::List(BTreeMap::new()),
        }
    }
}

/// 캐시된 IPSet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSet {
    /// 셋 이름 (종류 내에서 유일)
    pub name: String,
    /// 용도 태그
    pub set_type: SetType,
    /// 멤버 데이터
    pub members: SetMembers,
    /// Selector 참조를 가진 정책 이름
    pub selector_references: BTreeSet<String>,
    /// NetworkPolicyRule 참조를 가진 정책 이름
    pub rule_references: BTreeSet<String>,
    /// 이 셋을 멤버로 가진 리스트 이름
    pub member_of_lists: BTreeSet<String>,
}

impl IpSet {
    /// 용도 태그로부터 종류를 결정하여 빈 셋을 생성합니다.
    ///
    /// # Errors
    ///
    /// `set_type`이 어느 종류에도 대응하지 않으면 `DataplaneError::UnknownKind`
    pub fn new(name: impl Into<String>, set_type: SetType) -> Result<Self, DataplaneError> {
        let name = name.into();
        match set_type.kind() {
            Some(kind) => Ok(Self::with_kind(name, set_type, kind)),
            None => Err(DataplaneError::UnknownKind { name, set_type }),
        }
    }

    /// 종류를 명시하여 빈 셋을 생성합니다.
    pub(crate) fn with_kind(name: String, set_type: SetType, kind: SetKind) -> Self {
        Self {
            name,
            set_type,
            members: SetMembers::empty(kind),
            selector_references: BTreeSet::new(),
            rule_references: BTreeSet::new(),
            member_of_lists: BTreeSet::new(),
        }
    }

    /// 저장 종류
    pub fn kind(&self) -> SetKind {
        match self.members {
            SetMembers::Hash(_) => SetKind::HashSet,
            SetMembers::List(_) => SetKind::ListSet,
        }
    }

    /// 멤버 수 (IP 또는 멤버 셋)
    pub fn member_count(&self) -> usize {
        match &self.members {
            SetMembers::Hash(ips) => ips.len(),
            SetMembers::List(sets) => sets.len(),
        }
    }

    /// 해시셋의 IP 소유자를 조회합니다.
    pub fn owner_of(&self, ip: Ipv4Addr) -> Option<&str> {
        match &self.members {
            SetMembers::Hash(ips) => ips.get(&ip).map(String::as_str),
            SetMembers::List(_) => None,
        }
    }

    /// 리스트셋이 주어진 멤버를 가지고 있는지 확인합니다.
    pub fn has_member_set(&self, name: &str) -> bool {
        match &self.members {
            SetMembers::List(sets) => sets.contains_key(name),
            SetMembers::Hash(_) => false,
        }
    }

    /// 리스트셋이 멤버로 다른 리스트셋을 가지고 있는지 확인합니다.
    pub fn has_nested_lists(&self) -> bool {
        match &self.members {
            SetMembers::List(sets) => sets.values().any(|m| m.kind == SetKind::ListSet),
            SetMembers::Hash(_) => false,
        }
    }

    pub(crate) fn hash_members_mut(&mut self) -> Option<&mut HashMap<Ipv4Addr, String>> {
        match &mut self.members {
            SetMembers::Hash(ips) => Some(ips),
            SetMembers::List(_) => None,
        }
    }

    pub(crate) fn list_members_mut(&mut self) -> Option<&mut BTreeMap<String, MemberRef>> {
        match &mut self.members {
            SetMembers::List(sets) => Some(sets),
            SetMembers::Hash(_) => None,
        }
    }

    /// 정책 참조를 추가합니다. 이미 있으면 아무것도 하지 않습니다.
    pub fn add_reference(&mut self, policy: &str, ref_type: ReferenceType) {
        self.references_mut(ref_type).insert(policy.to_owned());
    }

    /// 정책 참조를 제거합니다. 없으면 아무것도 하지 않습니다.
    pub fn delete_reference(&mut self, policy: &str, ref_type: ReferenceType) {
        self.references_mut(ref_type).remove(policy);
    }

    /// 주어진 종류의 참조 수
    pub fn reference_count(&self, ref_type: ReferenceType) -> usize {
        match ref_type {
            ReferenceType::Selector => self.selector_references.len(),
            ReferenceType::NetworkPolicyRule => self.rule_references.len(),
        }
    }

    /// 정책 참조가 하나라도 있는지 확인합니다.
    pub fn is_referenced(&self) -> bool {
        !self.selector_references.is_empty() || !self.rule_references.is_empty()
    }

    /// 정책 참조도 없고 어느 리스트의 멤버도 아니면 삭제할 수 있습니다.
    pub fn can_be_deleted(&self) -> bool {
        !self.is_referenced() && self.member_of_lists.is_empty()
    }

    fn references_mut(&mut self, ref_type: ReferenceType) -> &mut BTreeSet<String> {
        match ref_type {
            ReferenceType::Selector => &mut self.selector_references,
            ReferenceType::NetworkPolicyRule => &mut self.rule_references,
        }
    }
}

/// 정책 쪽에서 기술하는 셋
///
/// 컨트롤러가 번역한 결과이며, 리스트셋은 이미 해석된 멤버 셋을 가질 수 있습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSetSpec {
    /// 셋 이름
    pub name: String,
    /// 용도 태그
    pub set_type: SetType,
    /// 리스트셋에 넣을 멤버 셋
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_sets: Vec<IpSetSpec>,
}

impl IpSetSpec {
    /// 멤버 없는 셋 기술을 생성합니다.
    pub fn new(name: impl Into<String>, set_type: SetType) -> Self {
        Self {
            name: name.into(),
            set_type,
            member_sets: Vec::new(),
        }
    }

    /// 멤버 셋을 지정합니다.
    pub fn with_members(mut self, member_sets: Vec<IpSetSpec>) -> Self {
        self.member_sets = member_sets;
        self
    }

    /// 용도 태그가 가리키는 종류
    pub fn kind(&self) -> Option<SetKind> {
        self.set_type.kind()
    }

    /// 리스트셋이면서 멤버를 가지고 있는지 확인합니다.
    pub fn has_list_members(&self) -> bool {
        self.kind() == Some(SetKind::ListSet) && !self.member_sets.is_empty()
    }

    /// 멤버 셋 이름 목록
    pub fn member_names(&self) -> Vec<&str> {
        self.member_sets.iter().map(|m| m.name.as_str()).collect()
    }
}
