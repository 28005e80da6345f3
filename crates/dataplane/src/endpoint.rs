//! 파드와 호스트 엔드포인트 레코드
//!
//! 백엔드가 보고하는 [`HostEndpoint`]는 오케스트레이터의 엔드포인트 캐시에
//! 파드 키 단위의 [`NpmEndpoint`]로 저장됩니다.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// 컨트롤러가 전달하는 파드 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpmPod {
    /// 네임스페이스
    pub namespace: String,
    /// 파드 이름
    pub name: String,
    /// 파드가 스케줄된 노드
    pub node_name: String,
    /// 파드 IP (비어 있으면 아직 할당 전)
    pub pod_ip: String,
}

impl NpmPod {
    /// 파드 정보를 생성합니다.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        node_name: impl Into<String>,
        pod_ip: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            node_name: node_name.into(),
            pod_ip: pod_ip.into(),
        }
    }

    /// IP 소유권 판정에 쓰이는 `namespace/name` 키
    pub fn pod_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// 백엔드가 보고하는 네트워크 엔드포인트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    /// 엔드포인트 이름
    pub name: String,
    /// 엔드포인트 ID
    pub id: String,
    /// 엔드포인트에 할당된 주소
    pub ip_addresses: Vec<IpAddr>,
}

impl HostEndpoint {
    /// 주어진 IPv4 주소를 가지고 있는지 확인합니다.
    pub fn has_ip(&self, ip: Ipv4Addr) -> bool {
        self.ip_addresses.contains(&IpAddr::V4(ip))
    }
}

/// 오케스트레이터가 캐시하는 파드 엔드포인트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmEndpoint {
    /// 엔드포인트 이름
    pub name: String,
    /// 엔드포인트 ID
    pub id: String,
    /// 캐시 시점의 파드 IP
    pub ip: Ipv4Addr,
    /// 이 엔드포인트에 적용 중인 정책 이름
    pub policy_references: BTreeSet<String>,
}

impl NpmEndpoint {
    /// 백엔드 엔드포인트로부터 캐시 엔트리를 만듭니다. 정책 참조는 비어 있습니다.
    pub fn from_host(endpoint: &HostEndpoint, ip: Ipv4Addr) -> Self {
        Self {
            name: endpoint.name.clone(),
            id: endpoint.id.clone(),
            ip,
            policy_references: BTreeSet::new(),
        }
    }
}
