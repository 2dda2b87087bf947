use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub overlay_v4: String,
    pub overlay_v6: String,
    pub dns_domain: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub dns_name: String,
    pub ipv4: String,
    pub ipv6: String,
    pub wg_public_key: String,
    pub endpoints: Vec<String>,
    pub last_seen: i64,
    #[serde(default = "default_true")]
    pub approved: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub dns_name: String,
    pub ipv4: String,
    pub ipv6: String,
    pub wg_public_key: String,
    pub endpoints: Vec<String>,
    pub last_seen: i64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NetMap {
    pub network: NetworkInfo,
    pub node: NodeInfo,
    pub peers: Vec<PeerInfo>,
    pub generated_at: i64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    pub node_name: String,
    pub wg_public_key: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_token: String,
    pub netmap: NetMap,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterUrlRequest {
    pub node_name: String,
    pub wg_public_key: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RegisterUrlResponse {
    pub node_id: String,
    pub ipv4: String,
    pub ipv6: String,
    pub auth_path: String,
    pub node_token: String,
}

fn default_true() -> bool {
    true
}
