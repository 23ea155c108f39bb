//! ICE server configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    /// Multiple URLs allow fallback between UDP and TCP transports
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Build the ICE server list for a peer connection.
///
/// No servers yields host candidates only, which is enough when the relay
/// is directly reachable.
pub fn ice_servers(stun_servers: &[String], turn_servers: &[TurnServer]) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    for url in stun_servers.iter().filter(|u| !u.is_empty()) {
        servers.push(RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        });
    }

    for turn in turn_servers {
        let urls: Vec<String> = turn.urls.iter().filter(|u| !u.is_empty()).cloned().collect();
        if urls.is_empty() {
            continue;
        }
        servers.push(RTCIceServer {
            urls,
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_skip_empty_urls() {
        let stun = vec!["stun:stun.example.com:3478".to_string(), String::new()];
        let turn = vec![
            TurnServer::new(
                "turn:turn.example.com:3478".to_string(),
                "user".to_string(),
                "secret".to_string(),
            ),
            TurnServer {
                urls: vec![String::new()],
                username: "nobody".to_string(),
                credential: String::new(),
            },
        ];

        let servers = ice_servers(&stun, &turn);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn test_no_servers_means_host_only() {
        assert!(ice_servers(&[], &[]).is_empty());
    }
}
