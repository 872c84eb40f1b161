//! SFU orchestration configuration

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::MediaKind;

/// Top-level SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Number of media workers to spawn at startup (0 = one per CPU minus
    /// one, minimum one)
    pub num_workers: usize,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Codec set every room's router is created with
    pub media_codecs: Vec<RtpCodec>,
    /// Transport options handed to the engine on every create
    pub transport: TransportConfig,
}

impl SfuConfig {
    /// Resolve the configured worker count, applying the 0 = auto rule.
    #[must_use]
    pub fn effective_num_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cpus.saturating_sub(1).max(1)
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            max_rooms: 0,
            max_peers_per_room: 0,
            media_codecs: default_media_codecs(),
            transport: TransportConfig::default(),
        }
    }
}

/// One codec the routers will negotiate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpCodec {
    pub kind: MediaKind,
    /// e.g. "audio/opus", "video/VP8"
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Codec-specific parameters, passed to the engine untouched
    #[serde(default)]
    pub parameters: serde_json::Value,
}

fn default_media_codecs() -> Vec<RtpCodec> {
    vec![
        RtpCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: json!({}),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: json!({ "x-google-start-bitrate": 1000 }),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: json!({ "profile-id": 2, "x-google-start-bitrate": 1000 }),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000
            }),
        },
    ]
}

/// Options for every transport the engine creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local IP the engine binds media sockets to
    pub listen_ip: String,
    /// Public IP advertised in ICE candidates when behind NAT
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Starting estimate before congestion control kicks in (bps)
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codec_set() {
        let config = SfuConfig::default();
        let mimes: Vec<&str> = config
            .media_codecs
            .iter()
            .map(|c| c.mime_type.as_str())
            .collect();
        assert!(mimes.contains(&"audio/opus"));
        assert!(mimes.contains(&"video/VP8"));
    }

    #[test]
    fn test_effective_num_workers_auto() {
        let config = SfuConfig::default();
        assert!(config.effective_num_workers() >= 1);
    }

    #[test]
    fn test_effective_num_workers_explicit() {
        let config = SfuConfig {
            num_workers: 3,
            ..SfuConfig::default()
        };
        assert_eq!(config.effective_num_workers(), 3);
    }

    #[test]
    fn test_limits_default_unlimited() {
        let config = SfuConfig::default();
        assert_eq!(config.max_rooms, 0);
        assert_eq!(config.max_peers_per_room, 0);
    }
}
