//! CNXN banner: `<system-type>:<serial>:<key=value;...>`.
//!
//! Parsing is permissive. Segments that are not exactly `key=value` are
//! skipped, unknown keys are kept in `properties`.

use std::collections::{BTreeMap, BTreeSet};

/// Capability a daemon advertises when it supports byte-counted acks.
pub const FEATURE_DELAYED_ACK: &str = "delayed_ack";

/// Features the client always advertises in its own banner.
pub const HOST_FEATURES: &[&str] = &[
    "shell_v2",
    "cmd",
    "stat_v2",
    "ls_v2",
    "fixed_push_mkdir",
    "apex",
    "abb",
    "fixed_push_symlink_timestamp",
    "abb_exec",
    "remount_shell",
    "track_app",
    "sendrecv_v2",
    "sendrecv_v2_brotli",
    "sendrecv_v2_lz4",
    "sendrecv_v2_zstd",
    "sendrecv_v2_dry_run_send",
];

/// Parsed CNXN banner of the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectBanner {
    pub system_type: String,
    pub serial: String,
    pub properties: BTreeMap<String, String>,
    pub features: BTreeSet<String>,
}

impl ConnectBanner {
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\0');

        let mut banner = ConnectBanner::default();
        let mut pieces = text.splitn(3, ':');
        banner.system_type = pieces.next().unwrap_or_default().to_string();
        banner.serial = pieces.next().unwrap_or_default().to_string();

        if let Some(props) = pieces.next() {
            for segment in props.split(';') {
                let parts: Vec<&str> = segment.split('=').collect();
                if parts.len() != 2 {
                    continue;
                }
                let (key, value) = (parts[0], parts[1]);
                if key == "features" {
                    banner.features.extend(
                        value
                            .split(',')
                            .filter(|f| !f.is_empty())
                            .map(str::to_string),
                    );
                } else {
                    banner.properties.insert(key.to_string(), value.to_string());
                }
            }
        }

        banner
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    /// Banner the client sends in its CNXN.
    pub fn host(delayed_ack: bool) -> String {
        let mut features: Vec<&str> = HOST_FEATURES.to_vec();
        if delayed_ack {
            features.push(FEATURE_DELAYED_ACK);
        }
        format!("host::features={}", features.join(","))
    }
}
