// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Digest, SessionType, YesNo};

/// Top-level crate configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Parameters that travel over the wire during login negotiation.
    pub login: LoginConfig,
    /// Runtime knobs that never appear in key=value text: timer
    /// intervals, retry bounds, pool sizes.
    pub runtime: RuntimeConfig,
}

/// Login negotiation settings grouped by logical domain.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoginConfig {
    /// Session identity (SessionType, Initiator, Target).
    pub identity: Identity,
    /// Header/Data digest preferences.
    pub integrity: Integrity,
    /// Data flow limits (MaxRecvDataSegmentLength / burst sizes).
    pub flow: Flow,
    /// Write-side flow control (InitialR2T / ImmediateData).
    pub write_flow: WriteFlow,
    /// Error recovery configuration.
    pub recovery: Recovery,
    /// DefaultTime2Wait / DefaultTime2Retain timers.
    pub timers: Timers,
    /// MaxConnections negotiation cap.
    pub limits: Limits,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "SessionType")]
    pub session_type: SessionType,

    #[serde(rename = "InitiatorName")]
    pub initiator_name: String,

    #[serde(default, rename = "InitiatorAlias")]
    pub initiator_alias: String,

    #[serde(default, rename = "TargetName")]
    /// Required for Normal sessions; ignored during Discovery.
    pub target_name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Integrity {
    #[serde(rename = "HeaderDigest")]
    pub header_digest: Digest,
    #[serde(rename = "DataDigest")]
    pub data_digest: Digest,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Flow {
    #[serde(rename = "MaxRecvDataSegmentLength")]
    /// Effective `max_transfer` for outgoing data segments after
    /// negotiation commits.
    pub max_recv_data_segment_length: u32,
    #[serde(rename = "MaxBurstLength")]
    pub max_burst_length: u32,
    #[serde(rename = "FirstBurstLength")]
    /// Total unsolicited data allowed before the first R2T.
    pub first_burst_length: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WriteFlow {
    #[serde(rename = "InitialR2T")]
    pub initial_r2t: YesNo,
    #[serde(rename = "ImmediateData")]
    /// Whether data may ride inside the command PDU itself.
    pub immediate_data: YesNo,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Recovery {
    #[serde(rename = "ErrorRecoveryLevel")]
    pub error_recovery_level: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Timers {
    #[serde(rename = "DefaultTime2Wait", with = "serde_secs")]
    pub default_time2wait: Duration,
    #[serde(rename = "DefaultTime2Retain", with = "serde_secs")]
    pub default_time2retain: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Limits {
    #[serde(rename = "MaxConnections")]
    pub max_connections: u16,
}

/// Knobs of the send engine itself.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "CommandTimeout", with = "serde_millis")]
    /// Per-CCB command timer interval.
    pub command_timeout: Duration,

    #[serde(rename = "ConnectionTimeout", with = "serde_millis")]
    /// Idle/keepalive probe interval per connection.
    pub connection_timeout: Duration,

    #[serde(rename = "ConnectionIdleTimeout", with = "serde_millis")]
    /// How long a terminated connection slot waits for a recovery login.
    pub connection_idle_timeout: Duration,

    #[serde(rename = "MaxConnTimeouts")]
    /// Unanswered keepalives tolerated before the connection dies.
    pub max_conn_timeouts: u32,

    #[serde(rename = "MaxCcbTimeouts")]
    /// Command timer expiries tolerated per CCB per connection life.
    pub max_ccb_timeouts: u32,

    #[serde(rename = "MaxCcbTries")]
    /// Total transmission attempts tolerated per CCB.
    pub max_ccb_tries: u32,

    #[serde(rename = "CcbsPerSession")]
    pub ccbs_per_session: u16,

    #[serde(rename = "PdusPerConnection")]
    pub pdus_per_connection: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            connection_idle_timeout: Duration::from_secs(60),
            max_conn_timeouts: 4,
            max_ccb_timeouts: 2,
            max_ccb_tries: 4,
            ccbs_per_session: 64,
            pdus_per_connection: 128,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        // Discovery sessions always use MaxConnections=1 and ERL=0.
        if self.login.identity.session_type.is_discovery() {
            self.login.limits.max_connections = 1;
            self.login.recovery.error_recovery_level = 0;
        }

        ensure!(
            !self.login.identity.initiator_name.is_empty(),
            "InitiatorName must not be empty"
        );
        if self.login.identity.session_type.is_normal() {
            ensure!(
                !self.login.identity.target_name.is_empty(),
                "TargetName is required for Normal session"
            );
        }
        ensure!(
            self.login.recovery.error_recovery_level <= 2,
            "ErrorRecoveryLevel must be 0..=2"
        );
        ensure!(
            self.login.limits.max_connections >= 1,
            "MaxConnections must be >= 1"
        );
        ensure!(
            self.login.flow.first_burst_length <= self.login.flow.max_burst_length,
            "FirstBurstLength must not exceed MaxBurstLength"
        );
        ensure!(
            self.runtime.ccbs_per_session >= 1 && self.runtime.pdus_per_connection >= 1,
            "pool sizes must be >= 1"
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Login key generation (Security / Operational)

/// Builds a null-delimited `key=value` list, skipping `None` entries and
/// sorting by key name for a canonical order.
fn build_kv_sorted<'a, I>(items: I) -> Vec<u8>
where I: IntoIterator<Item = (&'a str, Option<String>)> {
    let mut vec: Vec<(String, String)> = items
        .into_iter()
        .filter_map(|(k, v)| v.map(|vv| (k.to_string(), vv)))
        .collect();

    vec.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut out =
        Vec::with_capacity(vec.iter().map(|(k, v)| k.len() + 1 + v.len() + 1).sum());
    for (k, v) in vec {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

/// Security-phase payload: identity keys plus `AuthMethod=None`.
/// Authentication schemes beyond `None` are negotiated by an external
/// assembler implementation.
pub fn login_keys_security(cfg: &Config) -> Vec<u8> {
    let id = &cfg.login.identity;

    build_kv_sorted([
        ("SessionType", Some(id.session_type.to_string())),
        ("InitiatorName", Some(id.initiator_name.clone())),
        (
            "InitiatorAlias",
            (!id.initiator_alias.is_empty()).then(|| id.initiator_alias.clone()),
        ),
        (
            "TargetName",
            (id.session_type.is_normal() && !id.target_name.is_empty())
                .then(|| id.target_name.clone()),
        ),
        ("AuthMethod", Some("None".to_string())),
    ])
}

/// Operational-phase payload. Ordering is canonical (alphabetical).
pub fn login_keys_operational(cfg: &Config) -> Vec<u8> {
    let n = &cfg.login;

    build_kv_sorted([
        ("HeaderDigest", Some(n.integrity.header_digest.to_string())),
        ("DataDigest", Some(n.integrity.data_digest.to_string())),
        (
            "ErrorRecoveryLevel",
            Some(n.recovery.error_recovery_level.to_string()),
        ),
        (
            "FirstBurstLength",
            Some(n.flow.first_burst_length.to_string()),
        ),
        ("MaxBurstLength", Some(n.flow.max_burst_length.to_string())),
        (
            "MaxRecvDataSegmentLength",
            Some(n.flow.max_recv_data_segment_length.to_string()),
        ),
        (
            "ImmediateData",
            Some(n.write_flow.immediate_data.to_string()),
        ),
        ("InitialR2T", Some(n.write_flow.initial_r2t.to_string())),
        (
            "DefaultTime2Retain",
            Some(n.timers.default_time2retain.as_secs().to_string()),
        ),
        (
            "DefaultTime2Wait",
            Some(n.timers.default_time2wait.as_secs().to_string()),
        ),
        ("MaxConnections", Some(n.limits.max_connections.to_string())),
    ])
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as milliseconds; timer
/// intervals need sub-second resolution in tests.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            login: LoginConfig {
                identity: Identity {
                    session_type: SessionType::Normal,
                    initiator_name: "iqn.2004-01.org.example:initiator".into(),
                    initiator_alias: String::new(),
                    target_name: "iqn.2004-01.org.example:target0".into(),
                },
                integrity: Integrity {
                    header_digest: Digest::None,
                    data_digest: Digest::None,
                },
                flow: Flow {
                    max_recv_data_segment_length: 8192,
                    max_burst_length: 262_144,
                    first_burst_length: 65_536,
                },
                write_flow: WriteFlow {
                    initial_r2t: YesNo::No,
                    immediate_data: YesNo::Yes,
                },
                recovery: Recovery {
                    error_recovery_level: 1,
                },
                timers: Timers {
                    default_time2wait: Duration::from_secs(2),
                    default_time2retain: Duration::from_secs(20),
                },
                limits: Limits { max_connections: 2 },
            },
            runtime: RuntimeConfig::default(),
        }
    }

    #[test]
    fn kv_payload_is_sorted_and_null_terminated() {
        let cfg = sample();
        let kv = login_keys_security(&cfg);
        let text = String::from_utf8_lossy(&kv);
        let keys: Vec<&str> = text
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(|kv| kv.split('=').next().expect("key"))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(kv.last(), Some(&0u8));
        assert!(text.contains("AuthMethod=None"));
    }

    #[test]
    fn discovery_forces_single_connection_level0() {
        let mut cfg = sample();
        cfg.login.identity.session_type = SessionType::Discovery;
        cfg.login.limits.max_connections = 4;
        cfg.login.recovery.error_recovery_level = 2;
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.login.limits.max_connections, 1);
        assert_eq!(cfg.login.recovery.error_recovery_level, 0);
    }
}
