//! The options record consumed from a script's exported `options` value and
//! from `Runner::set_options`. See `spec.md` §6 for the field table this
//! mirrors field-for-field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn de_duration_ms<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms: Option<u64> = Option::deserialize(d)?;
    Ok(ms.map(Duration::from_millis))
}

fn se_duration_ms<S>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match v {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

/// Module dialect accepted by `Bundle::compile`. "Base" wraps a module's
/// source so a top-level `return` is legal (k6's CommonJS-compatible
/// default); "Extended" additionally accepts ES-module syntax but rejects a
/// bare top-level `return` with a `CompileError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityMode {
    Base,
    Extended,
}

impl Default for CompatibilityMode {
    fn default() -> Self {
        CompatibilityMode::Extended
    }
}

/// Which tags are auto-attached to every emitted sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemTags {
    #[serde(default = "default_true")]
    pub vu: bool,
    #[serde(default = "default_true")]
    pub iter: bool,
    #[serde(default = "default_true")]
    pub group: bool,
}

fn default_true() -> bool {
    true
}

/// TLS client-auth material. Kept deliberately small: a cert/key pair per
/// configured host pattern, matching the shape k6's `tlsAuth` option takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsAuth {
    pub domains: Vec<String>,
    pub cert_pem: String,
    pub key_pem: String,
}

/// The full options record. Every field is optional on the wire: a script
/// that declares no `options` export, or one that only sets `vus`, still
/// deserializes cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    // Consumed by the out-of-scope scheduler; the core only stores these.
    pub vus: Option<u32>,
    pub vus_max: Option<u32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_ms",
        serialize_with = "se_duration_ms"
    )]
    pub duration: Option<Duration>,
    pub stages: Vec<Stage>,
    pub iterations: Option<u64>,

    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_ms",
        serialize_with = "se_duration_ms"
    )]
    pub setup_timeout: Option<Duration>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_ms",
        serialize_with = "se_duration_ms"
    )]
    pub teardown_timeout: Option<Duration>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_duration_ms",
        serialize_with = "se_duration_ms"
    )]
    pub min_iteration_duration: Option<Duration>,

    pub rps: Option<u32>,

    pub no_cookies_reset: bool,
    pub no_connection_reuse: bool,
    pub no_vu_connection_reuse: bool,

    pub batch: Option<u32>,
    pub batch_per_host: Option<u32>,

    pub tls_version: Option<String>,
    pub tls_cipher_suites: Vec<String>,
    pub tls_auth: Vec<TlsAuth>,
    pub insecure_skip_tls_verify: bool,

    pub hosts: HashMap<String, String>,
    pub blacklist_ips: Vec<String>,

    pub run_tags: HashMap<String, String>,
    pub system_tags: SystemTags,

    pub console_output: Option<String>,

    pub throw: bool,

    pub compatibility_mode: CompatibilityMode,

    pub summary_trend_stats: Vec<String>,
    pub summary_time_unit: Option<String>,
    pub summary_export: Option<String>,
    pub no_color: bool,
}

/// One entry of a `stages` schedule: ramp to `target` VUs over `duration`.
/// The core only stores these — the out-of-scope scheduler interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    #[serde(
        deserialize_with = "de_duration_ms_required",
        serialize_with = "se_duration_ms_required"
    )]
    pub duration: Duration,
    pub target: u32,
}

fn de_duration_ms_required<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms: u64 = u64::deserialize(d)?;
    Ok(Duration::from_millis(ms))
}

fn se_duration_ms_required<S>(v: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_u64(v.as_millis() as u64)
}

impl Options {
    /// Merge `other` on top of `self`, keeping `self`'s value wherever
    /// `other` leaves a field at its default. Used by `Runner::set_options`
    /// to apply caller overrides onto the options declared in the script.
    pub fn merged_with(mut self, other: Options) -> Self {
        macro_rules! take_some {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take_some!(vus);
        take_some!(vus_max);
        take_some!(duration);
        take_some!(iterations);
        take_some!(setup_timeout);
        take_some!(teardown_timeout);
        take_some!(min_iteration_duration);
        take_some!(rps);
        take_some!(batch);
        take_some!(batch_per_host);
        take_some!(tls_version);
        take_some!(console_output);
        take_some!(summary_time_unit);
        take_some!(summary_export);

        if !other.stages.is_empty() {
            self.stages = other.stages;
        }
        if !other.tls_cipher_suites.is_empty() {
            self.tls_cipher_suites = other.tls_cipher_suites;
        }
        if !other.tls_auth.is_empty() {
            self.tls_auth = other.tls_auth;
        }
        if !other.hosts.is_empty() {
            self.hosts = other.hosts;
        }
        if !other.blacklist_ips.is_empty() {
            self.blacklist_ips = other.blacklist_ips;
        }
        if !other.run_tags.is_empty() {
            self.run_tags = other.run_tags;
        }
        if !other.summary_trend_stats.is_empty() {
            self.summary_trend_stats = other.summary_trend_stats;
        }

        self.no_cookies_reset = other.no_cookies_reset || self.no_cookies_reset;
        self.no_connection_reuse = other.no_connection_reuse || self.no_connection_reuse;
        self.no_vu_connection_reuse = other.no_vu_connection_reuse || self.no_vu_connection_reuse;
        self.insecure_skip_tls_verify =
            other.insecure_skip_tls_verify || self.insecure_skip_tls_verify;
        self.throw = other.throw || self.throw;
        self.no_color = other.no_color || self.no_color;
        self.system_tags = other.system_tags;
        self.compatibility_mode = other.compatibility_mode;

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let opts = Options::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(back.throw, opts.throw);
        assert_eq!(back.compatibility_mode, CompatibilityMode::Extended);
    }

    #[test]
    fn merge_keeps_base_when_override_absent() {
        let base = Options {
            rps: Some(10),
            ..Default::default()
        };
        let merged = base.merged_with(Options::default());
        assert_eq!(merged.rps, Some(10));
    }

    #[test]
    fn merge_overrides_when_present() {
        let base = Options {
            rps: Some(10),
            ..Default::default()
        };
        let over = Options {
            rps: Some(20),
            ..Default::default()
        };
        assert_eq!(base.merged_with(over).rps, Some(20));
    }
}
