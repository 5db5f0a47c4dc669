//! Per-VU resources that sit alongside the script interpreter: the cookie
//! jar, TLS client-auth material, and the reusable byte-buffer pool.
//!
//! Split out of [`crate::state`] and [`crate::vu`] because both modules need
//! to name these types without owning their construction.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use vu_types::options::TlsAuth;

/// A VU's cookie jar. `spec.md` §4.3 calls for "a fresh [jar] unless
/// `noCookiesReset` is true" at the top of every iteration; wrapping
/// `cookie_store::CookieStore` behind a `Mutex` lets `reqwest` share it
/// across requests within one iteration while still letting `ActiveVU`
/// swap in a fresh store between iterations without rebuilding the whole
/// HTTP client.
#[derive(Clone)]
pub struct CookieJar(Arc<Mutex<cookie_store::CookieStore>>);

impl CookieJar {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(cookie_store::CookieStore::default())))
    }

    /// Replace the jar's contents with an empty store, per
    /// `noCookiesReset = false` (the default).
    pub fn reset(&self) {
        *self.0.lock() = cookie_store::CookieStore::default();
    }

    pub fn inner(&self) -> Arc<Mutex<cookie_store::CookieStore>> {
        self.0.clone()
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &reqwest::header::HeaderValue>, url: &Url) {
        let mut store = self.0.lock();
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                if let Ok(parsed) = cookie_store::Cookie::parse(raw.to_string(), url) {
                    let _ = store.insert(parsed, url);
                }
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<reqwest::header::HeaderValue> {
        let store = self.0.lock();
        let value = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if value.is_empty() {
            None
        } else {
            reqwest::header::HeaderValue::from_str(&value).ok()
        }
    }
}

/// Client-certificate material resolved from `options.tlsAuth`, matched
/// against a request's host/port before being attached to the VU's HTTP
/// client. Kept distinct from `vu_types::options::TlsAuth` because that is
/// the wire/config shape; this is what actually gets loaded into memory.
#[derive(Clone)]
pub struct ResolvedTlsAuth {
    pub domains: Vec<String>,
    /// Concatenated cert+key PEM, validated once at load time. Kept as raw
    /// bytes rather than a built `reqwest::Identity` because `Identity`
    /// isn't `Clone` and each VU needs its own client-bound copy.
    pem: Arc<Vec<u8>>,
}

impl ResolvedTlsAuth {
    pub fn load(auth: &TlsAuth) -> Result<Self, vu_types::RunnerError> {
        let mut pem = Vec::new();
        pem.extend_from_slice(auth.cert_pem.as_bytes());
        pem.push(b'\n');
        pem.extend_from_slice(auth.key_pem.as_bytes());
        // Validate eagerly so a bad cert/key pair fails at VU construction
        // rather than silently at first use.
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| vu_types::RunnerError::Config(format!("invalid tlsAuth certificate/key pair: {e}")))?;
        Ok(Self {
            domains: auth.domains.clone(),
            pem: Arc::new(pem),
        })
    }

    pub fn matches(&self, host: &str) -> bool {
        domain_matches(&self.domains, host)
    }

    pub fn identity(&self) -> Result<reqwest::Identity, vu_types::RunnerError> {
        reqwest::Identity::from_pem(&self.pem)
            .map_err(|e| vu_types::RunnerError::Config(format!("invalid tlsAuth certificate/key pair: {e}")))
    }
}

fn domain_matches(domains: &[String], host: &str) -> bool {
    domains.is_empty()
        || domains
            .iter()
            .any(|d| d == host || (d.starts_with("*.") && host.ends_with(&d[1..])))
}

/// A simple reusable byte-buffer pool backing response-body reads, so a
/// steady-state VU isn't allocating a fresh `Vec<u8>` per HTTP call.
/// `spec.md` §4.3 names this as part of per-iteration `State`; sized
/// generously and reclaimed on drop rather than bounded, since VU count is
/// already the operator's primary memory lever.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    default_capacity: usize,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            default_capacity,
        }
    }

    pub fn take(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.default_capacity))
    }

    pub fn give_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.buffers.lock().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_reuses_released_buffers() {
        let pool = BufferPool::new(64);
        let mut buf = pool.take();
        buf.extend_from_slice(b"hello");
        pool.give_back(buf);
        let reused = pool.take();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 5);
    }

    #[test]
    fn tls_auth_matches_wildcard_domain() {
        let domains = vec!["*.example.com".to_string()];
        assert!(domain_matches(&domains, "api.example.com"));
        assert!(!domain_matches(&domains, "api.other.com"));
    }
}
