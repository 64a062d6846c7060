use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::{Position, Url};

use crate::config::RenderConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavigationOptions {
    /// Replace the current history entry instead of pushing a new one.
    pub replace: bool,
}

/// Raised by a component during a render to send the client elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationRequest {
    pub location: String,
    pub options: NavigationOptions,
}

impl NavigationRequest {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            options: NavigationOptions::default(),
        }
    }

    pub fn replace(mut self) -> Self {
        self.options.replace = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Same-origin target, sent as a path.
    Location { location: String, replace: bool },
    /// Cross-origin target, sent only as a signed token.
    Protected { token: String },
}

/// Signs redirect targets so a cross-origin address never travels in the
/// clear and cannot be forged by the client.
#[derive(Clone)]
pub struct RedirectProtector {
    keyed: HmacSha256,
}

impl std::fmt::Debug for RedirectProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectProtector").finish_non_exhaustive()
    }
}

impl RedirectProtector {
    pub fn new(key: &[u8]) -> anyhow::Result<Self> {
        let keyed = HmacSha256::new_from_slice(key).context("invalid redirect key")?;
        Ok(Self { keyed })
    }

    /// A key that only lives as long as this process.
    pub fn ephemeral() -> anyhow::Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        Self::new(&hasher.finalize())
    }

    fn mac(&self, message: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(message);
        mac
    }

    /// `base64url(location).base64url(hmac)`
    pub fn protect(&self, location: &str) -> String {
        let tag = self.mac(location.as_bytes()).finalize().into_bytes();
        format!("{}.{}", BASE64.encode(location), BASE64.encode(tag))
    }

    /// The original location, if the token was produced with this key.
    pub fn unprotect(&self, token: &str) -> Option<String> {
        let (payload, signature) = token.split_once('.')?;
        let location = BASE64.decode(payload).ok()?;
        let signature = BASE64.decode(signature).ok()?;
        self.mac(&location).verify_slice(&signature).ok()?;
        String::from_utf8(location).ok()
    }
}

/// Turns navigation requests into redirects relative to the site's origin.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    base: Url,
    protector: RedirectProtector,
}

impl RedirectPolicy {
    pub fn new(base: Url, protector: RedirectProtector) -> Self {
        Self { base, protector }
    }

    pub fn from_config(config: &RenderConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_origin)
            .with_context(|| format!("invalid base origin '{}'", config.base_origin))?;
        let protector = match &config.redirect_key {
            Some(key) => RedirectProtector::new(key.as_bytes())?,
            None => {
                warn!("no redirect key configured; protected redirects will not survive a restart");
                RedirectProtector::ephemeral()?
            }
        };
        Ok(Self::new(base, protector))
    }

    pub fn protector(&self) -> &RedirectProtector {
        &self.protector
    }

    pub fn resolve(&self, request: &NavigationRequest) -> Redirect {
        match self.base.join(&request.location) {
            Ok(target) if target.origin() == self.base.origin() => {
                let location = target[Position::BeforePath..].to_string();
                debug!("same-origin redirect to {}", location);
                Redirect::Location {
                    location,
                    replace: request.options.replace,
                }
            }
            Ok(target) => {
                debug!("cross-origin redirect to {}", target.origin().ascii_serialization());
                Redirect::Protected {
                    token: self.protector.protect(target.as_str()),
                }
            }
            Err(_) => Redirect::Protected {
                token: self.protector.protect(&request.location),
            },
        }
    }
}
