//! Request/response hook chain
//!
//! Hooks are registered once per config epoch and applied in registration
//! order around every outbound fetch. A hook may rewrite the request,
//! short-circuit it with a synthetic response, or cancel the chain.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct HookRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HookResponse {
    /// URL the response was (or would have been) fetched from.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

pub enum RequestAction {
    Continue(HookRequest),
    /// Skip the network entirely and answer with this response.
    ShortCircuit(HookResponse),
    Cancel(String),
}

pub enum ResponseAction {
    Continue(HookResponse),
    Cancel(String),
}

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn on_request(&self, req: HookRequest) -> RequestAction {
        RequestAction::Continue(req)
    }

    fn on_response(&self, resp: HookResponse) -> ResponseAction {
        ResponseAction::Continue(resp)
    }
}

/// Ordered, immutable chain of hooks for one config epoch.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the request side of the chain.
    pub fn apply_request(&self, mut req: HookRequest) -> RequestAction {
        for hook in &self.hooks {
            match hook.on_request(req) {
                RequestAction::Continue(next) => req = next,
                other => return other,
            }
        }
        RequestAction::Continue(req)
    }

    /// Run the response side of the chain.
    pub fn apply_response(&self, mut resp: HookResponse) -> ResponseAction {
        for hook in &self.hooks {
            match hook.on_response(resp) {
                ResponseAction::Continue(next) => resp = next,
                other => return other,
            }
        }
        ResponseAction::Continue(resp)
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Rewrites request hosts according to a fixed map.
pub struct HostRewriteHook {
    mapping: HashMap<String, String>,
}

impl HostRewriteHook {
    pub fn new(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }
}

impl Hook for HostRewriteHook {
    fn name(&self) -> &str {
        "host-rewrite"
    }

    fn on_request(&self, mut req: HookRequest) -> RequestAction {
        if let Ok(mut parsed) = url::Url::parse(&req.url) {
            if let Some(host) = parsed.host_str() {
                if let Some(replacement) = self.mapping.get(host) {
                    if parsed.set_host(Some(replacement)).is_ok() {
                        req.url = parsed.to_string();
                    }
                }
            }
        }
        RequestAction::Continue(req)
    }
}

/// Drops responses whose host matches any configured ad pattern.
pub struct AdBlockHook {
    patterns: Vec<String>,
}

impl AdBlockHook {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| !p.is_empty() && host.contains(p.as_str()))
    }
}

impl Hook for AdBlockHook {
    fn name(&self) -> &str {
        "ad-block"
    }

    fn on_response(&self, resp: HookResponse) -> ResponseAction {
        if let Some(host) = host_of(&resp.url) {
            if self.matches(&host) {
                return ResponseAction::Cancel(format!("blocked ad host: {host}"));
            }
        }
        ResponseAction::Continue(resp)
    }
}

/// Injects a Cookie header for matching hosts.
pub struct CookieInjectHook {
    cookies: HashMap<String, String>,
}

impl CookieInjectHook {
    pub fn new(cookies: HashMap<String, String>) -> Self {
        Self { cookies }
    }
}

impl Hook for CookieInjectHook {
    fn name(&self) -> &str {
        "cookie-inject"
    }

    fn on_request(&self, mut req: HookRequest) -> RequestAction {
        if let Some(host) = host_of(&req.url) {
            if let Some(cookie) = self.cookies.get(&host) {
                req.headers
                    .entry("Cookie".to_string())
                    .or_insert_with(|| cookie.clone());
            }
        }
        RequestAction::Continue(req)
    }
}
