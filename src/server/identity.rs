use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::identity::Caller;
use crate::quota::Plan;

pub const USER_HEADER: &str = "x-user-id";
pub const PLAN_HEADER: &str = "x-plan";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Derives the caller of one HTTP request.
///
/// Identity is not verified; whatever the transport supplies is trusted.
/// Tests and alternative deployments can swap in their own resolver.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Caller;
}

/// Reads `X-User-Id`, `X-Plan` and `X-Forwarded-For`.
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentityResolver;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl IdentityResolver for HeaderIdentityResolver {
    fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Caller {
        let user = header(headers, USER_HEADER).unwrap_or("anon");
        // Unknown plans fall back to free.
        let plan = header(headers, PLAN_HEADER)
            .and_then(|raw| raw.parse::<Plan>().ok())
            .unwrap_or_default();
        let origin = header(headers, FORWARDED_FOR_HEADER)
            .and_then(|raw| raw.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "0.0.0.0".to_string());
        Caller::new(user, plan, origin)
    }
}
