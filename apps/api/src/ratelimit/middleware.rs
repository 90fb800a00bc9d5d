use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use super::limiter::{IpVerdict, Plan, RateLimiter, Scope};
use crate::errors::AppError;

/// Paths that are never limited.
const EXEMPT_PATHS: &[&str] = &["/health"];

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn user_id_param(request: &Request) -> Option<Uuid> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params.get("user_id")?.parse().ok()
}

fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Per-IP limiting for every route, plus the `api_calls` scope when the
/// request names a user. A failing store lets requests through.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.config().enabled || EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);

    let (limit, remaining, reset_after) = match limiter.check_ip(&ip).await {
        Ok(IpVerdict::Allowed {
            limit,
            remaining,
            reset_after,
        }) => (limit, remaining, reset_after),
        Ok(IpVerdict::Limited { retry_after, .. }) => {
            return AppError::RateLimited {
                message: "Too many requests from this address".to_string(),
                retry_after,
            }
            .into_response();
        }
        Ok(IpVerdict::Blocked { retry_after }) => {
            return AppError::Forbidden(format!(
                "Address temporarily blocked for suspicious activity; retry in {} seconds",
                whole_secs(retry_after)
            ))
            .into_response();
        }
        Err(e) => {
            error!(ip = %ip, error = %e, "Rate limit check failed; allowing request");
            return next.run(request).await;
        }
    };

    if let Some(user_id) = user_id_param(&request) {
        match limiter
            .check_scopes(user_id, Plan::Free, &[Scope::ApiCalls])
            .await
        {
            Ok(decision) if !decision.allowed => {
                return AppError::RateLimited {
                    message: "Hourly API call limit reached for this plan".to_string(),
                    retry_after: decision.retry_after(),
                }
                .into_response();
            }
            Ok(_) => {}
            Err(e) => error!(%user_id, error = %e, "API call limit check failed; allowing request"),
        }
    }

    let mut response = next.run(request).await;
    let reset_at = Utc::now().timestamp() as u64 + whole_secs(reset_after);
    let headers = response.headers_mut();
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(reset_at));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "192.168.1.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_ip(&headers, Some(peer)), "10.1.1.1");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn test_whole_secs_rounds_up() {
        assert_eq!(whole_secs(Duration::from_secs(60)), 60);
        assert_eq!(whole_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(whole_secs(Duration::ZERO), 0);
    }
}
