//! Sliding-window admission control per client and endpoint category.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;

use crate::config::Settings;
use crate::models::ErrorDetail;

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    Upload,
    Chat,
}

impl EndpointCategory {
    /// Metered category of a request path. Other paths are unmetered.
    pub fn for_path(path: &str) -> Option<Self> {
        match path {
            "/upload" => Some(Self::Upload),
            "/chat" => Some(Self::Chat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Chat => "chat",
        }
    }
}

pub struct RateLimiter {
    upload_limit: usize,
    chat_limit: usize,
    windows: Mutex<HashMap<(String, EndpointCategory), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(upload_limit: usize, chat_limit: usize) -> Self {
        Self {
            upload_limit,
            chat_limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.rate_limit_uploads, settings.rate_limit_chat)
    }

    pub fn limit(&self, category: EndpointCategory) -> usize {
        match category {
            EndpointCategory::Upload => self.upload_limit,
            EndpointCategory::Chat => self.chat_limit,
        }
    }

    pub fn check(&self, client: &str, category: EndpointCategory) -> bool {
        self.check_at(client, category, Instant::now())
    }

    /// Admit and record a request at `now`, or reject it without recording.
    pub fn check_at(&self, client: &str, category: EndpointCategory, now: Instant) -> bool {
        let limit = self.limit(category);
        let key = (client.to_string(), category);
        let mut windows = self.windows.lock();

        let window = windows.entry(key.clone()).or_default();
        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit {
            if window.is_empty() {
                windows.remove(&key);
            }
            return false;
        }
        window.push_back(now);
        true
    }

    /// Requests currently counted against `client` in `category`.
    pub fn in_window(&self, client: &str, category: EndpointCategory) -> usize {
        self.windows
            .lock()
            .get(&(client.to_string(), category))
            .map_or(0, VecDeque::len)
    }
}

/// First `X-Forwarded-For` hop, else the peer address, else `"unknown"`.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    let Some(category) = EndpointCategory::for_path(request.uri().path()) else {
        return next.run(request).await;
    };
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_key(request.headers(), peer);

    if !limiter.check(&client, category) {
        tracing::warn!(client = %client, category = category.as_str(), "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorDetail {
                detail: format!(
                    "Rate limit exceeded. Max {} {} requests per minute.",
                    limiter.limit(category),
                    category.as_str()
                ),
            }),
        )
            .into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_over_the_limit_is_rejected_until_the_window_slides() {
        let limiter = RateLimiter::new(3, 30);
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(limiter.check_at("1.2.3.4", EndpointCategory::Upload, t0 + Duration::from_secs(i)));
        }
        assert!(!limiter.check_at("1.2.3.4", EndpointCategory::Upload, t0 + Duration::from_secs(10)));
        assert_eq!(limiter.in_window("1.2.3.4", EndpointCategory::Upload), 3);

        // the first request ages out exactly 60s later
        assert!(limiter.check_at("1.2.3.4", EndpointCategory::Upload, t0 + WINDOW));
        assert!(!limiter.check_at("1.2.3.4", EndpointCategory::Upload, t0 + WINDOW));
    }

    #[test]
    fn keys_and_categories_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        let now = Instant::now();

        assert!(limiter.check_at("a", EndpointCategory::Upload, now));
        assert!(limiter.check_at("a", EndpointCategory::Chat, now));
        assert!(limiter.check_at("b", EndpointCategory::Upload, now));
        assert!(!limiter.check_at("a", EndpointCategory::Upload, now));
    }

    #[test]
    fn empty_windows_are_dropped() {
        let limiter = RateLimiter::new(0, 30);
        assert!(!limiter.check("a", EndpointCategory::Upload));
        assert!(limiter.windows.lock().is_empty());
    }

    #[test]
    fn unmetered_paths_have_no_category() {
        assert_eq!(EndpointCategory::for_path("/chat"), Some(EndpointCategory::Chat));
        assert_eq!(EndpointCategory::for_path("/health"), None);
    }

    #[test]
    fn client_key_prefers_the_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.1");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.2"));
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.9");
    }
}
