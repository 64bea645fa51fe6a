use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use tokio::time::Duration;

use super::{ClipUpload, PublishReceipt, RecentItem, RemotePublishClient};
use crate::classifier::RawSignal;
use crate::errors::AppResult;
use crate::session::{AuthenticatedSession, LoginReply, RemoteAuthClient, SessionBlob};

const SESSION_HEADER: &str = "x-session";

/// HTTP client for the local bridge process that wraps the platform's
/// private API. Implements both remote capabilities.
pub struct BridgeClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    session: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    session: Option<String>,
    #[serde(default)]
    two_factor_required: bool,
}

#[derive(Debug, Deserialize)]
struct ClipBody {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentBody {
    items: Vec<RecentItemBody>,
}

#[derive(Debug, Deserialize)]
struct RecentItemBody {
    code: String,
    taken_at: Option<DateTime<Utc>>,
}

impl BridgeClient {
    pub fn new(base_url: &str, call_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(call_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode its JSON body.
    ///
    /// `dispatch_sensitive` marks calls with remote side effects: server
    /// errors, timeouts and unparsable success bodies are then reported as
    /// possibly dispatched.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
        dispatch_sensitive: bool,
    ) -> Result<T, RawSignal> {
        let response = request
            .send()
            .await
            .map_err(|e| signal_from_transport(&e, what, dispatch_sensitive))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| signal_from_transport(&e, what, dispatch_sensitive))?;

        if !status.is_success() {
            return Err(signal_for_status(status, &body, dispatch_sensitive));
        }

        decode_body(&body, what, dispatch_sensitive)
    }

    async fn send_empty(&self, request: RequestBuilder, what: &str) -> Result<(), RawSignal> {
        let response = request
            .send()
            .await
            .map_err(|e| signal_from_transport(&e, what, false))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(signal_for_status(status, &body, false))
    }
}

#[async_trait]
impl RemoteAuthClient for BridgeClient {
    async fn verify(&self, session: &SessionBlob) -> Result<(), RawSignal> {
        let request = self
            .client
            .post(self.url("/auth/verify"))
            .header(SESSION_HEADER, encode_session(session));
        self.send_empty(request, "session verification").await
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginReply, RawSignal> {
        let request = self
            .client
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({ "username": username, "password": password }));
        let body: LoginBody = self.send(request, "password login", false).await?;

        match (body.session, body.two_factor_required) {
            (_, true) => Ok(LoginReply::SecondFactorRequired),
            (Some(session), false) => Ok(LoginReply::Session(decode_session(&session)?)),
            (None, false) => Err(RawSignal::new("login response carried no session")),
        }
    }

    async fn login_with_token(&self, token: &str) -> Result<SessionBlob, RawSignal> {
        let request = self
            .client
            .post(self.url("/auth/login/session-id"))
            .json(&serde_json::json!({ "session_id": token }));
        let body: SessionBody = self.send(request, "session token login", false).await?;
        decode_session(&body.session)
    }

    async fn submit_second_factor(
        &self,
        username: &str,
        code: &str,
    ) -> Result<SessionBlob, RawSignal> {
        let request = self
            .client
            .post(self.url("/auth/two-factor"))
            .json(&serde_json::json!({ "username": username, "code": code }));
        let body: SessionBody = self.send(request, "second factor", false).await?;
        decode_session(&body.session)
    }
}

#[async_trait]
impl RemotePublishClient for BridgeClient {
    async fn publish(
        &self,
        session: &AuthenticatedSession,
        clip: &ClipUpload,
    ) -> Result<PublishReceipt, RawSignal> {
        let form = build_clip_form(clip).await?;
        let request = self
            .client
            .post(self.url("/clips"))
            .header(SESSION_HEADER, encode_session(&session.blob))
            .multipart(form);

        log::debug!("Uploading {} to bridge", clip.video.display());
        let body: ClipBody = self.send(request, "clip upload", true).await?;
        Ok(PublishReceipt {
            identifier: body.code.filter(|c| !c.is_empty()),
        })
    }

    async fn recent_items(
        &self,
        session: &AuthenticatedSession,
        account: &str,
        limit: usize,
    ) -> Result<Vec<RecentItem>, RawSignal> {
        let request = self
            .client
            .get(self.url(&format!("/accounts/{}/recent", account)))
            .query(&[("limit", limit)])
            .header(SESSION_HEADER, encode_session(&session.blob));
        let body: RecentBody = self.send(request, "recent items", false).await?;
        Ok(body
            .items
            .into_iter()
            .map(|item| RecentItem {
                identifier: item.code,
                published_at: item.taken_at,
            })
            .collect())
    }
}

fn encode_session(blob: &SessionBlob) -> String {
    STANDARD.encode(blob.as_bytes())
}

fn decode_session(encoded: &str) -> Result<SessionBlob, RawSignal> {
    STANDARD
        .decode(encoded.trim())
        .map(SessionBlob::new)
        .map_err(|e| RawSignal::new(format!("session payload is not base64: {}", e)))
}

fn decode_body<T: DeserializeOwned>(
    body: &str,
    what: &str,
    dispatch_sensitive: bool,
) -> Result<T, RawSignal> {
    serde_json::from_str(body).map_err(|e| {
        log::debug!(
            "Unparsable {} response (first 300 chars): {}",
            what,
            body.chars().take(300).collect::<String>()
        );
        RawSignal {
            message: format!("failed to parse {} response: {}", what, e),
            code: None,
            dispatched: dispatch_sensitive,
        }
    })
}

fn signal_for_status(status: StatusCode, body: &str, dispatch_sensitive: bool) -> RawSignal {
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("empty error response")
            .to_string()
    } else {
        body.trim().to_string()
    };
    RawSignal {
        message,
        code: Some(status.as_u16()),
        dispatched: dispatch_sensitive && status.is_server_error(),
    }
}

fn signal_from_transport(e: &reqwest::Error, what: &str, dispatch_sensitive: bool) -> RawSignal {
    if e.is_connect() {
        return RawSignal::new(format!("{}: connection failed: {}", what, e));
    }
    let message = if e.is_timeout() {
        format!("{} timed out: {}", what, e)
    } else {
        format!("{}: connection closed: {}", what, e)
    };
    RawSignal {
        message,
        code: None,
        dispatched: dispatch_sensitive,
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

async fn file_part(path: &Path) -> Result<multipart::Part, RawSignal> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| RawSignal::new(format!("cannot read {}: {}", path.display(), e)))?;
    let filename = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    multipart::Part::bytes(data)
        .file_name(filename)
        .mime_str(mime_for(path))
        .map_err(|e| RawSignal::new(format!("invalid mime type: {}", e)))
}

async fn build_clip_form(clip: &ClipUpload) -> Result<multipart::Form, RawSignal> {
    let mut form = multipart::Form::new()
        .text("caption", clip.caption.clone())
        .part("video", file_part(&clip.video).await?);

    if let Some(cover) = &clip.cover {
        match file_part(cover).await {
            Ok(part) => form = form.part("thumbnail", part),
            // The remote picks its own cover when none is sent.
            Err(signal) => log::warn!("Skipping cover: {}", signal),
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, ErrorCategory};

    #[test]
    fn session_blobs_survive_transport_encoding() {
        let blob = SessionBlob::new(vec![0, 159, 146, 150, b'{', b'}']);
        assert_eq!(decode_session(&encode_session(&blob)).unwrap(), blob);
        assert!(decode_session("not base64!").is_err());
    }

    #[test]
    fn unparsable_clip_response_is_ambiguous() {
        let signal = decode_body::<ClipBody>("<html>oops</html>", "clip upload", true).unwrap_err();
        assert!(signal.dispatched);
        assert_eq!(classify(&signal), ErrorCategory::AmbiguousSuccess);

        let signal = decode_body::<SessionBody>("{}", "password login", false).unwrap_err();
        assert!(!signal.dispatched);
        assert_ne!(classify(&signal), ErrorCategory::AmbiguousSuccess);
    }

    #[test]
    fn status_errors_keep_body_and_code() {
        let signal = signal_for_status(
            StatusCode::BAD_REQUEST,
            "{\"message\":\"challenge_required\"}",
            true,
        );
        assert_eq!(signal.code, Some(400));
        assert!(!signal.dispatched);
        assert_eq!(classify(&signal), ErrorCategory::ChallengeRequired);

        let signal = signal_for_status(StatusCode::BAD_GATEWAY, "", true);
        assert!(signal.dispatched);
        assert_eq!(signal.message, "Bad Gateway");
        assert_eq!(classify(&signal), ErrorCategory::TransientNetwork);

        let signal = signal_for_status(StatusCode::TOO_MANY_REQUESTS, "slow down", false);
        assert_eq!(classify(&signal), ErrorCategory::RateLimited);
    }

    #[test]
    fn recent_items_decode_with_and_without_timestamps() {
        let body: RecentBody = decode_body(
            r#"{"items":[{"code":"ABC123","taken_at":"2026-10-16T09:00:00Z"},{"code":"OLD","taken_at":null}]}"#,
            "recent items",
            false,
        )
        .unwrap();
        assert_eq!(body.items.len(), 2);
        assert_eq!(body.items[0].code, "ABC123");
        assert!(body.items[0].taken_at.is_some());
        assert!(body.items[1].taken_at.is_none());
    }

    #[test]
    fn mime_types_follow_extensions() {
        assert_eq!(mime_for(Path::new("clip.MP4")), "video/mp4");
        assert_eq!(mime_for(Path::new("clip.mov")), "video/quicktime");
        assert_eq!(mime_for(Path::new("thumbnail.jpg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn missing_video_fails_before_dispatch() {
        let clip = ClipUpload {
            video: "/definitely/not/here.mp4".into(),
            caption: String::new(),
            cover: None,
        };
        let signal = build_clip_form(&clip).await.unwrap_err();
        assert!(!signal.dispatched);
        assert_eq!(classify(&signal), ErrorCategory::Fatal);
    }
}
