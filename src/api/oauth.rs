//! OAuth 2.0 device authorization flow (limited-input devices).
//!
//! `request_device_code` gets a user code to show; `poll_for_token` then
//! retries the token endpoint until the user approves, the grant is refused,
//! or the time budget runs out. Polling holds its worker thread for up to
//! [`POLL_MAX_SECS`]; the UI never waits on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use super::token::now_epoch;
use crate::error::FetchError;
use crate::model::Token;

const DEVICE_URL: &str = "https://oauth2.googleapis.com/device/code";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/youtube";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Total time budget for one polling session.
pub const POLL_MAX_SECS: u64 = 300;
/// Added to the interval on every `slow_down` answer.
const SLOW_DOWN_ADD_SECS: u64 = 5;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_uri")]
    pub verification_url: String,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

/// What one token-endpoint answer means for the polling loop.
#[derive(Debug, PartialEq)]
pub enum PollOutcome {
    Granted(Token),
    Pending,
    SlowDown,
    Refused(String),
}

/// Interpret a token endpoint response body.
pub fn classify(body: &str, now: u64) -> PollOutcome {
    let resp: TokenResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            debug!("oauth: unparsable token response: {e}");
            return PollOutcome::Pending;
        }
    };
    if let Some(access) = resp.access_token.filter(|a| !a.is_empty()) {
        return PollOutcome::Granted(Token {
            access,
            refresh: resp.refresh_token.unwrap_or_default(),
            expiry_epoch: now.saturating_add(resp.expires_in.unwrap_or(3600)),
        });
    }
    match resp.error.as_deref() {
        Some("slow_down") => PollOutcome::SlowDown,
        Some("authorization_pending") | None => PollOutcome::Pending,
        Some(other) => PollOutcome::Refused(other.to_string()),
    }
}

/// The polling loop proper, with the transport and the sleep injected.
///
/// Transport errors count as "try again". Elapsed time is the sum of the
/// intervals slept, and the loop gives up once it reaches `max_secs`.
/// `sleep` returns false to abandon the session (the client is exiting).
pub fn poll_loop(
    interval: u64,
    max_secs: u64,
    mut attempt: impl FnMut() -> Result<String, FetchError>,
    mut sleep: impl FnMut(Duration) -> bool,
) -> Result<Token, FetchError> {
    let mut interval = interval.max(1);
    let mut elapsed = 0;
    while elapsed < max_secs {
        match attempt() {
            Ok(body) => match classify(&body, now_epoch()) {
                PollOutcome::Granted(tok) => {
                    info!("oauth: authorized after {elapsed}s");
                    return Ok(tok);
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval += SLOW_DOWN_ADD_SECS;
                    debug!("oauth: slow_down, interval now {interval}s");
                }
                PollOutcome::Refused(reason) => return Err(FetchError::Auth(reason)),
            },
            Err(e) => warn!("oauth: poll request failed: {e}"),
        }
        if !sleep(Duration::from_secs(interval)) {
            info!("oauth: polling abandoned after {elapsed}s");
            return Err(FetchError::Auth("cancelled".into()));
        }
        elapsed += interval;
    }
    Err(FetchError::AuthTimeout(max_secs))
}

const SLEEP_STEP: Duration = Duration::from_millis(100);

fn sleep_unless(total: Duration, abort: &AtomicBool) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if abort.load(Ordering::Acquire) {
            return false;
        }
        let step = left.min(SLEEP_STEP);
        thread::sleep(step);
        left -= step;
    }
    !abort.load(Ordering::Acquire)
}

#[derive(Clone, Debug)]
pub struct OAuthClient {
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// POST a form and return the body, whatever the status code.
    fn post_form(url: &str, form: &[(&str, &str)]) -> Result<String, FetchError> {
        let mut resp = ureq::post(url)
            .config()
            .http_status_as_error(false)
            .build()
            .send_form(form.iter().copied())?;
        Ok(resp.body_mut().read_to_string()?)
    }

    pub fn request_device_code(&self) -> Result<DeviceCode, FetchError> {
        let body = Self::post_form(
            DEVICE_URL,
            &[("client_id", self.client_id.as_str()), ("scope", SCOPE)],
        )?;
        let code: DeviceCode = serde_json::from_str(&body)?;
        info!(
            "oauth: device code issued, visit {} and enter {}",
            code.verification_url, code.user_code
        );
        Ok(code)
    }

    /// Poll until granted, refused or timed out. Between attempts it sleeps
    /// in short steps and gives up early once `abort` is set.
    pub fn poll_for_token(&self, code: &DeviceCode, abort: &AtomicBool) -> Result<Token, FetchError> {
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("device_code", code.device_code.as_str()),
            ("grant_type", DEVICE_GRANT),
        ];
        poll_loop(
            code.interval,
            POLL_MAX_SECS,
            || Self::post_form(TOKEN_URL, &form),
            |d| sleep_unless(d, abort),
        )
    }

    /// Exchange the refresh token for a new access token. The refresh token
    /// is kept when the server does not rotate it.
    pub fn refresh(&self, token: &Token) -> Result<Token, FetchError> {
        if token.refresh.is_empty() {
            return Err(FetchError::Auth("no refresh token".into()));
        }
        let body = Self::post_form(
            TOKEN_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", token.refresh.as_str()),
                ("grant_type", "refresh_token"),
            ],
        )?;
        match classify(&body, now_epoch()) {
            PollOutcome::Granted(mut fresh) => {
                if fresh.refresh.is_empty() {
                    fresh.refresh = token.refresh.clone();
                }
                Ok(fresh)
            }
            PollOutcome::Refused(reason) => Err(FetchError::Auth(reason)),
            PollOutcome::Pending | PollOutcome::SlowDown => {
                Err(FetchError::Auth("refresh returned no token".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_responses() {
        let granted = classify(
            r#"{"access_token":"a","refresh_token":"r","expires_in":100}"#,
            1000,
        );
        assert_eq!(
            granted,
            PollOutcome::Granted(Token {
                access: "a".into(),
                refresh: "r".into(),
                expiry_epoch: 1100,
            })
        );
        assert_eq!(
            classify(r#"{"error":"authorization_pending"}"#, 0),
            PollOutcome::Pending
        );
        assert_eq!(classify(r#"{"error":"slow_down"}"#, 0), PollOutcome::SlowDown);
        assert_eq!(
            classify(r#"{"error":"access_denied"}"#, 0),
            PollOutcome::Refused("access_denied".into())
        );
        assert_eq!(classify("<html>", 0), PollOutcome::Pending);
    }

    #[test]
    fn poll_grows_interval_on_slow_down() {
        let mut answers = vec![
            Ok(r#"{"access_token":"tok","expires_in":60}"#.to_string()),
            Ok(r#"{"error":"authorization_pending"}"#.to_string()),
            Err(FetchError::Http("reset".into())),
            Ok(r#"{"error":"slow_down"}"#.to_string()),
        ];
        let mut slept = Vec::new();
        let tok = poll_loop(
            5,
            POLL_MAX_SECS,
            || answers.pop().unwrap(),
            |d| {
                slept.push(d.as_secs());
                true
            },
        )
        .unwrap();
        assert_eq!(tok.access, "tok");
        assert_eq!(slept, vec![10, 10, 10]);
    }

    #[test]
    fn poll_gives_up_after_budget() {
        let mut attempts = 0;
        let mut total = 0;
        let err = poll_loop(
            5,
            20,
            || {
                attempts += 1;
                Ok(r#"{"error":"authorization_pending"}"#.to_string())
            },
            |d| {
                total += d.as_secs();
                true
            },
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::AuthTimeout(20)));
        assert_eq!(attempts, 4);
        assert_eq!(total, 20);
    }

    #[test]
    fn poll_stops_on_refusal() {
        let err = poll_loop(
            1,
            60,
            || Ok(r#"{"error":"expired_token"}"#.to_string()),
            |_| true,
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::Auth(ref r) if r == "expired_token"));
    }

    #[test]
    fn poll_abandoned_when_sleep_refuses() {
        let mut attempts = 0;
        let err = poll_loop(
            5,
            60,
            || {
                attempts += 1;
                Ok(r#"{"error":"authorization_pending"}"#.to_string())
            },
            |_| false,
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::Auth(ref r) if r == "cancelled"));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn abort_flag_cuts_sleep_short() {
        let abort = AtomicBool::new(true);
        let start = std::time::Instant::now();
        assert!(!sleep_unless(Duration::from_secs(30), &abort));
        assert!(start.elapsed() < Duration::from_secs(1));
        abort.store(false, Ordering::Release);
        assert!(sleep_unless(Duration::from_millis(10), &abort));
    }

    #[test]
    fn device_code_accepts_uri_spelling() {
        let code: DeviceCode = serde_json::from_str(
            r#"{"device_code":"d","user_code":"U-1","verification_uri":"https://x/device","expires_in":1800}"#,
        )
        .unwrap();
        assert_eq!(code.verification_url, "https://x/device");
        assert_eq!(code.interval, 5);
    }
}
