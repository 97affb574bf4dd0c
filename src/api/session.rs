//! Client session identity
//!
//! An opaque random token in a cookie, issued on first contact with a
//! one-year validity hint. It partitions chats per browser; it is looked
//! up, never authenticated.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::response::Response;
use rand::Rng;
use std::convert::Infallible;

pub const SESSION_COOKIE: &str = "empath_session";
const SESSION_MAX_AGE_SECS: u32 = 31_536_000; // one year

/// The requesting client's session token, extracted from the cookie or
/// freshly issued.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    issued: bool,
}

impl Session {
    /// Append the `Set-Cookie` header when this request minted a new token.
    pub fn apply(&self, mut response: Response) -> Response {
        if self.issued {
            let cookie = format!(
                "{SESSION_COOKIE}={}; Max-Age={SESSION_MAX_AGE_SECS}; Path=/; SameSite=Lax; HttpOnly",
                self.token
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
        response
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        let existing = parts
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|header| token_from_cookie_header(header));

        Ok(match existing {
            Some(token) => Session {
                token,
                issued: false,
            },
            None => Session {
                token: generate_token(),
                issued: true,
            },
        })
    }
}

fn token_from_cookie_header(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
    })
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
