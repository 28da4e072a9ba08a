//! Cookie-jar integration for flash messages
//!
//! The wire codec lives in `envdeploy_core::flash`; this module only wires
//! it up to `axum_extra`'s cookie jar, matching the reference
//! implementation's split between the base64/NUL-separated encoding and
//! the `net/http` cookie plumbing around it.
use axum_extra::extract::cookie::{Cookie, CookieJar};
use envdeploy_core::flash::{self, FlashMessage, FLASH_COOKIE_NAME};
use time::Duration;

/// Reads the flash cookie (if any) and clears it from the jar
///
/// A flash message is meant to be read exactly once; the cookie is
/// expired in the same response that serves the page displaying it.
pub fn take(jar: CookieJar) -> (CookieJar, Vec<FlashMessage>) {
    let Some(cookie) = jar.get(FLASH_COOKIE_NAME) else {
        return (jar, Vec::new());
    };
    let messages = flash::decode(cookie.value()).unwrap_or_default();

    let mut expired = Cookie::new(FLASH_COOKIE_NAME, "");
    expired.set_path("/");
    expired.set_max_age(Duration::seconds(-1));

    (jar.add(expired), messages)
}

/// Sets the flash cookie to carry `messages` across the next request
pub fn set(jar: CookieJar, messages: &[FlashMessage]) -> CookieJar {
    let mut cookie = Cookie::new(FLASH_COOKIE_NAME, flash::encode(messages));
    cookie.set_path("/");
    jar.add(cookie)
}

/// Convenience for the common case of a single message
pub fn set_one(jar: CookieJar, id: &str, arg: impl Into<String>) -> CookieJar {
    set(jar, &[FlashMessage::new(id.to_string(), vec![arg.into()])])
}
