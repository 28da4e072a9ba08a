//! Cross-module round trip: the server-side cookie wiring on top of the
//! core codec.
use axum_extra::extract::cookie::CookieJar;
use envdeploy_core::flash::FlashMessage;
use envdeploy_server::flash;

#[test]
fn set_then_take_recovers_the_same_messages() {
    let jar = CookieJar::new();

    let jar = flash::set(
        jar,
        &[
            FlashMessage::new("success", vec!["job started".to_string()]),
            FlashMessage::new("error", vec!["job with the ID already exists".to_string()]),
        ],
    );

    let (jar, messages) = flash::take(jar);
    assert_eq!(
        messages,
        vec![
            FlashMessage::new("success", vec!["job started".to_string()]),
            FlashMessage::new("error", vec!["job with the ID already exists".to_string()]),
        ]
    );

    // A flash message is read exactly once: the cookie is expired in the
    // same jar that served it.
    let (_, messages_again) = flash::take(jar);
    assert!(messages_again.is_empty());
}

#[test]
fn set_one_is_a_single_message_shorthand() {
    let jar = CookieJar::new();
    let jar = flash::set_one(jar, "error", "job not finished");
    let (_, messages) = flash::take(jar);
    assert_eq!(messages, vec![FlashMessage::new("error", vec!["job not finished".to_string()])]);
}

#[test]
fn missing_cookie_yields_no_messages() {
    let jar = CookieJar::new();
    let (_, messages) = flash::take(jar);
    assert!(messages.is_empty());
}
