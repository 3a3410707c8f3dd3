mod test_support;

use serde_json::json;
use test_support::{bootstrap_user, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn reconcile_fills_gaps_once_and_never_overwrites() {
    let workspace = temp_dir("outrank-reconcile");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let user_id = bootstrap_user(
        &mut stdin,
        &mut reader,
        &workspace,
        "drifter",
        json!({ "schoolCode": "S1" }),
    );

    // The server already knows the school code; the cache only gets to fill
    // the name and level.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "reconcile-1",
        "profile.reconcile",
        json!({
            "userId": user_id,
            "cached": {
                "schoolCode": "STALE",
                "schoolName": "Hill High",
                "level": "10"
            }
        }),
    );
    assert_eq!(
        first.get("adoptedFields"),
        Some(&json!(["schoolName", "level"]))
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "users.get",
        json!({ "userId": user_id }),
    );
    let user = fetched.get("user").expect("user");
    assert_eq!(user.get("schoolCode").and_then(|v| v.as_str()), Some("S1"));
    assert_eq!(
        user.get("schoolName").and_then(|v| v.as_str()),
        Some("Hill High")
    );
    assert_eq!(user.get("level").and_then(|v| v.as_str()), Some("10"));

    // A second pass has nothing left to adopt.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "reconcile-2",
        "profile.reconcile",
        json!({
            "userId": user_id,
            "cached": {
                "schoolCode": "STALE",
                "schoolName": "Other School",
                "level": "12"
            }
        }),
    );
    assert_eq!(second.get("adoptedFields"), Some(&json!([])));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "get-2",
        "users.get",
        json!({ "userId": user_id }),
    );
    let user = fetched.get("user").expect("user");
    assert_eq!(
        user.get("schoolName").and_then(|v| v.as_str()),
        Some("Hill High")
    );
    assert_eq!(user.get("level").and_then(|v| v.as_str()), Some("10"));
}

#[test]
fn reconcile_ignores_blank_cached_values() {
    let workspace = temp_dir("outrank-reconcile-blank");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let user_id = bootstrap_user(&mut stdin, &mut reader, &workspace, "blanky", json!({}));

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "reconcile",
        "profile.reconcile",
        json!({
            "userId": user_id,
            "cached": { "schoolCode": "   ", "level": null }
        }),
    );
    assert_eq!(result.get("adoptedFields"), Some(&json!([])));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "ghost",
        "profile.reconcile",
        json!({ "userId": "nope", "cached": {} }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn settings_round_trip_per_user() {
    let workspace = temp_dir("outrank-settings");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let user_id = bootstrap_user(&mut stdin, &mut reader, &workspace, "tinkerer", json!({}));

    // Nothing stored yet.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "get-empty",
        "settings.get",
        json!({ "userId": user_id }),
    );
    assert!(empty.get("settings").map(|v| v.is_null()).unwrap_or(false));

    let payload = json!({ "theme": "dark", "reminders": true, "goal": 85 });
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "set",
        "settings.set",
        json!({ "userId": user_id, "settings": payload }),
    );
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "settings.get",
        json!({ "userId": user_id }),
    );
    assert_eq!(stored.get("settings"), Some(&payload));

    // Re-setting replaces wholesale.
    let replacement = json!({ "theme": "light" });
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "set-again",
        "settings.set",
        json!({ "userId": user_id, "settings": replacement }),
    );
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "get-again",
        "settings.get",
        json!({ "userId": user_id }),
    );
    assert_eq!(stored.get("settings"), Some(&replacement));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "set-ghost",
        "settings.set",
        json!({ "userId": "nope", "settings": { "a": 1 } }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "set-non-object",
        "settings.set",
        json!({ "userId": user_id, "settings": "dark" }),
    );
    assert_eq!(code, "bad_params");
}
