mod test_support;

use serde_json::json;
use test_support::{bootstrap_user, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn create_join_leave_and_delete_flow() {
    let workspace = temp_dir("outrank-group-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin = bootstrap_user(&mut stdin, &mut reader, &workspace, "admin-ana", json!({}));
    let member = bootstrap_user(&mut stdin, &mut reader, &workspace, "member-max", json!({}));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "groups.create",
        json!({ "userId": admin, "name": "Study Squad" }),
    );
    let group_id = created
        .get("groupId")
        .and_then(|v| v.as_str())
        .expect("groupId")
        .to_string();
    let invite_code = created
        .get("inviteCode")
        .and_then(|v| v.as_str())
        .expect("inviteCode")
        .to_string();
    assert_eq!(invite_code.len(), 8);
    assert_eq!(invite_code, invite_code.to_uppercase());

    // Invite codes are case-insensitive on join.
    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "groups.join",
        json!({ "userId": member, "inviteCode": invite_code.to_lowercase() }),
    );
    assert_eq!(joined.get("groupId").and_then(|v| v.as_str()), Some(group_id.as_str()));
    assert_eq!(joined.get("role").and_then(|v| v.as_str()), Some("member"));
    assert_eq!(
        joined.get("alreadyMember").and_then(|v| v.as_bool()),
        Some(false)
    );

    // A second join is a no-op, not an error.
    let rejoined = request_ok(
        &mut stdin,
        &mut reader,
        "rejoin",
        "groups.join",
        json!({ "userId": member, "inviteCode": invite_code }),
    );
    assert_eq!(
        rejoined.get("alreadyMember").and_then(|v| v.as_bool()),
        Some(true)
    );

    let membership = request_ok(
        &mut stdin,
        &mut reader,
        "is-member",
        "groups.isMember",
        json!({ "userId": member, "groupId": group_id }),
    );
    assert_eq!(
        membership.get("isMember").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(membership.get("role").and_then(|v| v.as_str()), Some("member"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "groups.list",
        json!({ "userId": member }),
    );
    let groups = listed.get("groups").and_then(|v| v.as_array()).expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].get("memberCount").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        groups[0].get("name").and_then(|v| v.as_str()),
        Some("Study Squad")
    );

    // The admin is pinned to the group; only members can walk away.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "admin-leave",
        "groups.leave",
        json!({ "userId": admin, "groupId": group_id }),
    );
    assert_eq!(code, "forbidden");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "member-leave",
        "groups.leave",
        json!({ "userId": member, "groupId": group_id }),
    );
    let membership = request_ok(
        &mut stdin,
        &mut reader,
        "is-member-after",
        "groups.isMember",
        json!({ "userId": member, "groupId": group_id }),
    );
    assert_eq!(
        membership.get("isMember").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Deletion is admin-only.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "member-delete",
        "groups.delete",
        json!({ "userId": member, "groupId": group_id }),
    );
    assert_eq!(code, "forbidden");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "admin-delete",
        "groups.delete",
        json!({ "userId": admin, "groupId": group_id }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "join-deleted",
        "groups.join",
        json!({ "userId": member, "inviteCode": invite_code }),
    );
    assert_eq!(code, "not_found");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list-after-delete",
        "groups.list",
        json!({ "userId": admin }),
    );
    assert_eq!(
        listed.get("groups").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}

#[test]
fn group_creation_validates_inputs() {
    let workspace = temp_dir("outrank-group-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let user = bootstrap_user(&mut stdin, &mut reader, &workspace, "validator", json!({}));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "blank-name",
        "groups.create",
        json!({ "userId": user, "name": "   " }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "ghost-user",
        "groups.create",
        json!({ "userId": "nope", "name": "Phantom" }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "bad-invite",
        "groups.join",
        json!({ "userId": user, "inviteCode": "ZZZZZZZZ" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn deleting_a_user_cascades_through_their_groups() {
    let workspace = temp_dir("outrank-user-cascade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let admin = bootstrap_user(&mut stdin, &mut reader, &workspace, "founder", json!({}));
    let member = bootstrap_user(&mut stdin, &mut reader, &workspace, "joiner", json!({}));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "create",
        "groups.create",
        json!({ "userId": admin, "name": "Doomed Group" }),
    );
    let group_id = created
        .get("groupId")
        .and_then(|v| v.as_str())
        .expect("groupId")
        .to_string();
    let invite_code = created
        .get("inviteCode")
        .and_then(|v| v.as_str())
        .expect("inviteCode")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "groups.join",
        json!({ "userId": member, "inviteCode": invite_code }),
    );

    // Deleting the founder takes the group and its memberships with it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "delete-user",
        "users.delete",
        json!({ "userId": admin }),
    );

    let membership = request_ok(
        &mut stdin,
        &mut reader,
        "orphan-check",
        "groups.isMember",
        json!({ "userId": member, "groupId": group_id }),
    );
    assert_eq!(
        membership.get("isMember").and_then(|v| v.as_bool()),
        Some(false)
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list-after",
        "groups.list",
        json!({ "userId": member }),
    );
    assert_eq!(
        listed.get("groups").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}
