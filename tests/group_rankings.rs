mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{bootstrap_user, request_err, request_ok, spawn_sidecar, temp_dir};

fn add_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    user_id: &str,
    subject: &str,
    score: f64,
) {
    let _ = request_ok(
        stdin,
        reader,
        &format!("grade-{}-{}-{}", user_id, subject, score),
        "grades.add",
        json!({
            "userId": user_id,
            "subject": subject,
            "assessmentName": "exam",
            "score": score,
            "maxScore": 100,
            "assessmentDate": "2025-05-01"
        }),
    );
}

struct Fixture {
    group_id: String,
    anna: String,
}

fn build_group(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Fixture {
    let anna = bootstrap_user(stdin, reader, workspace, "anna", json!({}));
    let bill = bootstrap_user(stdin, reader, workspace, "bill", json!({}));
    let cody = bootstrap_user(stdin, reader, workspace, "cody", json!({}));
    let dona = bootstrap_user(stdin, reader, workspace, "dona", json!({}));

    let created = request_ok(
        stdin,
        reader,
        "create",
        "groups.create",
        json!({ "userId": anna, "name": "Rank Club" }),
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
    for (i, user) in [&bill, &cody, &dona].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("join-{}", i),
            "groups.join",
            json!({ "userId": user, "inviteCode": invite_code }),
        );
    }

    // anna 90; bill and cody tie at 75; dona has no grades at all.
    add_grade(stdin, reader, &anna, "Math", 90.0);
    add_grade(stdin, reader, &bill, "Math", 70.0);
    add_grade(stdin, reader, &bill, "Science", 80.0);
    add_grade(stdin, reader, &cody, "Science", 75.0);

    Fixture { group_id, anna }
}

#[test]
fn rankings_share_tied_ranks_and_break_ties_by_nickname() {
    let workspace = temp_dir("outrank-group-rankings");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = build_group(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "rankings",
        "groups.rankings",
        json!({ "groupId": fx.group_id }),
    );
    let rankings = result
        .get("rankings")
        .and_then(|v| v.as_array())
        .expect("rankings");
    // dona has no grades and is excluded.
    assert_eq!(rankings.len(), 3);

    let rows: Vec<(&str, i64, &str, f64)> = rankings
        .iter()
        .map(|r| {
            (
                r.get("nickname").and_then(|v| v.as_str()).unwrap(),
                r.get("rank").and_then(|v| v.as_i64()).unwrap(),
                r.get("ordinal").and_then(|v| v.as_str()).unwrap(),
                r.get("average").and_then(|v| v.as_f64()).unwrap(),
            )
        })
        .collect();
    assert_eq!(
        rows,
        vec![
            ("anna", 1, "1st", 90.0),
            ("bill", 2, "2nd", 75.0),
            ("cody", 2, "2nd", 75.0),
        ]
    );
    assert_eq!(
        rankings[0].get("userId").and_then(|v| v.as_str()),
        Some(fx.anna.as_str())
    );
    assert_eq!(rankings[0].get("role").and_then(|v| v.as_str()), Some("admin"));
}

#[test]
fn subject_rankings_require_a_subject_and_filter_by_it() {
    let workspace = temp_dir("outrank-subject-rankings");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = build_group(&mut stdin, &mut reader, &workspace);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "no-subject",
        "groups.subjectRankings",
        json!({ "groupId": fx.group_id }),
    );
    assert_eq!(code, "bad_params");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "science",
        "groups.subjectRankings",
        json!({ "groupId": fx.group_id, "subject": "Science" }),
    );
    let rankings = result
        .get("rankings")
        .and_then(|v| v.as_array())
        .expect("rankings");
    // anna never took Science, so only bill and cody rank.
    assert_eq!(rankings.len(), 2);
    assert_eq!(
        rankings[0].get("nickname").and_then(|v| v.as_str()),
        Some("bill")
    );
    assert_eq!(rankings[0].get("average").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(rankings[0].get("ordinal").and_then(|v| v.as_str()), Some("1st"));
    assert_eq!(
        rankings[1].get("nickname").and_then(|v| v.as_str()),
        Some("cody")
    );
}

#[test]
fn comprehensive_stats_summarize_the_group() {
    let workspace = temp_dir("outrank-group-stats");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let fx = build_group(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "stats",
        "groups.stats",
        json!({ "groupId": fx.group_id }),
    );
    let stats = result.get("stats").expect("stats");
    assert_eq!(stats.get("memberCount").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(
        stats.get("gradedMemberCount").and_then(|v| v.as_i64()),
        Some(3)
    );
    // Mean of per-member averages [90, 75, 75].
    assert_eq!(stats.get("groupAverage").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(
        stats
            .get("topPerformer")
            .and_then(|p| p.get("nickname"))
            .and_then(|v| v.as_str()),
        Some("anna")
    );

    let subjects = stats
        .get("subjects")
        .and_then(|v| v.as_array())
        .expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0].get("subject").and_then(|v| v.as_str()), Some("Math"));
    assert_eq!(subjects[0].get("average").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(subjects[0].get("gradeCount").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(
        subjects[1].get("subject").and_then(|v| v.as_str()),
        Some("Science")
    );
    assert_eq!(subjects[1].get("average").and_then(|v| v.as_f64()), Some(77.5));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "ghost-group",
        "groups.stats",
        json!({ "groupId": "nope" }),
    );
    assert_eq!(code, "not_found");
}
