use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_reportcardd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reportcardd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    school_id: &str,
    class_id: &str,
    first: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "schoolId": school_id, "classId": class_id, "firstName": first, "lastName": "Test" }),
    );
    str_field(&res, "studentId")
}

#[test]
fn one_school_cannot_reach_another_schools_records() {
    let workspace = temp_dir("reportcardd-tenancy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let hill = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "schools.create", json!({ "name": "Hillcrest" })),
        "schoolId",
    );
    let river = str_field(
        &request_ok(&mut stdin, &mut reader, "3", "schools.create", json!({ "name": "Riverside" })),
        "schoolId",
    );
    let class_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "classes.create",
            json!({ "schoolId": hill, "name": "JSS 1A" }),
        ),
        "classId",
    );
    // Class names are unique per school, not globally.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolId": river, "name": "JSS 1A" }),
    );
    let student = add_student(&mut stdin, &mut reader, "6", &hill, &class_id, "Ade");
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.upsert",
        json!({
            "schoolId": hill, "studentId": student, "session": "2024/2025", "term": "First",
            "scores": [{ "subject": "Mathematics", "ca1": 10, "ca2": 10, "exam": 50 }]
        }),
    );
    let report_id = str_field(&report, "reportId");
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.get",
        json!({ "schoolId": hill, "reportId": report_id }),
    );
    let score_id = got["report"]["scores"][0]["id"]
        .as_str()
        .expect("score id")
        .to_string();

    let cross: Vec<(&str, serde_json::Value)> = vec![
        ("reports.get", json!({ "schoolId": river, "reportId": report_id })),
        ("reports.delete", json!({ "schoolId": river, "reportId": report_id })),
        (
            "reports.promote",
            json!({ "schoolId": river, "reportId": report_id, "promoted": true }),
        ),
        (
            "reports.upsert",
            json!({ "schoolId": river, "studentId": student, "session": "2024/2025", "term": "First" }),
        ),
        (
            "reports.broadsheet",
            json!({ "schoolId": river, "classId": class_id, "session": "2024/2025", "term": "First" }),
        ),
        (
            "scores.upsert",
            json!({ "schoolId": river, "reportId": report_id, "subject": "Mathematics", "exam": 1 }),
        ),
        ("scores.delete", json!({ "schoolId": river, "scoreId": score_id })),
        ("classes.get", json!({ "schoolId": river, "classId": class_id })),
        ("students.delete", json!({ "schoolId": river, "studentId": student })),
        (
            "students.create",
            json!({ "schoolId": river, "classId": class_id, "firstName": "X", "lastName": "Y" }),
        ),
    ];
    for (i, (method, params)) in cross.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("cross-{}", i), method, params);
        assert_eq!(error_code(&resp), Some("not_found"), "{} leaked: {}", method, resp);
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.list",
        json!({ "schoolId": river }),
    );
    assert_eq!(listed["reports"], json!([]));
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "schoolId": river }),
    );
    assert_eq!(students["students"], json!([]));

    // Nothing of Hillcrest's was touched.
    let still = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.get",
        json!({ "schoolId": hill, "reportId": report_id }),
    );
    assert_eq!(still["report"]["totalScore"].as_f64(), Some(70.0));
    assert_eq!(still["report"]["isPromoted"], json!(false));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "12",
        "reports.list",
        json!({ "schoolId": "no-such-school" }),
    );
    assert_eq!(error_code(&unknown), Some("not_found"));
    let absent = request(&mut stdin, &mut reader, "13", "classes.list", json!({}));
    assert_eq!(error_code(&absent), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
