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
fn broadsheet_pivots_scores_by_current_class() {
    let workspace = temp_dir("reportcardd-broadsheet");
    let csv_out = workspace.join("exports").join("jss1a.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(&mut stdin, &mut reader, "2", "schools.create", json!({ "name": "Hillcrest" }));
    let school_id = str_field(&school, "schoolId");
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "schoolId": school_id, "name": "JSS 1A" }),
    );
    let class_id = str_field(&class, "classId");
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "schoolId": school_id, "name": "JSS 1B" }),
    );
    let other_id = str_field(&other, "classId");

    let zara = add_student(&mut stdin, &mut reader, "5", &school_id, &class_id, "Zara");
    let ade = add_student(&mut stdin, &mut reader, "6", &school_id, &class_id, "Ade");
    let musa = add_student(&mut stdin, &mut reader, "7", &school_id, &class_id, "Musa");

    for (i, (student, scores)) in [
        (
            &zara,
            json!([
                { "subject": "Mathematics", "ca1": 10, "ca2": 10, "exam": 60 },
                { "subject": "English", "ca1": 10, "ca2": 10, "exam": 50 }
            ]),
        ),
        (
            &ade,
            json!([
                { "subject": "Mathematics", "ca1": 10, "ca2": 10, "exam": 70 },
                { "subject": "English", "ca1": 10, "ca2": 10, "exam": 40 }
            ]),
        ),
        (
            &musa,
            json!([{ "subject": "Biology", "ca1": 10, "ca2": 10, "exam": 20 }]),
        ),
    ]
    .into_iter()
    .enumerate()
    {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("upsert-{}", i),
            "reports.upsert",
            json!({
                "schoolId": school_id, "studentId": student,
                "session": "2024/2025", "term": "First", "scores": scores
            }),
        );
    }

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.broadsheet",
        json!({ "schoolId": school_id, "classId": class_id, "session": "2024/2025", "term": "First" }),
    );
    assert_eq!(sheet["subjects"], json!(["Biology", "English", "Mathematics"]));
    assert_eq!(sheet["classId"], json!(class_id));
    let rows = sheet["students"].as_array().expect("students");
    let names: Vec<&str> = rows
        .iter()
        .map(|r| r["studentName"].as_str().expect("studentName"))
        .collect();
    assert_eq!(names, ["Ade Test", "Musa Test", "Zara Test"]);
    // Ade and Zara tie on 150; positions are plain order, not shared.
    let positions: Vec<i64> = rows
        .iter()
        .map(|r| r["position"].as_i64().expect("position"))
        .collect();
    assert_eq!(positions, [1, 3, 2]);
    assert_eq!(rows[0]["grandTotal"].as_f64(), Some(150.0));
    assert_eq!(rows[0]["subjects"]["Mathematics"]["caTotal"].as_f64(), Some(20.0));
    assert_eq!(rows[0]["subjects"]["Mathematics"]["exam"].as_f64(), Some(70.0));
    assert_eq!(rows[0]["subjects"]["Mathematics"]["grade"], json!("A"));
    assert!(rows[1]["subjects"].get("Mathematics").is_none());

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.broadsheetExport",
        json!({
            "schoolId": school_id, "classId": class_id, "session": "2024/2025", "term": "First",
            "outPath": csv_out.to_string_lossy()
        }),
    );
    assert_eq!(exported["rowsExported"].as_i64(), Some(3));
    let text = std::fs::read_to_string(&csv_out).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "studentNo,studentName,Biology,English,Mathematics,grandTotal,position",
            ",Ade Test,,60,90,150,1",
            ",Musa Test,40,,,40,3",
            ",Zara Test,,70,80,150,2",
        ]
    );

    // Moving a student changes which broadsheet lists them.
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.update",
        json!({ "schoolId": school_id, "studentId": musa, "patch": { "classId": other_id } }),
    );
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "reports.broadsheet",
        json!({ "schoolId": school_id, "classId": other_id, "session": "2024/2025", "term": "First" }),
    );
    assert_eq!(moved["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(moved["subjects"], json!(["Biology"]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn broadsheet_requires_a_full_scope() {
    let workspace = temp_dir("reportcardd-broadsheet-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(&mut stdin, &mut reader, "2", "schools.create", json!({ "name": "Hillcrest" }));
    let school_id = str_field(&school, "schoolId");
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "schoolId": school_id, "name": "JSS 1A" }),
    );
    let class_id = str_field(&class, "classId");

    let missing = request(
        &mut stdin,
        &mut reader,
        "4",
        "reports.broadsheet",
        json!({ "schoolId": school_id, "classId": class_id, "term": "First" }),
    );
    assert_eq!(error_code(&missing), Some("bad_params"));
    assert_eq!(missing["error"]["details"]["missing"], json!(["session"]));

    let blank = request(
        &mut stdin,
        &mut reader,
        "5",
        "reports.broadsheet",
        json!({ "schoolId": school_id, "classId": class_id, "session": "  ", "term": "" }),
    );
    assert_eq!(error_code(&blank), Some("bad_params"));
    assert_eq!(blank["error"]["details"]["missing"], json!(["session", "term"]));

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "reports.broadsheet",
        json!({ "schoolId": school_id, "classId": class_id, "session": "2024/2025", "term": "First" }),
    );
    assert_eq!(empty["subjects"], json!([]));
    assert_eq!(empty["students"], json!([]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
