use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const CATALOG_DOCUMENT: &str = r#"{
    "App_list": [
        {"App": {
            "hash": "H1",
            "package": "com.example",
            "version_code": 3,
            "version_name": "1.2.0",
            "uses_permission_list": [
                {"AndroidPermission": {
                    "added_in_api_level": 1,
                    "google_declared_group": null,
                    "Permission": {"name": "android.permission.CAMERA", "protection_level": "dangerous"}
                }}
            ],
            "extraction_metadata_list": [
                {"ExtractionMetadata": {"source": "fdroid", "method": "manifest", "timestamp": "2023-03-01 10:00:00"}}
            ]
        }},
        {"App": {"hash": "H0", "package": "com.example", "version_code": 1, "version_name": "1.0.0"}},
        {"App": {"hash": "H2", "package": "org.sample.reader", "version_code": 9}}
    ],
    "PrivacyRank": {
        "name": "RPNDroid",
        "source": "paper",
        "permission_ranks_list": [
            {"Rank": {"value": 1.567382127046585, "permission_name": "android.permission.CAMERA", "rank_name": "RPNDroid"}}
        ]
    },
    "AzMetadata_list": [
        {"AzMetadata": {
            "app_hash": "H1",
            "az_metadata_date": "2023-05-01",
            "star_rating": 4.2,
            "num_downloads": "10,000+",
            "az_dependency_list": [
                {"AzDependency": {"package": "com.squareup.okhttp3", "version_code": 4}}
            ]
        }}
    ]
}"#;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_pcat<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_pcat"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute pcat binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_pcat(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "pcat command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_document(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

#[test]
fn db_commands_report_schema_and_health() {
    let dir = unique_temp_dir("pcat-db");
    let db = dir.join("catalog.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "schema_version"), 0);
    assert_eq!(before.get("up_to_date"), Some(&Value::Bool(false)));
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");

    let init = run_json(["--db", path_str(&db), "db", "init"]);
    assert_eq!(as_i64(&init, "schema_version"), 1);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));
    assert_eq!(integrity.get("foreign_key_violations"), Some(&Value::Array(Vec::new())));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ingest_query_and_score_flow() {
    let dir = unique_temp_dir("pcat-flow");
    let db = dir.join("catalog.sqlite3");
    let document = write_document(&dir, "catalog.json", CATALOG_DOCUMENT);

    let first = run_json(["--db", path_str(&db), "ingest", "--file", path_str(&document)]);
    assert_eq!(as_i64(&first, "rows_affected"), 5);
    assert_eq!(as_str(&first, "document_sha256").len(), 64);
    let second = run_json(["--db", path_str(&db), "ingest", "--file", path_str(&document)]);
    assert_eq!(as_i64(&second, "rows_affected"), 0);

    let list = run_json(["--db", path_str(&db), "app", "list"]);
    assert_eq!(list.get("app_hashes"), Some(&serde_json::json!(["H0", "H1", "H2"])));

    let shown = run_json(["--db", path_str(&db), "app", "show", "--hash", "H1"]);
    let camera = &shown["app"]["App"]["uses_permission_list"][0]["AndroidPermission"];
    assert_eq!(camera["Permission"]["name"], "android.permission.CAMERA");

    let latest = run_json(["--db", path_str(&db), "app", "latest", "--package", "reader"]);
    assert_eq!(latest["app"]["App"]["hash"], "H2");
    let latest = run_json(["--db", path_str(&db), "app", "latest", "--package", "com.example"]);
    assert_eq!(latest["app"]["App"]["hash"], "H1");

    let versions = run_json(["--db", path_str(&db), "app", "versions", "--package", "com.example"]);
    assert_eq!(
        versions.get("versions"),
        Some(&serde_json::json!([
            {"hash": "H1", "version_name": "1.2.0"},
            {"hash": "H0", "version_name": "1.0.0"}
        ]))
    );

    let provenance = run_json(["--db", path_str(&db), "app", "provenance", "--hash", "H1"]);
    assert_eq!(provenance["extraction_metadata"][0]["ExtractionMetadata"]["source"], "fdroid");

    let az = run_json(["--db", path_str(&db), "az", "show", "--hash", "H1"]);
    let snapshot = &az["az_metadata"][0]["AzMetadata"];
    assert_eq!(snapshot["az_metadata_date"], "2023-05-01");
    assert_eq!(snapshot["az_dependency_list"][0]["AzDependency"]["version_code"], 4);

    let run = run_json(["--db", path_str(&db), "metrics", "run"]);
    assert_eq!(as_i64(&run, "scored"), 3);
    assert!(!as_str(&run, "run_id").is_empty());
    let rerun = run_json(["--db", path_str(&db), "metrics", "run"]);
    assert_eq!(as_i64(&rerun, "scored"), 0);

    let rank = run_json(["--db", path_str(&db), "rank", "show", "--name", "RPNDroid"]);
    let scores = rank["privacy_rank"]["PrivacyRank"]["app_scores_list"]
        .as_array()
        .unwrap_or_else(|| panic!("ledger should list scores: {rank}"));
    assert_eq!(scores.len(), 3);
    let h1 = scores
        .iter()
        .find(|score| score["Score"]["app_hash"] == "H1")
        .unwrap_or_else(|| panic!("H1 should be scored: {rank}"));
    let value = h1["Score"]["value"].as_f64().unwrap_or_default();
    assert!((value - 5.0).abs() < 1e-9, "unexpected H1 score {value}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ingest_only_rejects_other_kinds_and_persists_nothing() {
    let dir = unique_temp_dir("pcat-only");
    let db = dir.join("catalog.sqlite3");
    let document = write_document(&dir, "catalog.json", CATALOG_DOCUMENT);

    let output = run_pcat([
        "--db",
        path_str(&db),
        "ingest",
        "--file",
        path_str(&document),
        "--only",
        "PrivacyRank",
        "--only",
        "Score",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("App"));

    let list = run_json(["--db", path_str(&db), "app", "list"]);
    assert_eq!(list.get("app_hashes"), Some(&serde_json::json!([])));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unknown_tags_and_missing_keys_fail() {
    let dir = unique_temp_dir("pcat-fail");
    let db = dir.join("catalog.sqlite3");
    let document = write_document(&dir, "bad.json", r#"{"Gadget": {"name": "x"}}"#);

    let output = run_pcat(["--db", path_str(&db), "ingest", "--file", path_str(&document)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Gadget"));

    let output = run_pcat(["--db", path_str(&db), "app", "show", "--hash", "missing"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("app not found"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn configured_score_table_scores_only_its_packages() {
    let dir = unique_temp_dir("pcat-config");
    let db = dir.join("catalog.sqlite3");
    let document = write_document(&dir, "catalog.json", CATALOG_DOCUMENT);
    write_document(&dir, "paper.json", r#"{"org.sample.reader": 6.5}"#);
    let config = write_document(
        &dir,
        "catalog.yaml",
        "conflict_policy: warn\nmetrics:\n  - kind: score_table\n    name: Paper\n    table: paper.json\n",
    );

    run_json(["--db", path_str(&db), "--config", path_str(&config), "ingest", "--file", path_str(&document)]);
    let run = run_json(["--db", path_str(&db), "--config", path_str(&config), "metrics", "run"]);
    assert_eq!(as_i64(&run, "scored"), 1);
    assert_eq!(run["metrics"][0]["name"], "Paper");
    assert_eq!(run["metrics"][0]["universe"], 1);

    let rank = run_json(["--db", path_str(&db), "rank", "show", "--name", "Paper"]);
    assert_eq!(rank["privacy_rank"]["PrivacyRank"]["app_scores_list"][0]["Score"]["app_hash"], "H2");

    let _ = fs::remove_dir_all(&dir);
}
