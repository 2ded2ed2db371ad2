#[path = "../src/backup.rs"]
mod backup;

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
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

#[test]
fn zip_export_and_import_roundtrip() {
    let workspace = temp_dir("reportcardd-backup-src");
    let workspace2 = temp_dir("reportcardd-backup-dst");
    let out_dir = temp_dir("reportcardd-backup-out");

    let db_src = workspace.join("reportcard.sqlite3");
    let bytes = b"sqlite-test-payload";
    std::fs::write(&db_src, bytes).expect("write source db");

    let bundle_path = out_dir.join("nested").join("workspace.rcbackup.zip");
    let export = backup::export_workspace_bundle(&db_src, &bundle_path).expect("export bundle");
    assert_eq!(export.bundle_format, backup::BUNDLE_FORMAT);
    assert_eq!(export.entry_count, 2);
    assert_eq!(export.db_sha256, format!("{:x}", Sha256::digest(bytes)));

    let f = File::open(&bundle_path).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("manifest json");
    assert_eq!(manifest["format"], backup::BUNDLE_FORMAT);
    assert_eq!(manifest["dbSha256"], export.db_sha256.as_str());
    archive
        .by_name(backup::DB_ENTRY)
        .expect("database entry in bundle");

    let db_dst = workspace2.join("reportcard.sqlite3");
    std::fs::write(&db_dst, b"older-database").expect("write existing db");
    let import = backup::import_workspace_bundle(&bundle_path, &db_dst).expect("import bundle");
    assert_eq!(import.bundle_format_detected, backup::BUNDLE_FORMAT);

    let restored = std::fs::read(&db_dst).expect("read restored db");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}

#[test]
fn tampered_bundle_is_rejected_and_existing_db_kept() {
    let out_dir = temp_dir("reportcardd-backup-tamper");
    let workspace = temp_dir("reportcardd-backup-tamper-dst");

    let bundle_path = out_dir.join("tampered.zip");
    {
        let f = File::create(&bundle_path).expect("create bundle");
        let mut zip = zip::ZipWriter::new(f);
        let opts = zip::write::FileOptions::default();
        zip.start_file("manifest.json", opts).expect("manifest entry");
        let manifest = serde_json::json!({
            "format": backup::BUNDLE_FORMAT,
            "version": 1,
            "dbSha256": format!("{:x}", Sha256::digest(b"original")),
        });
        zip.write_all(manifest.to_string().as_bytes())
            .expect("write manifest");
        zip.start_file(backup::DB_ENTRY, opts).expect("db entry");
        zip.write_all(b"modified").expect("write db");
        zip.finish().expect("finish zip");
    }

    let db_dst = workspace.join("reportcard.sqlite3");
    std::fs::write(&db_dst, b"keep-me").expect("write existing db");
    let e = backup::import_workspace_bundle(&bundle_path, &db_dst).unwrap_err();
    assert!(e.to_string().contains("checksum"), "{}", e);
    assert_eq!(std::fs::read(&db_dst).expect("read db"), b"keep-me");

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raw_sqlite_import_is_supported() {
    let out_dir = temp_dir("reportcardd-backup-raw");
    let workspace = temp_dir("reportcardd-backup-raw-dst");

    let raw_file = out_dir.join("copy.sqlite3");
    let bytes = b"raw-sqlite-copy";
    std::fs::write(&raw_file, bytes).expect("write raw sqlite file");

    let db_dst = workspace.join("reportcard.sqlite3");
    let import = backup::import_workspace_bundle(&raw_file, &db_dst).expect("import raw sqlite");
    assert_eq!(import.bundle_format_detected, backup::RAW_SQLITE_FORMAT);

    let restored = std::fs::read(&db_dst).expect("read restored sqlite");
    assert_eq!(restored, bytes);

    let _ = std::fs::remove_dir_all(out_dir);
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn missing_database_fails_export() {
    let workspace = temp_dir("reportcardd-backup-missing");
    let e = backup::export_workspace_bundle(
        &workspace.join("reportcard.sqlite3"),
        &workspace.join("out.zip"),
    )
    .unwrap_err();
    assert!(e.to_string().contains("not found"), "{}", e);
    let _ = std::fs::remove_dir_all(workspace);
}
