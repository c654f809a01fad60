use httpmock::prelude::*;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

// exp = 2100-01-01T00:00:00Z, sub = device-1; the signature is never checked.
const TOKEN: &str = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.eyJleHAiOjQxMDI0NDQ4MDAsImlhdCI6MTcwMDAwMDAwMCwic3ViIjoiZGV2aWNlLTEifQ.c2ln";

fn bin() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("authcache").expect("binary");
    for key in ["AUTHCACHE_TOKEN", "AUTHCACHE_TOKEN_ENDPOINT", "AUTHCACHE_CACHE_DIR"] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn inspect_token_prints_claims() {
    bin()
        .arg("inspect-token")
        .arg(TOKEN)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sub\":\"device-1\""))
        .stdout(predicate::str::contains("\"exp\":4102444800"))
        .stdout(predicate::str::contains("\"expired\":false"));
}

#[test]
fn inspect_token_rejects_garbage() {
    bin()
        .arg("inspect-token")
        .arg("not-a-token")
        .assert()
        .failure()
        .stderr(predicate::str::contains("decode token"));
}

#[test]
fn clear_reports_deleted_files_and_is_idempotent() {
    let tmp = tempdir().expect("tmpdir");
    let dir = tmp.path().join("assets");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("a.png"), vec![0u8; 2048]).expect("write");
    fs::write(dir.join("b.jpg"), vec![0u8; 1000]).expect("write");

    bin()
        .arg("--cache-dir")
        .arg(&dir)
        .arg("clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deleted_count\":2"))
        .stdout(predicate::str::contains("\"freed_bytes\":3048"));
    assert!(dir.is_dir());

    bin()
        .arg("--cache-dir")
        .arg(&dir)
        .arg("clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deleted_count\":0"));
}

#[test]
fn fetch_downloads_with_the_static_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/assets/7.png")
            .header("Authorization-Attestation", TOKEN);
        then.status(200).body(vec![1u8; 4096]);
    });
    let tmp = tempdir().expect("tmpdir");

    bin()
        .arg("--cache-dir")
        .arg(tmp.path())
        .arg("--token")
        .arg(TOKEN)
        .arg("fetch")
        .arg("7")
        .arg(server.url("/assets/7.png"))
        .assert()
        .success()
        .stdout(predicate::str::contains("7.png"));
    mock.assert();
    assert_eq!(fs::read(tmp.path().join("7.png")).expect("cached").len(), 4096);

    bin()
        .arg("--cache-dir")
        .arg(tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"files\":1"))
        .stdout(predicate::str::contains("\"bytes\":4096"));
}

#[test]
fn fetch_failure_exits_non_zero() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404);
    });
    let tmp = tempdir().expect("tmpdir");

    bin()
        .arg("--cache-dir")
        .arg(tmp.path())
        .arg("fetch")
        .arg("gone")
        .arg(server.url("/missing"))
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"path\":null"));
}

#[test]
fn prefetch_reads_a_manifest() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path_contains("/p/");
        then.status(200)
            .header("content-type", "image/webp")
            .body(vec![2u8; 1500]);
    });
    let tmp = tempdir().expect("tmpdir");
    let cache_dir = tmp.path().join("cache");
    let manifest = tmp.path().join("manifest.json");
    let items: Vec<_> = (0..5)
        .map(|i| serde_json::json!({ "key": format!("k{i}"), "url": server.url(format!("/p/{i}")) }))
        .collect();
    fs::write(&manifest, serde_json::to_string(&items).expect("json")).expect("write");

    bin()
        .arg("--cache-dir")
        .arg(&cache_dir)
        .arg("prefetch")
        .arg(&manifest)
        .arg("--max-initial")
        .arg("3")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"accepted\":3"))
        .stdout(predicate::str::contains("\"dropped_over_limit\":2"));
    mock.assert_hits(3);
    assert!(cache_dir.join("k0.webp").exists());
    assert!(!cache_dir.join("k4.webp").exists());
}
