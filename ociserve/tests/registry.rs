//! End-to-end tests over the HTTP surface with an in-memory backend.

use ociserve::Registry;

use sha2::Digest as _;

const FOO_DIGEST: &str = "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

async fn serve() -> String {
    serve_registry(Registry::in_memory()).await
}

async fn serve_registry(registry: std::sync::Arc<Registry>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, registry.router()).await.unwrap();
    });
    format!("http://{addr}")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn test_ping() {
    let base = serve().await;
    let resp = client().get(format!("{base}/v2/")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn test_monolithic_post_roundtrip() {
    let base = serve().await;
    let c = client();
    let data = b"layer bytes".to_vec();
    let digest = format!("sha256:{}", sha256_hex(&data));

    let resp = c
        .post(format!("{base}/v2/foo/bar/blobs/uploads/?digest={digest}"))
        .body(data.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["docker-content-digest"].to_str().unwrap(), digest);

    let resp = c
        .get(format!("{base}/v2/foo/bar/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap(), data);
}

#[tokio::test]
async fn test_put_bad_digest_then_blob_absent() {
    let base = serve().await;
    let c = client();

    // unparseable digest
    let resp = c
        .put(format!("{base}/v2/foo/blobs/uploads/1?digest=sha256:baddigest"))
        .body("foo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body = resp.text().await.unwrap();
    assert!(body.contains("DIGEST_INVALID"), "{body}");

    // well-formed but wrong digest
    let wrong = format!("sha256:{}", "0".repeat(64));
    let resp = c
        .put(format!("{base}/v2/foo/blobs/uploads/2?digest={wrong}"))
        .body("foo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("DIGEST_INVALID"));

    // nothing was stored
    let resp = c
        .get(format!("{base}/v2/foo/blobs/{FOO_DIGEST}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("BLOB_UNKNOWN"));
}

#[tokio::test]
async fn test_put_correct_digest() {
    let base = serve().await;
    let c = client();

    let resp = c
        .put(format!("{base}/v2/foo/blobs/uploads/1?digest={FOO_DIGEST}"))
        .body("foo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(
        resp.headers()["docker-content-digest"].to_str().unwrap(),
        FOO_DIGEST
    );

    let resp = c
        .head(format!("{base}/v2/foo/blobs/{FOO_DIGEST}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "3");
}

#[tokio::test]
async fn test_chunked_equivalence() {
    let base = serve().await;
    let c = client();
    let data: Vec<u8> = (0..4096u32).flat_map(|x| x.to_le_bytes()).collect();
    let digest = format!("sha256:{}", sha256_hex(&data));

    let resp = c
        .post(format!("{base}/v2/foo/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert_eq!(resp.headers()["range"], "0-0");
    let location = resp.headers()["location"].to_str().unwrap().to_string();

    let mut offset = 0usize;
    for chunk in data.chunks(1000) {
        let resp = c
            .patch(format!("{base}{location}"))
            .header("content-range", format!("{}-{}", offset, offset + chunk.len() - 1))
            .body(chunk.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        offset += chunk.len();
        assert_eq!(
            resp.headers()["range"].to_str().unwrap(),
            format!("0-{}", offset - 1)
        );
    }

    // out-of-order chunk is refused and the cursor reported back
    let resp = c
        .patch(format!("{base}{location}"))
        .header("content-range", "0-9")
        .body(vec![0u8; 10])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert!(resp.text().await.unwrap().contains("BLOB_UPLOAD_UNKNOWN"));

    let resp = c
        .put(format!("{base}{location}?digest={digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = c
        .get(format!("{base}/v2/foo/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.bytes().await.unwrap(), data);
}

#[tokio::test]
async fn test_failed_finalize_leaves_session_open() {
    let base = serve().await;
    let c = client();

    let resp = c
        .post(format!("{base}/v2/foo/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    let location = resp.headers()["location"].to_str().unwrap().to_string();

    let resp = c
        .patch(format!("{base}{location}"))
        .body("fo")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // finalize against the wrong digest
    let wrong = format!("sha256:{}", "0".repeat(64));
    let resp = c
        .put(format!("{base}{location}?digest={wrong}"))
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // the accumulated bytes (including the failed PUT body) survive
    let digest = format!("sha256:{}", sha256_hex(b"fox"));
    let resp = c
        .put(format!("{base}{location}?digest={digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
}

#[tokio::test]
async fn test_cross_repo_mount() {
    let base = serve().await;
    let c = client();
    let data = b"shared".to_vec();
    let digest = format!("sha256:{}", sha256_hex(&data));

    let resp = c
        .post(format!("{base}/v2/src/blobs/uploads/?digest={digest}"))
        .body(data)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = c
        .post(format!(
            "{base}/v2/dst/blobs/uploads/?mount={digest}&from=src"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(
        resp.headers()["location"].to_str().unwrap(),
        format!("/v2/dst/blobs/{digest}")
    );

    let resp = c
        .head(format!("{base}/v2/dst/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // a mount of something absent falls back to a plain session
    let absent = format!("sha256:{}", "1".repeat(64));
    let resp = c
        .post(format!(
            "{base}/v2/dst/blobs/uploads/?mount={absent}&from=src"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert!(resp.headers().contains_key("location"));
}

#[tokio::test]
async fn test_manifest_roundtrip() {
    let base = serve().await;
    let c = client();
    let manifest = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:aa","size":2},"layers":[]}"#.to_vec();
    let content_type = "application/vnd.oci.image.manifest.v1+json";
    let digest = format!("sha256:{}", sha256_hex(&manifest));

    let resp = c
        .put(format!("{base}/v2/foo/bar/manifests/latest"))
        .header("content-type", content_type)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    assert_eq!(resp.headers()["docker-content-digest"].to_str().unwrap(), digest);

    for reference in ["latest", digest.as_str()] {
        let resp = c
            .get(format!("{base}/v2/foo/bar/manifests/{reference}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"].to_str().unwrap(), content_type);
        assert_eq!(resp.bytes().await.unwrap(), manifest);
    }

    let resp = c
        .head(format!("{base}/v2/foo/bar/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"].to_str().unwrap(), manifest.len().to_string());

    let resp = c
        .get(format!("{base}/v2/unknown/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("NAME_UNKNOWN"));

    let resp = c
        .get(format!("{base}/v2/foo/bar/manifests/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(resp.text().await.unwrap().contains("MANIFEST_UNKNOWN"));

    let resp = c
        .delete(format!("{base}/v2/foo/bar/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let resp = c
        .get(format!("{base}/v2/foo/bar/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_manifest_put_by_digest_must_match() {
    let base = serve().await;
    let c = client();
    let manifest = br#"{"schemaVersion":2}"#.to_vec();
    let wrong = format!("sha256:{}", "2".repeat(64));
    let resp = c
        .put(format!("{base}/v2/foo/manifests/{wrong}"))
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("DIGEST_INVALID"));
}

#[tokio::test]
async fn test_referrers() {
    let base = serve().await;
    let c = client();
    let subject = format!("sha256:{}", "b".repeat(64));
    let attach = format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","artifactType":"application/spdx+json","config":{{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:{}","size":2}},"layers":[],"subject":{{"mediaType":"application/vnd.oci.image.manifest.v1+json","digest":"{subject}","size":100}},"annotations":{{"vnd.test.note":"hello"}}}}"#,
        "a".repeat(64)
    );
    let attach_digest = format!("sha256:{}", sha256_hex(attach.as_bytes()));

    let resp = c
        .put(format!("{base}/v2/foo/manifests/{attach_digest}"))
        .header("content-type", "application/vnd.oci.image.manifest.v1+json")
        .body(attach.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let resp = c
        .get(format!("{base}/v2/foo/referrers/{subject}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/vnd.oci.image.index.v1+json"
    );
    let index: serde_json::Value = resp.json().await.unwrap();
    let manifests = index["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0]["digest"], attach_digest.as_str());
    assert_eq!(manifests[0]["artifactType"], "application/spdx+json");
    assert_eq!(manifests[0]["annotations"]["vnd.test.note"], "hello");

    // artifactType filter
    let resp = c
        .get(format!(
            "{base}/v2/foo/referrers/{subject}?artifactType=application/other"
        ))
        .send()
        .await
        .unwrap();
    let index: serde_json::Value = resp.json().await.unwrap();
    assert!(index["manifests"].as_array().unwrap().is_empty());

    // delete the referrer, the listing reflects it
    let resp = c
        .delete(format!("{base}/v2/foo/manifests/{attach_digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let resp = c
        .get(format!("{base}/v2/foo/referrers/{subject}"))
        .send()
        .await
        .unwrap();
    let index: serde_json::Value = resp.json().await.unwrap();
    assert!(index["manifests"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_repository_name() {
    let base = serve().await;
    let c = client();

    let resp = c
        .get(format!("{base}/v2/Foo/Bar/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("NAME_INVALID"));

    let resp = c
        .post(format!("{base}/v2/bad__name!/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert!(resp.text().await.unwrap().contains("NAME_INVALID"));

    // only the name part is checked, the digest segment stays untouched
    let resp = c
        .head(format!("{base}/v2/ok.name/blobs/{FOO_DIGEST}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_tags_listing_and_paging() {
    let base = serve().await;
    let c = client();
    for tag in ["a", "b", "c", "d", "e"] {
        let resp = c
            .put(format!("{base}/v2/foo/manifests/{tag}"))
            .body(format!(r#"{{"schemaVersion":2,"tag":"{tag}"}}"#))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }

    let resp = c
        .get(format!("{base}/v2/foo/tags/list"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "foo");
    assert_eq!(body["tags"].as_array().unwrap().len(), 5);

    let resp = c
        .get(format!("{base}/v2/foo/tags/list?n=2"))
        .send()
        .await
        .unwrap();
    let link = resp.headers()["link"].to_str().unwrap().to_string();
    assert!(link.contains("last=b") && link.ends_with("rel=\"next\""), "{link}");
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["tags"], serde_json::json!(["a", "b"]));

    let resp = c
        .get(format!("{base}/v2/foo/tags/list?n=10&last=b"))
        .send()
        .await
        .unwrap();
    assert!(!resp.headers().contains_key("link"));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["tags"], serde_json::json!(["c", "d", "e"]));

    let resp = c
        .get(format!("{base}/v2/_catalog"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["repositories"], serde_json::json!(["foo"]));
}

#[tokio::test]
async fn test_blob_range_get() {
    let base = serve().await;
    let c = client();
    let data = b"0123456789".to_vec();
    let digest = format!("sha256:{}", sha256_hex(&data));
    c.post(format!("{base}/v2/foo/blobs/uploads/?digest={digest}"))
        .body(data)
        .send()
        .await
        .unwrap();

    let resp = c
        .get(format!("{base}/v2/foo/blobs/{digest}"))
        .header("range", "bytes=2-5")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"].to_str().unwrap(), "bytes 2-5/10");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"2345");

    let resp = c
        .get(format!("{base}/v2/foo/blobs/{digest}"))
        .header("range", "bytes=4-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"456789");

    let resp = c
        .get(format!("{base}/v2/foo/blobs/{digest}"))
        .header("range", "bytes=100-200")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(resp.headers()["content-range"].to_str().unwrap(), "bytes */10");
}

#[tokio::test]
async fn test_disk_backend_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let base = serve_registry(Registry::on_disk(dir.path())).await;
    let c = client();
    let data = b"on disk".to_vec();
    let digest = format!("sha256:{}", sha256_hex(&data));

    let resp = c
        .post(format!("{base}/v2/foo/blobs/uploads/?digest={digest}"))
        .body(data.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // the filename is the identity
    assert!(dir
        .path()
        .join("sha256")
        .join(digest.strip_prefix("sha256:").unwrap())
        .exists());

    let resp = c
        .get(format!("{base}/v2/foo/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.bytes().await.unwrap(), data);
}
