//! Defines routes for the transfer service.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Transfer lifecycle**
//!   - `GET    /sas?file=&contentType=`: upload grant for one object
//!   - `POST   /transfer/{id}/finalize`: record name and stats
//!   - `POST   /transfer/{id}/lock`: set the transfer password
//!   - `GET    /transfer/{id}`: gated file listing
//!   - `DELETE /transfer/{id}`: cascading delete (admin token)
//!   - `GET    /transfer/{id}/zip`: streamed archive of every file
//!   - `GET    /download/{transferId}/{filename}`: redirect to a read grant
//!
//! - **Local backend grants** (only when the local backend is selected)
//!   - `PUT    /blob/{*key}`, `GET /blob/{*key}`
//!
//! The wildcard `*key` allows nested keys like `{id}/photos/2025/img.jpg`.

use crate::{
    handlers::{
        blob_handlers::{get_blob, put_blob},
        health_handlers::{healthz, readyz},
        transfer_handlers::{
            delete_transfer, download_file, download_zip, finalize_transfer, get_transfer,
            issue_upload_grant, lock_transfer,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. Blob routes are mounted only when `serve_blobs` is
/// set, since remote backends hand out their own URLs.
pub fn routes(serve_blobs: bool) -> Router<AppState> {
    let router = Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // transfer lifecycle
        .route("/sas", get(issue_upload_grant))
        .route("/transfer/{id}", get(get_transfer).delete(delete_transfer))
        .route("/transfer/{id}/finalize", post(finalize_transfer))
        .route("/transfer/{id}/lock", post(lock_transfer))
        .route("/transfer/{id}/zip", get(download_zip))
        .route("/download/{transfer_id}/{filename}", get(download_file));

    if serve_blobs {
        router.route(
            "/blob/{*key}",
            put(put_blob)
                .get(get_blob)
                .layer(DefaultBodyLimit::disable()),
        )
    } else {
        router
    }
}

/// Router with state attached, ready to serve.
pub fn app(state: AppState) -> Router {
    routes(state.store.local.is_some()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig, db, services::object_store::signing::URL_COMPONENT,
    };
    use axum::{
        body::{Body, Bytes},
        http::{HeaderMap, Request, StatusCode, header},
    };
    use http_body_util::BodyExt;
    use percent_encoding::utf8_percent_encode;
    use serde_json::{Value, json};
    use std::io::{Cursor, Read};
    use tower::ServiceExt;

    const PUBLIC_URL: &str = "http://files.test";
    const ADMIN_TOKEN: &str = "admin-token";
    const ID: &str = "7d1c2f0e-transfer";

    struct TestApp {
        router: Router,
        _dir: tempfile::TempDir,
    }

    async fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig {
            storage_dir: dir.path().join("objects").display().to_string(),
            public_url: PUBLIC_URL.into(),
            signing_secret: Some("router-test-secret".into()),
            bcrypt_cost: 4,
            admin_token: Some(ADMIN_TOKEN.into()),
            ..AppConfig::default()
        };
        let db = db::test_pool(dir.path()).await;
        TestApp {
            router: app(AppState::build(&cfg, db)),
            _dir: dir,
        }
    }

    fn encode(value: &str) -> String {
        utf8_percent_encode(value, URL_COMPONENT).to_string()
    }

    fn local_path(url: &str) -> &str {
        url.strip_prefix(PUBLIC_URL).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn get_with_password(uri: &str, password: &str) -> Request<Body> {
        Request::get(uri)
            .header("x-transfer-password", password)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    impl TestApp {
        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, headers, body)
        }

        async fn json(&self, request: Request<Body>) -> (StatusCode, Value) {
            let (status, _, body) = self.send(request).await;
            (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
        }

        async fn grant(&self, key: &str, content_type: &str) -> String {
            let uri = format!("/sas?file={}&contentType={}", encode(key), encode(content_type));
            let (status, body) = self.json(get(&uri)).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            body["sasTokenUrl"].as_str().unwrap().to_string()
        }

        async fn upload(&self, key: &str, content_type: &str, bytes: &'static [u8]) {
            let url = self.grant(key, content_type).await;
            let request = Request::put(local_path(&url))
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(bytes))
                .unwrap();
            let (status, headers, _) = self.send(request).await;
            assert_eq!(status, StatusCode::CREATED);
            assert!(headers.contains_key(header::ETAG));
        }
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let app = test_app().await;
        let (status, _) = app.json(get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app.json(get("/readyz")).await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    #[tokio::test]
    async fn upload_finalize_list_and_download() {
        let app = test_app().await;
        app.upload(&format!("{ID}/docs/report.txt"), "text/plain", b"hello report")
            .await;

        let (status, body) = app
            .json(post_json(
                &format!("/transfer/{ID}/finalize"),
                json!({ "name": "report.txt", "size": 12, "fileCount": 1 }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));

        let (status, body) = app.json(get(&format!("/transfer/{ID}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "report.txt");
        let file = &body["files"][0];
        assert_eq!(file["name"], "docs/report.txt");
        assert_eq!(file["size"], 12);
        assert_eq!(file["contentType"], "text/plain");
        let download = file["url"].as_str().unwrap();
        assert_eq!(
            download,
            format!("{PUBLIC_URL}/download/{ID}/docs%2Freport.txt")
        );

        let (status, headers, _) = app.send(get(local_path(download))).await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
        let location = headers[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with(&format!("{PUBLIC_URL}/blob/{ID}/docs/report.txt?op=get")));

        let (status, headers, body) = app.send(get(local_path(location))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"hello report");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    }

    #[tokio::test]
    async fn locked_transfer_requires_the_password() {
        let app = test_app().await;
        app.upload(&format!("{ID}/secret.txt"), "text/plain", b"classified")
            .await;

        let (status, body) = app
            .json(post_json(&format!("/transfer/{ID}/lock"), json!({ "password": "s3cret" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Transfer locked successfully");

        let uri = format!("/transfer/{ID}");
        let (status, body) = app.json(get(&uri)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Password required");

        let (status, body) = app.json(get_with_password(&uri, "guess")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid password");

        let (status, body) = app.json(get_with_password(&uri, "s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"][0]["name"], "secret.txt");

        let download = format!("/download/{ID}/secret.txt");
        let (status, _, _) = app.send(get(&download)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = app.send(get_with_password(&download, "s3cret")).await;
        assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);

        let zip = format!("/transfer/{ID}/zip");
        let (status, _, _) = app.send(get(&zip)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn relocking_replaces_the_password() {
        let app = test_app().await;
        app.upload(&format!("{ID}/notes.txt"), "text/plain", b"notes").await;
        let lock = format!("/transfer/{ID}/lock");
        let uri = format!("/transfer/{ID}");

        for _ in 0..2 {
            let (status, _) = app.json(post_json(&lock, json!({ "password": "pw" }))).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = app.json(get_with_password(&uri, "pw")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"][0]["name"], "notes.txt");

        let (status, _) = app.json(post_json(&lock, json!({ "password": "pw2" }))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app.json(get_with_password(&uri, "pw")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid password");
        let (status, _) = app.json(get_with_password(&uri, "pw2")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn lock_needs_a_non_blank_password() {
        let app = test_app().await;
        let (status, body) = app
            .json(post_json(&format!("/transfer/{ID}/lock"), json!({ "password": "  " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Valid password is required");
    }

    #[tokio::test]
    async fn traversal_and_reserved_names_are_rejected() {
        let app = test_app().await;

        let (status, body) = app.json(get(&format!("/download/{ID}/..%2Fother%2Fa.txt"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid path");

        let uri = format!("/sas?file={}", encode(&format!("{ID}/../escape.txt")));
        let (status, _) = app.json(get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/sas?file={}", encode(&format!("{ID}/.metadata.json")));
        let (status, body) = app.json(get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File name is reserved");

        let (status, body) = app.json(get("/sas")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File name is required");
    }

    #[tokio::test]
    async fn tampered_or_mismatched_grants_are_refused() {
        let app = test_app().await;
        let url = app.grant(&format!("{ID}/a.txt"), "text/plain").await;

        let (base, _) = url.split_once("&signature=").unwrap();
        let forged = format!("{base}&signature=AAAA");
        let request = Request::put(local_path(&forged))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("x"))
            .unwrap();
        let (status, _, _) = app.send(request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let request = Request::put(local_path(&url))
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from("x"))
            .unwrap();
        let (status, _, _) = app.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // A read through an upload grant is the wrong operation.
        let (status, _, _) = app.send(get(local_path(&url))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_transfers_are_not_found() {
        let app = test_app().await;
        let (status, body) = app.json(get("/transfer/nobody-home")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Transfer not found");

        let (status, body) = app.json(get("/transfer/nobody-home/zip")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No files found in transfer");

        let (status, _) = app.json(get("/download/nobody-home/a.txt")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn zip_contains_every_file() {
        let app = test_app().await;
        app.upload(&format!("{ID}/a.txt"), "text/plain", b"alpha").await;
        app.upload(&format!("{ID}/nested/b.txt"), "text/plain", b"bravo")
            .await;
        app.json(post_json(
            &format!("/transfer/{ID}/finalize"),
            json!({ "name": "a.txt + 1 others", "size": 10, "fileCount": 2 }),
        ))
        .await;

        let (status, headers, body) = app.send(get(&format!("/transfer/{ID}/zip"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
        let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.contains("filename=\"a - Bulk Transfer.zip\""), "{disposition}");

        let mut archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "nested/b.txt"]);

        let mut contents = String::new();
        archive
            .by_name("nested/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "bravo");
    }

    #[tokio::test]
    async fn delete_requires_the_admin_token() {
        let app = test_app().await;
        app.upload(&format!("{ID}/a.txt"), "text/plain", b"alpha").await;
        let uri = format!("/transfer/{ID}");

        let request = Request::delete(uri.as_str()).body(Body::empty()).unwrap();
        let (status, body) = app.json(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");

        let request = Request::delete(uri.as_str())
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let (status, _) = app.json(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::delete(uri.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = app.json(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "deleted": 1 }));

        let (status, _) = app.json(get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
