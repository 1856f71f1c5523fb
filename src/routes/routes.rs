//! Defines routes for uploads, downloads and the JSON API.
//!
//! ## Structure
//! - **Gated by the API key (when configured)**
//!   - `PUT    /`                - raw body upload, plain-text link back
//!   - `POST   /api/upload`      - multipart upload (`file` field)
//!   - `GET    /api/files/{id}`  - file metadata
//!   - `GET    /api/stats`       - totals across live files
//!
//! - **Always open**
//!   - `GET    /d/{file}`        - download (`{id}` or `{id}.{ext}`)
//!   - `GET    /download/{file}` - same as `/d/{file}`
//!   - `GET    /healthz`, `GET /readyz`
//!
//! Every route shares the per-address request limit when one is configured.

use crate::{
    handlers::{
        file_handlers::{download, file_info, stats, upload_multipart, upload_raw},
        health_handlers::{healthz, readyz},
    },
    routes::{auth::require_api_key, rate_limit::limit_per_ip},
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
};
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Build the full application router.
///
/// Body size is policed by the lifecycle engine while streaming, so axum's
/// default body limit is disabled. `io_timeout` bounds each request.
pub fn routes(state: AppState, io_timeout: Duration) -> Router {
    let gated = Router::new()
        .route("/", put(upload_raw))
        .route("/api/upload", post(upload_multipart))
        .route("/api/files/{id}", get(file_info))
        .route("/api/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // downloads are never gated
        .route("/d/{file}", get(download))
        .route("/download/{file}", get(download))
        .merge(gated)
        .layer(middleware::from_fn_with_state(state.clone(), limit_per_ip))
        .layer(DefaultBodyLimit::disable())
        .layer(TimeoutLayer::new(io_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ApiKey,
        routes::rate_limit::ip_rate_limiter,
        services::{lifecycle::RetentionPolicy, test_support::temp_engine},
        state::HttpSettings,
    };
    use axum::{
        body::Body,
        extract::ConnectInfo,
        http::{Request, Response, StatusCode, header},
    };
    use std::{net::SocketAddr, num::NonZeroU32};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XTESTBOUNDARY";

    async fn app(api_key: Option<&str>) -> (TempDir, Router) {
        let (dir, state) = app_state(api_key).await;
        (dir, routes(state, Duration::from_secs(30)))
    }

    async fn app_state(api_key: Option<&str>) -> (TempDir, AppState) {
        let (dir, engine) = temp_engine(RetentionPolicy {
            max_upload_bytes: 1024,
            max_downloads: 1,
            ttl: Duration::from_secs(3600),
        })
        .await;
        let settings = HttpSettings {
            public_url: None,
            api_key: api_key.map(ApiKey::new),
        };
        (dir, AppState::new(engine, settings))
    }

    fn from_peer(mut req: Request<Body>, ip: [u8; 4]) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
        req
    }

    async fn send(router: &Router, req: Request<Body>) -> Response<Body> {
        router.clone().oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
        resp.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    async fn body_json(resp: Response<Body>) -> Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn raw_put(body: &'static [u8]) -> axum::http::request::Builder {
        Request::builder()
            .method("PUT")
            .uri("/")
            .header(header::HOST, "files.test")
            .header(header::CONTENT_LENGTH, body.len())
            .header(header::CONTENT_DISPOSITION, r#"attachment; filename="hello.txt""#)
            .header(header::CONTENT_TYPE, "text/plain")
    }

    fn multipart_body(api_key: Option<&str>, contents: &str) -> String {
        let mut body = String::new();
        if let Some(key) = api_key {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"api_key\"\r\n\r\n{key}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.md\"\r\n\
             Content-Type: text/markdown\r\n\r\n{contents}\r\n--{BOUNDARY}--\r\n"
        ));
        body
    }

    fn multipart_post(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(header::HOST, "files.test")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    /// Path part of a download link, e.g. `/d/<id>.txt`.
    fn link_path(url: &str) -> String {
        url.trim()
            .strip_prefix("http://files.test")
            .expect("link uses request host")
            .to_string()
    }

    #[tokio::test]
    async fn raw_upload_then_single_download() {
        let (_dir, router) = app(None).await;

        let resp = send(&router, raw_put(b"hello there").body(Body::from("hello there")).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let url = String::from_utf8(body_bytes(resp).await).unwrap();
        let path = link_path(&url);
        assert!(path.starts_with("/d/") && path.ends_with(".txt"), "{path}");

        let get = |path: &str| Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = send(&router, get(&path)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            r#"attachment; filename="hello.txt""#
        );
        assert_eq!(body_bytes(resp).await, b"hello there");

        let again = send(&router, get(&path.replacen("/d/", "/download/", 1))).await;
        assert_eq!(again.status(), StatusCode::GONE);
        let again = send(&router, get(&path)).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn raw_upload_filename_from_query() {
        let (_dir, router) = app(None).await;
        let req = Request::builder()
            .method("PUT")
            .uri("/?filename=data.csv")
            .header(header::HOST, "files.test")
            .body(Body::from("a,b"))
            .unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let url = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(url.trim().ends_with(".csv"));
    }

    #[tokio::test]
    async fn oversized_raw_upload_is_rejected_with_plain_text() {
        let (_dir, router) = app(None).await;
        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header(header::CONTENT_LENGTH, 4096)
            .body(Body::from(vec![0u8; 4096]))
            .unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let text = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(text.starts_with("File too large"), "{text}");
    }

    #[tokio::test]
    async fn multipart_upload_and_describe() {
        let (_dir, router) = app(None).await;

        let resp = send(&router, multipart_post(multipart_body(None, "# hi"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["file_size"], 4);
        let id = json["unique_id"].as_str().unwrap().to_string();
        assert_eq!(
            json["download_url"],
            format!("http://files.test/d/{id}.md").as_str()
        );

        let info = Request::builder()
            .uri(format!("/api/files/{id}"))
            .body(Body::empty())
            .unwrap();
        let resp = send(&router, info).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["unique_id"], id.as_str());
        assert_eq!(json["data"]["original_name"], "notes.md");
        assert_eq!(json["data"]["mime_type"], "text/markdown");
        assert_eq!(json["data"]["extension"], ".md");
        assert_eq!(json["data"]["downloads"], 0);
    }

    #[tokio::test]
    async fn multipart_without_file_is_bad_request() {
        let (_dir, router) = app(None).await;
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
        );
        let resp = send(&router, multipart_post(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_file_is_404_everywhere() {
        let (_dir, router) = app(None).await;
        let id = crate::ids::generate_id();
        for uri in [
            format!("/d/{id}.bin"),
            format!("/download/{id}"),
            format!("/api/files/{id}"),
        ] {
            let resp = send(&router, Request::builder().uri(&uri).body(Body::empty()).unwrap()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn stats_report_totals() {
        let (_dir, router) = app(None).await;
        for body in [&b"abc"[..], b"defg"] {
            let req = Request::builder()
                .method("PUT")
                .uri("/")
                .body(Body::from(body))
                .unwrap();
            assert_eq!(send(&router, req).await.status(), StatusCode::OK);
        }

        let resp = send(
            &router,
            Request::builder().uri("/api/stats").body(Body::empty()).unwrap(),
        )
        .await;
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["total_files"], 2);
        assert_eq!(json["total_size"], 7);
        assert_eq!(json["total_size_formatted"], "7.00 Bytes");
    }

    #[tokio::test]
    async fn api_key_gates_uploads_and_api() {
        let (_dir, router) = app(Some("s3cret")).await;

        let resp = send(&router, raw_put(b"x").body(Body::from("x")).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(
            &router,
            raw_put(b"x")
                .header("X-API-Key", "wrong")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(
            &router,
            raw_put(b"x")
                .header("X-API-Key", "s3cret")
                .body(Body::from("x"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let path = link_path(&String::from_utf8(body_bytes(resp).await).unwrap());

        let stats = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        assert_eq!(
            send(&router, stats("/api/stats")).await.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            send(&router, stats("/api/stats?api_key=s3cret")).await.status(),
            StatusCode::OK
        );

        // Downloads and health checks stay open.
        assert_eq!(send(&router, stats(&path)).await.status(), StatusCode::OK);
        assert_eq!(send(&router, stats("/healthz")).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_key_in_multipart_form_field() {
        let (_dir, router) = app(Some("s3cret")).await;

        let resp = send(&router, multipart_post(multipart_body(None, "x"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(&router, multipart_post(multipart_body(Some("nope"), "x"))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = send(&router, multipart_post(multipart_body(Some("s3cret"), "x"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["success"], true);
    }

    #[tokio::test]
    async fn multipart_content_type_does_not_unlock_other_routes() {
        let (_dir, router) = app(Some("s3cret")).await;
        let multipart = format!("multipart/form-data; boundary={BOUNDARY}");
        let id = crate::ids::generate_id();

        for (method, uri) in [
            ("GET", "/api/stats".to_string()),
            ("GET", format!("/api/files/{id}")),
        ] {
            let req = Request::builder()
                .method(method)
                .uri(&uri)
                .header(header::CONTENT_TYPE, &multipart)
                .body(Body::empty())
                .unwrap();
            let status = send(&router, req).await.status();
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }

        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header(header::CONTENT_TYPE, &multipart)
            .body(Body::from("unauthenticated bytes"))
            .unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let text = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(text.starts_with("Invalid or missing API key"), "{text}");

        let stats = Request::builder()
            .uri("/api/stats")
            .header("X-API-Key", "s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(body_json(send(&router, stats).await).await["total_files"], 0);
    }

    #[tokio::test]
    async fn form_field_key_only_counts_on_the_multipart_upload() {
        let (_dir, router) = app(Some("s3cret")).await;
        let multipart = format!("multipart/form-data; boundary={BOUNDARY}");

        // A valid key in a form field is not read by the raw upload route.
        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header(header::CONTENT_TYPE, &multipart)
            .body(Body::from(multipart_body(Some("s3cret"), "x")))
            .unwrap();
        assert_eq!(send(&router, req).await.status(), StatusCode::UNAUTHORIZED);

        // A wrong header key is not rescued by a correct form field.
        let mut req = multipart_post(multipart_body(Some("s3cret"), "x"));
        req.headers_mut()
            .insert("x-api-key", header::HeaderValue::from_static("wrong"));
        assert_eq!(send(&router, req).await.status(), StatusCode::UNAUTHORIZED);

        // The form field must come before the file.
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\r\n\
             x\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"api_key\"\r\n\r\n\
             s3cret\r\n--{BOUNDARY}--\r\n"
        );
        assert_eq!(
            send(&router, multipart_post(body)).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn requests_are_limited_per_client_address() {
        let (_dir, state) = app_state(None).await;
        let limiter = ip_rate_limiter(NonZeroU32::new(2).unwrap());
        let router = routes(state.with_rate_limiter(limiter), Duration::from_secs(30));
        let health = || Request::builder().uri("/healthz").body(Body::empty()).unwrap();

        for _ in 0..2 {
            let resp = send(&router, from_peer(health(), [10, 0, 0, 1])).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = send(&router, from_peer(health(), [10, 0, 0, 1])).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(resp).await["success"], false);

        let put = raw_put(b"x").body(Body::from("x")).unwrap();
        let resp = send(&router, from_peer(put, [10, 0, 0, 1])).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let text = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(text.starts_with("Too many requests"), "{text}");

        let resp = send(&router, from_peer(health(), [10, 0, 0, 2])).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(send(&router, health()).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_checks_ledger_and_disk() {
        let (_dir, router) = app(None).await;
        let resp = send(
            &router,
            Request::builder().uri("/readyz").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["checks"]["ledger"]["ok"], true);
        assert_eq!(json["checks"]["disk"]["ok"], true);
    }
}
