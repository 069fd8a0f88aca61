//! The exporter's HTTP surface (spec §6): a single `/metrics` endpoint,
//! optionally behind HTTP Basic auth, everything else 404. Grounded in
//! the teacher's actix-web handlers and `util/basic_auth.go`.

use actix_web::http::header;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone)]
struct AppState {
    registry: Registry,
    basic_auth: Option<(String, String)>,
}

fn check_basic_auth(req: &HttpRequest, expected: &(String, String)) -> bool {
    let Some(header_value) = req.headers().get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(header_value) = header_value.to_str() else {
        return false;
    };
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => user == expected.0 && pass == expected.1,
        None => false,
    }
}

async fn metrics(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Some(expected) = &state.basic_auth {
        if !check_basic_auth(&req, expected) {
            return HttpResponse::Unauthorized()
                .insert_header((header::WWW_AUTHENTICATE, r#"Basic realm="metrics""#))
                .body("401 Unauthorized\n");
        }
    }

    let metric_families = state.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).expect("prometheus text encoding is infallible");
    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().finish()
}

/// Binds and serves `/metrics` on `port` until `shutdown` resolves, then
/// drains in-flight requests for up to the server's shutdown timeout.
pub async fn serve(
    registry: Registry,
    port: u16,
    basic_auth: Option<(String, String)>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let state = AppState { registry, basic_auth };

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/metrics", web::get().to(metrics))
            .default_service(web::route().to(not_found))
    })
    .bind(("0.0.0.0", port))
    .map_err(Error::Http)?
    .shutdown_timeout(5)
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        shutdown.await;
        info!("http listener received shutdown signal");
        handle.stop(true).await;
    });

    server.await.map_err(Error::Http)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    fn app_state(basic_auth: Option<(String, String)>) -> AppState {
        AppState { registry: Registry::new(), basic_auth }
    }

    #[actix_web::test]
    async fn metrics_served_without_auth_when_unconfigured() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(None)))
                .route("/metrics", web::get().to(metrics)),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn metrics_rejects_missing_credentials_when_configured() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(Some(("user".into(), "pass".into())))))
                .route("/metrics", web::get().to(metrics)),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
        assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[actix_web::test]
    async fn metrics_accepts_correct_credentials() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(Some(("user".into(), "pass".into())))))
                .route("/metrics", web::get().to(metrics)),
        )
        .await;
        let creds = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode("user:pass")
        };
        let req = test::TestRequest::get()
            .uri("/metrics")
            .insert_header((header::AUTHORIZATION, format!("Basic {creds}")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn unknown_path_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(None)))
                .route("/metrics", web::get().to(metrics))
                .default_service(web::route().to(not_found)),
        )
        .await;
        let req = test::TestRequest::get().uri("/nope").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }
}
