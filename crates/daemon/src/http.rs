//! HTTP front-end for the peer registry.
//!
//! | Verb | Path        | Body / query                 | Response                      |
//! |------|-------------|------------------------------|-------------------------------|
//! | POST | `/register` | `{"id": .., "address": ..}`  | `{"message": "Registered successfully"}` |
//! | GET  | `/get`      | `?id=<id>`                   | `{"id": .., "address": ..}` or 404 |
//! | GET  | `/all`      |                              | `[{"id": .., "address": ..}, ..]` |
//!
//! `/health` and `/metrics` are served alongside. A malformed registration
//! body is answered with 404 and the parse error as a JSON string, which is
//! what existing clients expect.

use crate::metrics::Metrics;
use crate::registry::{AddressRecord, PeerRegistry};
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use url::form_urlencoded;

/// Shared state behind every registry connection.
#[derive(Clone)]
pub struct RegistryService {
    registry: Arc<PeerRegistry>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

impl RegistryService {
    pub fn new(registry: Arc<PeerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Route one request. Never fails; errors become HTTP responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<String>, Infallible>
    where
        B: Body,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match (method, path.as_str()) {
            (Method::POST, "/register") => self.register(req).await,
            (Method::GET, "/get") => self.lookup(req.uri().query().unwrap_or("")),
            (Method::GET, "/all") => self.list(),
            (Method::GET, "/health") => text_response(StatusCode::OK, "OK"),
            (Method::GET, "/metrics") => {
                let mut resp = text_response(StatusCode::OK, self.metrics.to_prometheus());
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                resp
            }
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        };

        Ok(response)
    }

    async fn register<B>(&self, req: Request<B>) -> Response<String>
    where
        B: Body,
        B::Error: Display,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return self.bad_request(e.to_string()),
        };

        let record: AddressRecord = match serde_json::from_slice(&body) {
            Ok(record) => record,
            Err(e) => return self.bad_request(e.to_string()),
        };

        self.registry.register(&record.id, &record.address);
        self.metrics.inc_registrations();

        json_response(
            StatusCode::OK,
            &MessageBody {
                message: "Registered successfully",
            },
        )
    }

    fn lookup(&self, query: &str) -> Response<String> {
        self.metrics.inc_lookups();

        let id = form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();

        match self.registry.lookup(&id) {
            Some(address) => {
                debug!("Lookup {} -> {}", id, address);
                json_response(StatusCode::OK, &AddressRecord { id, address })
            }
            None => {
                debug!("Lookup miss for {:?}", id);
                self.metrics.inc_lookup_misses();
                json_response(StatusCode::NOT_FOUND, &"peer not found")
            }
        }
    }

    fn list(&self) -> Response<String> {
        self.metrics.inc_list_requests();
        json_response(StatusCode::OK, &self.registry.list())
    }

    fn bad_request(&self, reason: String) -> Response<String> {
        warn!("Rejected registration: {}", reason);
        self.metrics.inc_bad_requests();
        json_response(StatusCode::NOT_FOUND, &reason)
    }
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<String> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<String> {
    match serde_json::to_string(value) {
        Ok(body) => {
            let mut resp = text_response(status, body);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!("Failed to encode response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Serve the registry on an already-bound listener until the task is dropped.
pub async fn serve_registry(listener: TcpListener, service: RegistryService) -> Result<()> {
    info!("Registry listening on http://{}", listener.local_addr()?);

    accept_loop(listener, move |req| {
        let service = service.clone();
        async move { service.handle(req).await }
    })
    .await
}

/// Start the HTTP metrics server on the specified port.
pub async fn serve_metrics(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    accept_loop(listener, move |req: Request<hyper::body::Incoming>| {
        let metrics = Arc::clone(&metrics);
        async move {
            let resp = match req.uri().path() {
                "/metrics" => text_response(StatusCode::OK, metrics.to_prometheus()),
                "/health" => text_response(StatusCode::OK, "OK"),
                _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
            };
            Ok::<_, Infallible>(resp)
        }
    })
    .await
}

/// One tokio task per accepted connection.
async fn accept_loop<H, Fut>(listener: TcpListener, handler: H) -> Result<()>
where
    H: Fn(Request<hyper::body::Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<String>, Infallible>> + Send + 'static,
{
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(handler));

            if let Err(e) = conn.await {
                error!("Connection error from {}: {}", remote, e);
            }
        });
    }
}
