use super::Collectable;
use futures_util::future::{BoxFuture, FutureExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, header};
use log::warn;
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use prometheus::{Encoder as _, TextEncoder};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

pub(super) type RouteMap = RwLock<HashMap<String, Vec<Arc<dyn Collectable>>>>;

#[derive(Clone)]
pub(super) struct Router {
    routes: Arc<RouteMap>,
}

impl Router {
    pub(super) fn new(routes: Arc<RouteMap>) -> Self {
        Self { routes }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let res = Response::builder();

        if req.method() != Method::GET {
            return res
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::new()))
                .unwrap();
        }

        let Ok(path) = percent_decode_str(req.uri().path()).decode_utf8() else {
            return res
                .status(StatusCode::BAD_REQUEST)
                .body(Full::from("can't percent-decode URI path as valid UTF-8"))
                .unwrap();
        };

        let collectors: Vec<_> = match self.routes.read().get(path.as_ref()) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                return res
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::new()))
                    .unwrap();
            }
        };

        // Collection can do blocking I/O (the mux collector scrapes
        // workers over loopback), so it runs off the server runtime.
        match tokio::task::spawn_blocking(move || encode_exposition(&collectors)).await {
            Ok(Ok(buffer)) => res
                .header(header::CONTENT_TYPE, TextEncoder::new().format_type())
                .body(Full::from(buffer))
                .unwrap(),
            Ok(Err(err)) => {
                warn!("failed to encode metrics exposition: {err}");
                res.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::from(err.to_string()))
                    .unwrap()
            }
            Err(err) => {
                warn!("metrics collection task failed: {err}");
                res.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            }
        }
    }
}

impl Service<Request<Incoming>> for Router {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.clone();

        async move { Ok(router.handle_request(req).await) }.boxed()
    }
}

fn encode_exposition(collectors: &[Arc<dyn Collectable>]) -> prometheus::Result<Vec<u8>> {
    let mut families = Vec::new();
    for collector in collectors {
        families.extend(collector.collect());
    }

    let mut buffer = Vec::with_capacity(1024);
    TextEncoder::new().encode(&families, &mut buffer)?;

    Ok(buffer)
}
