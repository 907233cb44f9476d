use http::{
    HeaderValue, Method, Request, Response, StatusCode,
    header::CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
};
use request_counter::Counter;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Body of a successful response
#[derive(Debug, Serialize)]
struct CounterResponse {
    request_counter: usize,
}

/// Start http listening task.
///
/// Once the token is cancelled the listener is closed, and open connections get
/// up to `shutdown_timeout` to finish before the task returns.
pub fn start_http_task(
    listener: TcpListener,
    counter: Arc<Counter>,
    token: CancellationToken,
    shutdown_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn(async move {
        let builder = auto::Builder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Error accepting connection: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            debug!("New connection from: {remote_addr}");

            let thread_counter = counter.clone();
            let conn = builder
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| {
                        handle_http_request(thread_counter.clone(), remote_addr, req)
                    }),
                )
                .into_owned();
            let conn = graceful.watch(conn);

            // Serve the connection using auto protocol detection (HTTP/1 or HTTP/2)
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    error!("Error serving connection: {err}");
                }
            });
        }

        drop(listener);
        info!("Stopped accepting http connections, draining open ones");
        tokio::select! {
            _ = graceful.shutdown() => info!("All http connections closed"),
            _ = tokio::time::sleep(shutdown_timeout) => warn!(
                "Gave up on open http connections after {}",
                humantime::format_duration(shutdown_timeout)
            ),
        }
    })
}

async fn handle_http_request<B>(
    counter: Arc<Counter>,
    remote_addr: SocketAddr,
    req: Request<B>,
) -> Result<Response<String>, Infallible> {
    Ok(handle_http_request_impl(&counter, remote_addr, req).await)
}

async fn handle_http_request_impl<B>(
    counter: &Counter,
    remote_addr: SocketAddr,
    req: Request<B>,
) -> Response<String> {
    fn err_resp(code: StatusCode, text: impl Into<String>) -> Response<String> {
        let mut resp = Response::new(text.into());
        *resp.status_mut() = code;
        resp
    }

    match req.uri().path() {
        "/" => {
            if !matches!(req.method(), &Method::GET | &Method::HEAD) {
                return err_resp(StatusCode::METHOD_NOT_ALLOWED, "Use GET or HEAD with this route");
            }
            let count = counter.record_and_count().await;
            let resp = counter_response(count);
            info!("Request from {remote_addr} has been handled");
            resp
        }
        _ => err_resp(
            StatusCode::NOT_FOUND,
            format!("Not found '{} {}'", req.method(), req.uri().path()),
        ),
    }
}

/// Render the count as `{"request_counter": n}`. An encoding failure is a 500 with no body.
fn counter_response(count: usize) -> Response<String> {
    match serde_json::to_string(&CounterResponse {
        request_counter: count,
    }) {
        Ok(body) => {
            let mut resp = Response::new(body);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(err) => {
            error!("Could not encode response: {err}");
            let mut resp = Response::new(String::new());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use request_counter::CounterConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn get(path: &str) -> Request<String> {
        Request::builder().uri(path).body(String::new()).unwrap()
    }

    #[test]
    fn test_counter_response_body() {
        let resp = counter_response(7);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), r#"{"request_counter":7}"#);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_handler_counts_requests() {
        let dir = TempDir::new().unwrap();
        let counter = Counter::new(CounterConfig::new(dir.path().join("requests.log"))).unwrap();
        let token = CancellationToken::new();
        let tasks = counter.start(token.clone()).await.unwrap();

        for expected in 1..=3 {
            let resp = handle_http_request_impl(&counter, remote(), get("/")).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.body(), &format!(r#"{{"request_counter":{expected}}}"#));
        }

        let resp = handle_http_request_impl(&counter, remote(), get("/favicon.ico")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let post = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(String::new())
            .unwrap();
        let resp = handle_http_request_impl(&counter, remote(), post).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        // Rejected requests are not counted
        assert_eq!(counter.count(), 3);

        token.cancel();
        tasks.join().await;
    }

    #[tokio::test]
    async fn test_http_task_serves_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let counter = Arc::new(
            Counter::new(CounterConfig::new(dir.path().join("requests.log"))).unwrap(),
        );
        let token = CancellationToken::new();
        let tasks = counter.start(token.clone()).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let http_task = start_http_task(
            listener,
            counter.clone(),
            token.clone(),
            Duration::from_secs(1),
        );

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with(r#"{"request_counter":1}"#), "{response}");

        token.cancel();
        http_task.await.unwrap();
        tasks.join().await;
        assert_eq!(counter.count(), 1);
    }
}
