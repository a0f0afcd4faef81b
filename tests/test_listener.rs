use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchyard::events::{Event, EventSink, Events};
use switchyard::http::connection::{ServerContext, ServerSettings};
use switchyard::http::framer::{FramingLimits, MessageFramer};
use switchyard::http::request::{Method, Request};
use switchyard::http::response::{Response, ResponseBuilder, StatusCode};
use switchyard::routing::{
    error_handler_fn, handler_fn, AuthRequirement, RouteOptions, RouteTree, TokenAuthenticator,
};
use switchyard::BoxFuture;
use switchyard::server::listener::{Listener, ListenerHandle, ListenerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn settings() -> ServerSettings {
    ServerSettings {
        read_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        limits: FramingLimits::default(),
    }
}

fn routes() -> RouteTree {
    let mut tree = RouteTree::new().with_authenticator(Arc::new(TokenAuthenticator::new(["t0k"])));
    tree.register(
        "*",
        Method::GET,
        "/hello/:name",
        "*/*",
        handler_fn(|_req, params| async move {
            let name = params.get("name").unwrap_or("nobody").to_string();
            Ok(Response::ok(format!("hello {name}")))
        }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.register(
        "*",
        Method::POST,
        "/echo",
        "*/*",
        handler_fn(|req, _params| async move { Ok(Response::ok(req.body)) }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/slow",
        "*/*",
        handler_fn(|_req, _params| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Response::ok("finally"))
        }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/fail",
        "*/*",
        handler_fn(|_req, _params| async { Err(anyhow::anyhow!("backend exploded")) }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/panic",
        "*/*",
        handler_fn(|_req, _params| async {
            if true {
                panic!("handler bug");
            }
            Ok(Response::ok("unreachable"))
        }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/admin",
        "*/*",
        handler_fn(|_req, _params| async { Ok(Response::ok("admin")) }),
        RouteOptions::new().auth(AuthRequirement::Required),
    )
    .unwrap();
    tree.register(
        "*",
        Method::POST,
        "/json",
        "application/json",
        handler_fn(|_req, _params| async { Ok(Response::ok("json")) }),
        RouteOptions::new(),
    )
    .unwrap();
    tree.path_settings("*", Method::POST, "/json")
        .unwrap()
        .on_error(error_handler_fn(|_req, err| {
            Ok(ResponseBuilder::new(err.status())
                .header("X-Route-Error", "json")
                .body("custom")
                .build())
        }));
    tree
}

async fn start() -> (SocketAddr, ListenerHandle, JoinHandle<anyhow::Result<()>>) {
    start_with(ServerContext::new(Arc::new(routes()), settings())).await
}

async fn start_with(ctx: ServerContext) -> (SocketAddr, ListenerHandle, JoinHandle<anyhow::Result<()>>) {
    let listener = Listener::bind(&["127.0.0.1:0"], ctx).await.unwrap();
    let addr = listener.local_addrs()[0];
    let handle = listener.handle();
    let task = tokio::spawn(listener.run());
    (addr, handle, task)
}

async fn connect(addr: SocketAddr) -> MessageFramer<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    MessageFramer::new(stream, FramingLimits::default())
}

async fn exchange(conn: &mut MessageFramer<TcpStream>, req: &Request) -> Response {
    conn.write_request(req).await.unwrap();
    conn.read_response(Instant::now() + Duration::from_secs(5), req.method)
        .await
        .unwrap()
}

fn text(resp: &Response) -> &str {
    std::str::from_utf8(&resp.body).unwrap()
}

/// True once the server has closed its end.
async fn closed_by_server(conn: &mut MessageFramer<TcpStream>) -> bool {
    let mut buf = [0u8; 16];
    matches!(
        tokio::time::timeout(Duration::from_secs(3), conn.get_mut().read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test]
async fn test_persistent_connection_serves_in_order() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    let resp = exchange(&mut conn, &Request::new(Method::GET, "/hello/ada")).await;
    assert_eq!(resp.status, StatusCode::Ok);
    assert_eq!(text(&resp), "hello ada");
    assert!(!resp.wants_close());

    let mut post = Request::new(Method::POST, "/echo");
    post.body = "ping".into();
    let resp = exchange(&mut conn, &post).await;
    assert_eq!(text(&resp), "ping");

    let resp = exchange(&mut conn, &Request::new(Method::GET, "/hello/bob")).await;
    assert_eq!(text(&resp), "hello bob");

    handle.stop();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    conn.get_mut()
        .write_all(b"GET /hello/one HTTP/1.1\r\n\r\nGET /hello/two HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let first = conn.read_response(deadline, Method::GET).await.unwrap();
    let second = conn.read_response(deadline, Method::GET).await.unwrap();
    assert_eq!(text(&first), "hello one");
    assert_eq!(text(&second), "hello two");

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_routing_failures_become_responses() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    let resp = exchange(&mut conn, &Request::new(Method::GET, "/missing")).await;
    assert_eq!(resp.status, StatusCode::NotFound);

    let resp = exchange(&mut conn, &Request::new(Method::GET, "/admin")).await;
    assert_eq!(resp.status, StatusCode::Unauthorized);
    assert_eq!(resp.header("WWW-Authenticate"), Some("Bearer realm=\"switchyard\""));

    let mut authed = Request::new(Method::GET, "/admin");
    authed.headers.insert("Authorization", "Bearer t0k");
    let resp = exchange(&mut conn, &authed).await;
    assert_eq!(text(&resp), "admin");

    let mut wrong_type = Request::new(Method::POST, "/json");
    wrong_type.headers.insert("Content-Type", "text/plain");
    let resp = exchange(&mut conn, &wrong_type).await;
    assert_eq!(resp.status, StatusCode::NotAcceptable);
    assert_eq!(resp.header("X-Route-Error"), Some("json"));
    assert_eq!(text(&resp), "custom");

    // Route misses do not cost the connection.
    let resp = exchange(&mut conn, &Request::new(Method::GET, "/hello/x")).await;
    assert_eq!(resp.status, StatusCode::Ok);

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_error_returns_500_and_closes() {
    let (addr, handle, task) = start().await;

    for path in ["/fail", "/panic"] {
        let mut conn = connect(addr).await;
        let resp = exchange(&mut conn, &Request::new(Method::GET, path)).await;
        assert_eq!(resp.status, StatusCode::InternalServerError);
        assert!(resp.wants_close());
        assert!(closed_by_server(&mut conn).await);
    }

    // The listener keeps serving other connections.
    let mut conn = connect(addr).await;
    let resp = exchange(&mut conn, &Request::new(Method::GET, "/hello/still")).await;
    assert_eq!(resp.status, StatusCode::Ok);

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    conn.get_mut()
        .write_all(b"GET /a HTTP/1.1\r\nBroken header line\r\n\r\n")
        .await
        .unwrap();
    let resp = conn
        .read_response(Instant::now() + Duration::from_secs(5), Method::GET)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::BadRequest);
    assert!(closed_by_server(&mut conn).await);

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    let mut req = Request::new(Method::GET, "/hello/old");
    req.version = "HTTP/1.0".to_string();
    let resp = exchange(&mut conn, &req).await;
    assert_eq!(text(&resp), "hello old");
    assert!(resp.wants_close());
    assert!(closed_by_server(&mut conn).await);

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_drains_in_flight_request() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;

    conn.write_request(&Request::new(Method::GET, "/slow")).await.unwrap();
    // Let the worker start dispatching before stopping.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.active(), 1);
    handle.stop();
    assert_ne!(handle.state(), ListenerState::Running);

    let resp = conn
        .read_response(Instant::now() + Duration::from_secs(5), Method::GET)
        .await
        .unwrap();
    assert_eq!(text(&resp), "finally");
    assert!(resp.wants_close());

    handle.stopped().await;
    task.await.unwrap().unwrap();
    assert_eq!(handle.active(), 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stop_closes_idle_connections_promptly() {
    let (addr, handle, task) = start().await;
    let mut conn = connect(addr).await;
    let resp = exchange(&mut conn, &Request::new(Method::GET, "/hello/idle")).await;
    assert_eq!(resp.status, StatusCode::Ok);

    let started = Instant::now();
    handle.stop();
    assert!(closed_by_server(&mut conn).await);
    task.await.unwrap().unwrap();
    // Well inside the grace period: nothing was in flight.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl EventSink for Recorder {
    fn record(&self, event: Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> {
        let line = match &*event {
            Event::Request { request, .. } => format!("request {}", request.path),
            Event::Response { response, .. } => format!("response {}", response.status.as_u16()),
            Event::Error { error, .. } => format!("error {error}"),
        };
        self.events.lock().unwrap().push(line);
        Box::pin(async { Ok(()) })
    }
}

#[tokio::test]
async fn test_events_reach_sinks() {
    let recorder = Arc::new(Recorder::default());
    let ctx = ServerContext::new(Arc::new(routes()), settings())
        .with_events(Events::default().with_sink(recorder.clone()));
    let (addr, handle, task) = start_with(ctx).await;

    let mut conn = connect(addr).await;
    exchange(&mut conn, &Request::new(Method::GET, "/hello/events")).await;
    let mut conn = connect(addr).await;
    exchange(&mut conn, &Request::new(Method::GET, "/fail")).await;

    let deadline = Instant::now() + Duration::from_secs(3);
    while recorder.events.lock().unwrap().len() < 5 {
        assert!(Instant::now() < deadline, "events not delivered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let events = recorder.events.lock().unwrap().clone();
    assert!(events.contains(&"request /hello/events".to_string()));
    assert!(events.contains(&"response 200".to_string()));
    assert!(events.contains(&"request /fail".to_string()));
    assert!(events.iter().any(|e| e.starts_with("error") && e.contains("backend exploded")));
    assert!(events.contains(&"response 500".to_string()));

    handle.stop();
    task.await.unwrap().unwrap();
}
