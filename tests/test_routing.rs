use std::sync::Arc;

use switchyard::error::Error;
use switchyard::http::request::{Method, Request};
use switchyard::http::response::{Response, ResponseBuilder, StatusCode};
use switchyard::routing::{
    error_handler_fn, handler_fn, AuthRequirement, BoxHandler, ConflictPolicy, MethodKey,
    RouteError, RouteOptions, RouteQuery, RouteTree, TokenAuthenticator,
};

fn named(name: &'static str) -> BoxHandler {
    handler_fn(move |_req, _params| async move { Ok(Response::ok(name)) })
}

async fn body_of(tree: &RouteTree, req: Request) -> String {
    let matched = match tree.resolve(&req) {
        Ok(m) => m,
        Err(miss) => panic!("expected a match, got {:?}", miss.error),
    };
    let response = matched.handler.call(req, matched.params).await.unwrap();
    String::from_utf8(response.body.to_vec()).unwrap()
}

fn get(path: &str) -> Request {
    Request::new(Method::GET, path)
}

fn with_header(mut req: Request, name: &str, value: &str) -> Request {
    req.headers.insert(name, value);
    req
}

#[tokio::test]
async fn test_literal_beats_parameter_regardless_of_order() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/users/:id", "*/*", named("by-id"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::GET, "/users/me", "*/*", named("me"), RouteOptions::new())
        .unwrap();

    assert_eq!(body_of(&tree, get("/users/me")).await, "me");
    assert_eq!(body_of(&tree, get("/users/42")).await, "by-id");
}

#[tokio::test]
async fn test_path_parameters_are_extracted() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/repos/{owner}/:repo/*rest", "*/*", named("x"), RouteOptions::new())
        .unwrap();

    let matched = tree.resolve(&get("/repos/acme/widgets/blob/main/README?raw=1")).ok().unwrap();
    assert_eq!(matched.params.get("owner"), Some("acme"));
    assert_eq!(matched.params.get("repo"), Some("widgets"));
    assert_eq!(matched.params.get("rest"), Some("blob/main/README"));
    assert_eq!(matched.template, "/repos/{owner}/:repo/*rest");
}

#[tokio::test]
async fn test_parameter_beats_wildcard() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/files/*path", "*/*", named("wild"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::GET, "/files/:name", "*/*", named("param"), RouteOptions::new())
        .unwrap();

    assert_eq!(body_of(&tree, get("/files/a.txt")).await, "param");
    assert_eq!(body_of(&tree, get("/files/dir/a.txt")).await, "wild");
    assert_eq!(body_of(&tree, get("/files")).await, "wild");
}

#[test]
fn test_duplicate_registration_fails_and_keeps_original() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/a", "*/*", named("first"), RouteOptions::new())
        .unwrap();

    let err = tree
        .register("*", Method::GET, "/a", "*/*", named("second"), RouteOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRoute(_)));

    // Same shape with a different parameter name is the same route.
    let err = tree
        .register("*", Method::GET, "/u/:x", "*/*", named("x"), RouteOptions::new())
        .and_then(|_| tree.register("*", Method::GET, "/u/:y", "*/*", named("y"), RouteOptions::new()))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRoute(_)));
    assert_eq!(tree.len(), 2);
}

#[tokio::test]
async fn test_conflict_policies() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/a", "*/*", named("first"), RouteOptions::new())
        .unwrap();

    tree.register(
        "*",
        Method::GET,
        "/a",
        "*/*",
        named("ignored"),
        RouteOptions::new().on_conflict(ConflictPolicy::Ignore),
    )
    .unwrap();
    assert_eq!(body_of(&tree, get("/a")).await, "first");

    tree.register(
        "*",
        Method::GET,
        "/a",
        "*/*",
        named("replaced"),
        RouteOptions::new().on_conflict(ConflictPolicy::Replace),
    )
    .unwrap();
    assert_eq!(body_of(&tree, get("/a")).await, "replaced");
    assert_eq!(tree.len(), 1);
}

#[test]
fn test_invalid_templates_rejected() {
    let mut tree = RouteTree::new();
    let err = tree
        .register("*", Method::GET, "/a/*rest/b", "*/*", named("x"), RouteOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRoute(_)));

    let err = tree
        .register("*", Method::GET, "/a", "not a type", named("x"), RouteOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRoute(_)));
}

#[tokio::test]
async fn test_content_type_selection() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::POST, "/doc", "application/json", named("json"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::POST, "/doc", "text/*", named("text"), RouteOptions::new())
        .unwrap();

    let post = |ct: &str| with_header(Request::new(Method::POST, "/doc"), "Content-Type", ct);

    assert_eq!(body_of(&tree, post("application/json; charset=utf-8")).await, "json");
    assert_eq!(body_of(&tree, post("text/csv")).await, "text");

    let miss = tree.resolve(&post("image/png")).err().unwrap();
    assert_eq!(miss.error, RouteError::NoAcceptableContentType);
    assert_eq!(miss.error.status(), StatusCode::NotAcceptable);
}

#[tokio::test]
async fn test_missing_content_type_prefers_catch_all() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::POST, "/doc", "application/json", named("json"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::POST, "/doc", "*/*", named("any"), RouteOptions::new())
        .unwrap();

    assert_eq!(body_of(&tree, Request::new(Method::POST, "/doc")).await, "any");
}

#[tokio::test]
async fn test_host_and_method_fallthrough() {
    let mut tree = RouteTree::new();
    tree.register("api.example.com", Method::GET, "/", "*/*", named("api"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::GET, "/", "*/*", named("default"), RouteOptions::new())
        .unwrap();
    tree.register("*", MethodKey::Any, "/any", "*/*", named("any-method"), RouteOptions::new())
        .unwrap();

    assert_eq!(
        body_of(&tree, with_header(get("/"), "Host", "API.example.com:8443")).await,
        "api"
    );
    assert_eq!(
        body_of(&tree, with_header(get("/"), "Host", "other.example.com")).await,
        "default"
    );
    assert_eq!(body_of(&tree, get("/")).await, "default");
    assert_eq!(
        body_of(&tree, Request::new(Method::DELETE, "/any")).await,
        "any-method"
    );

    // The exact host has no /any route, so the wildcard host answers.
    assert_eq!(
        body_of(&tree, with_header(Request::new(Method::PUT, "/any"), "Host", "api.example.com")).await,
        "any-method"
    );
}

#[test]
fn test_unmatched_path_is_not_found() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/a", "*/*", named("a"), RouteOptions::new())
        .unwrap();

    let miss = tree.resolve(&get("/b")).err().unwrap();
    assert_eq!(miss.error, RouteError::NotFound);
    let miss = tree.resolve(&Request::new(Method::POST, "/a")).err().unwrap();
    assert_eq!(miss.error, RouteError::NotFound);
    assert!(miss.error_handler.is_none());
}

#[tokio::test]
async fn test_authentication_is_inherited() {
    let mut tree = RouteTree::new()
        .with_authenticator(Arc::new(TokenAuthenticator::new(["s3cret"])));
    tree.host_settings("*").require_auth(AuthRequirement::Required);
    tree.register("*", Method::GET, "/private", "*/*", named("private"), RouteOptions::new())
        .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/public",
        "*/*",
        named("public"),
        RouteOptions::new().auth(AuthRequirement::None),
    )
    .unwrap();

    let miss = tree.resolve(&get("/private")).err().unwrap();
    assert_eq!(miss.error, RouteError::AuthenticationRequired);
    assert_eq!(miss.error.status(), StatusCode::Unauthorized);

    let wrong = with_header(get("/private"), "Authorization", "Bearer nope");
    assert!(tree.resolve(&wrong).is_err());

    let authed = with_header(get("/private"), "Authorization", "Bearer s3cret");
    assert_eq!(body_of(&tree, authed).await, "private");
    assert_eq!(body_of(&tree, get("/public")).await, "public");
}

#[test]
fn test_match_route_with_query() {
    let mut tree = RouteTree::new();
    tree.method_settings("*", Method::GET)
        .require_auth(AuthRequirement::Required);
    tree.register("*", Method::GET, "/x", "*/*", named("x"), RouteOptions::new())
        .unwrap();

    let mut query = RouteQuery {
        host: None,
        method: Method::GET,
        path: "/x?y=1",
        content_type: None,
        authenticated: false,
    };
    assert_eq!(
        tree.match_route(&query).err().unwrap().error,
        RouteError::AuthenticationRequired
    );

    query.authenticated = true;
    assert!(tree.match_route(&query).is_ok());
}

#[test]
fn test_nearest_error_handler_is_returned() {
    let mut tree = RouteTree::new();
    tree.root_settings().on_error(error_handler_fn(|_req, err| {
        Ok(ResponseBuilder::new(err.status()).body("root").build())
    }));
    tree.method_settings("*", Method::POST).on_error(error_handler_fn(|_req, _err| {
        Ok(ResponseBuilder::new(StatusCode::BadRequest).body("post").build())
    }));
    tree.register("*", Method::POST, "/p", "application/json", named("p"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::GET, "/g", "*/*", named("g"), RouteOptions::new())
        .unwrap();

    let req = with_header(Request::new(Method::POST, "/p"), "Content-Type", "text/plain");
    let miss = tree.resolve(&req).err().unwrap();
    let handler = miss.error_handler.clone().unwrap();
    let response = handler(&req, &miss.error).unwrap();
    assert_eq!(&response.body[..], b"post");

    let req = get("/nowhere");
    let miss = tree.resolve(&req).err().unwrap();
    let response = (miss.error_handler.clone().unwrap())(&req, &miss.error).unwrap();
    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(&response.body[..], b"root");
}

#[tokio::test]
async fn test_unacceptable_content_type_does_not_fall_to_weaker_path() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::POST, "/users/me", "application/json", named("me"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::POST, "/users/:id", "text/plain", named("by-id"), RouteOptions::new())
        .unwrap();

    let post = |path: &str, ct: &str| with_header(Request::new(Method::POST, path), "Content-Type", ct);

    let miss = tree.resolve(&post("/users/me", "text/plain")).err().unwrap();
    assert_eq!(miss.error, RouteError::NoAcceptableContentType);

    assert_eq!(body_of(&tree, post("/users/me", "application/json")).await, "me");
    assert_eq!(body_of(&tree, post("/users/42", "text/plain")).await, "by-id");
}

#[test]
fn test_settings_only_path_does_not_shadow_routes() {
    let mut tree = RouteTree::new();
    tree.path_settings("*", Method::GET, "/files/readme").unwrap();
    tree.register("*", Method::GET, "/files/:name", "*/*", named("file"), RouteOptions::new())
        .unwrap();

    let matched = tree.resolve(&get("/files/readme")).ok().unwrap();
    assert_eq!(matched.params.get("name"), Some("readme"));
}

#[tokio::test]
async fn test_replaced_route_uses_its_own_parameter_names() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::GET, "/users/:id", "*/*", named("old"), RouteOptions::new())
        .unwrap();
    tree.register(
        "*",
        Method::GET,
        "/users/{uid}",
        "*/*",
        named("new"),
        RouteOptions::new().on_conflict(ConflictPolicy::Replace),
    )
    .unwrap();

    let matched = tree.resolve(&get("/users/42")).ok().unwrap();
    assert_eq!(matched.template, "/users/{uid}");
    assert_eq!(matched.params.get("uid"), Some("42"));
    assert_eq!(matched.params.get("id"), None);
    assert_eq!(body_of(&tree, get("/users/42")).await, "new");
}

#[test]
fn test_sibling_content_types_keep_their_parameter_names() {
    let mut tree = RouteTree::new();
    tree.register("*", Method::PUT, "/docs/:id", "application/json", named("json"), RouteOptions::new())
        .unwrap();
    tree.register("*", Method::PUT, "/docs/{doc}", "text/plain", named("text"), RouteOptions::new())
        .unwrap();

    let req = with_header(Request::new(Method::PUT, "/docs/7"), "Content-Type", "text/plain");
    let matched = tree.resolve(&req).ok().unwrap();
    assert_eq!(matched.params.get("doc"), Some("7"));

    let req = with_header(Request::new(Method::PUT, "/docs/7"), "Content-Type", "application/json");
    let matched = tree.resolve(&req).ok().unwrap();
    assert_eq!(matched.params.get("id"), Some("7"));
}
