//! Route tree and route-template resolution
//!
//! Maps a concrete request path (`/product/17`) back to the declared template
//! it matched (`/product/{id}`), descending into mounted sub-routers, so that
//! the `path` label stays bounded no matter how many concrete paths exist.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use http::Method;
use regex::Regex;

use crate::error::{Error, Result};

/// Capture group name used by mounts for the unmatched remainder of the path.
const MOUNT_TAIL: &str = "__mount_tail";

static PARAM_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)(?::([a-zA-Z_][a-zA-Z0-9_]*))?\}")
        .expect("failed to compile path parameter pattern")
});

/// Three-way result of matching a route node against a request scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    None,
    /// The path matched but the node cannot terminally handle the request
    /// (for example the method is not allowed).
    Partial,
    Full,
}

/// The slice of a request that route matching looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub method: Method,
    /// Path relative to `root_path`.
    pub path: String,
    pub path_params: BTreeMap<String, String>,
    pub root_path: String,
}

impl RequestScope {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            path_params: BTreeMap::new(),
            root_path: String::new(),
        }
    }

    #[must_use]
    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }
}

/// A node of the application's route tree.
pub trait RouteNode: Send + Sync + fmt::Debug {
    /// Match the node against `scope`, returning the child scope produced by
    /// the match (path params merged, mount prefix consumed).
    fn matches(&self, scope: &RequestScope) -> (Match, Option<RequestScope>);

    /// Declared template of this node.
    fn path(&self) -> Option<&str>;

    /// Nested nodes for mounts; empty for endpoints and mounted applications.
    fn routes(&self) -> &[Arc<dyn RouteNode>] {
        &[]
    }
}

/// Compiled form of a path template.
#[derive(Debug, Clone)]
struct PathPattern {
    /// Regex body without anchors.
    body: String,
    params: Vec<String>,
}

fn converter_pattern(path: &str, converter: &str) -> Result<&'static str> {
    match converter {
        "str" => Ok("[^/]+"),
        "path" => Ok(".*"),
        "int" => Ok("[0-9]+"),
        "float" => Ok(r"[0-9]+(?:\.[0-9]+)?"),
        "uuid" => Ok("[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"),
        other => Err(Error::invalid_route(
            path,
            format!("unknown path converter {other:?}"),
        )),
    }
}

/// Template regex failures are route errors, whatever the underlying cause.
fn compile_regex(template: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::invalid_route(template, e.to_string()))
}

fn compile_template(template: &str) -> Result<PathPattern> {
    let mut body = String::with_capacity(template.len() * 2);
    let mut params: Vec<String> = Vec::new();
    let mut last = 0;

    for caps in PARAM_PATTERN.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        if name == MOUNT_TAIL {
            return Err(Error::invalid_route(template, "reserved parameter name"));
        }
        if params.iter().any(|p| p == name) {
            return Err(Error::invalid_route(
                template,
                format!("duplicated parameter {name:?}"),
            ));
        }
        let converter = caps.get(2).map_or("str", |m| m.as_str());
        let pattern = converter_pattern(template, converter)?;

        body.push_str(&regex::escape(&template[last..whole.start()]));
        body.push_str(&format!("(?P<{name}>{pattern})"));
        params.push(name.to_string());
        last = whole.end();
    }
    body.push_str(&regex::escape(&template[last..]));

    Ok(PathPattern { body, params })
}

fn collect_params(
    regex: &Regex,
    names: &[String],
    scope: &RequestScope,
) -> Option<(BTreeMap<String, String>, Option<String>)> {
    let caps = regex.captures(&scope.path)?;
    let mut params = scope.path_params.clone();
    for name in names {
        if let Some(value) = caps.name(name) {
            params.insert(name.clone(), value.as_str().to_string());
        }
    }
    let tail = caps.name(MOUNT_TAIL).map(|m| m.as_str().to_string());
    Some((params, tail))
}

/// A terminal endpoint.
#[derive(Debug, Clone)]
pub struct Route {
    path: String,
    regex: Regex,
    params: Vec<String>,
    methods: Option<Vec<Method>>,
}

impl Route {
    /// Endpoint accepting only `methods`; `GET` implies `HEAD`.
    pub fn new(path: &str, methods: impl IntoIterator<Item = Method>) -> Result<Self> {
        let mut methods: Vec<Method> = methods.into_iter().collect();
        if methods.contains(&Method::GET) && !methods.contains(&Method::HEAD) {
            methods.push(Method::HEAD);
        }
        Self::build(path, Some(methods))
    }

    /// Endpoint accepting every method.
    pub fn any(path: &str) -> Result<Self> {
        Self::build(path, None)
    }

    fn build(path: &str, methods: Option<Vec<Method>>) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::invalid_route(path, "routed paths must start with '/'"));
        }
        let pattern = compile_template(path)?;
        let regex = compile_regex(path, &format!("^{}$", pattern.body))?;
        Ok(Self {
            path: path.to_string(),
            regex,
            params: pattern.params,
            methods,
        })
    }

    fn allows(&self, method: &Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method))
    }
}

impl RouteNode for Route {
    fn matches(&self, scope: &RequestScope) -> (Match, Option<RequestScope>) {
        let Some((path_params, _)) = collect_params(&self.regex, &self.params, scope) else {
            return (Match::None, None);
        };
        let child = RequestScope {
            path_params,
            ..scope.clone()
        };
        if self.allows(&scope.method) {
            (Match::Full, Some(child))
        } else {
            (Match::Partial, Some(child))
        }
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }
}

/// A sub-router or sub-application attached under a prefix.
#[derive(Debug, Clone)]
pub struct Mount {
    path: String,
    regex: Regex,
    params: Vec<String>,
    routes: Vec<Arc<dyn RouteNode>>,
}

impl Mount {
    /// Mount a nested router under `path`.
    pub fn new(path: &str, router: Router) -> Result<Self> {
        Self::build(path, router.routes)
    }

    /// Mount a terminal application (static files, a foreign service) that
    /// has no route tree of its own. It resolves to the mount prefix.
    pub fn app(path: &str) -> Result<Self> {
        Self::build(path, Vec::new())
    }

    fn build(path: &str, routes: Vec<Arc<dyn RouteNode>>) -> Result<Self> {
        let path = path.trim_end_matches('/');
        if !path.is_empty() && !path.starts_with('/') {
            return Err(Error::invalid_route(path, "routed paths must start with '/'"));
        }
        let pattern = compile_template(path)?;
        let regex = compile_regex(path, &format!("^{}/(?P<{MOUNT_TAIL}>.*)$", pattern.body))?;
        Ok(Self {
            path: path.to_string(),
            regex,
            params: pattern.params,
            routes,
        })
    }
}

impl RouteNode for Mount {
    fn matches(&self, scope: &RequestScope) -> (Match, Option<RequestScope>) {
        let Some((path_params, tail)) = collect_params(&self.regex, &self.params, scope) else {
            return (Match::None, None);
        };
        let remaining = format!("/{}", tail.unwrap_or_default());
        let matched = &scope.path[..scope.path.len() - remaining.len()];
        let child = RequestScope {
            method: scope.method.clone(),
            path: remaining.clone(),
            path_params,
            root_path: format!("{}{matched}", scope.root_path),
        };
        (Match::Full, Some(child))
    }

    fn path(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn routes(&self) -> &[Arc<dyn RouteNode>] {
        &self.routes
    }
}

/// Ordered collection of route nodes; declaration order decides ties.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Arc<dyn RouteNode>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, path: &str, methods: impl IntoIterator<Item = Method>) -> Result<Self> {
        Ok(self.node(Route::new(path, methods)?))
    }

    pub fn route_any(self, path: &str) -> Result<Self> {
        Ok(self.node(Route::any(path)?))
    }

    pub fn mount(self, path: &str, router: Router) -> Result<Self> {
        Ok(self.node(Mount::new(path, router)?))
    }

    pub fn mount_app(self, path: &str) -> Result<Self> {
        Ok(self.node(Mount::app(path)?))
    }

    #[must_use]
    pub fn node(mut self, node: impl RouteNode + 'static) -> Self {
        self.routes.push(Arc::new(node));
        self
    }

    pub fn routes(&self) -> &[Arc<dyn RouteNode>] {
        &self.routes
    }

    pub fn resolve(&self, scope: &RequestScope) -> Option<String> {
        resolve(scope, &self.routes)
    }
}

/// Find the declared template for `scope`.
///
/// The first FULL match wins. A FULL match on a mount descends into its
/// nested routes and concatenates the templates; if nothing inside the mount
/// matches, the request is unresolved. The first PARTIAL match at the
/// outermost level is kept as a fallback for when no FULL match follows.
pub fn resolve(scope: &RequestScope, routes: &[Arc<dyn RouteNode>]) -> Option<String> {
    resolve_in(scope, routes, true)
}

fn resolve_in(scope: &RequestScope, routes: &[Arc<dyn RouteNode>], outermost: bool) -> Option<String> {
    let mut fallback: Option<&str> = None;

    for route in routes {
        match route.matches(scope) {
            (Match::Full, child) => {
                let template = route.path()?;
                let nested = route.routes();
                if nested.is_empty() {
                    return Some(template.to_string());
                }
                let child = child.unwrap_or_else(|| scope.clone());
                return resolve_in(&child, nested, false).map(|inner| format!("{template}{inner}"));
            }
            (Match::Partial, _) if outermost && fallback.is_none() => {
                fallback = route.path();
            }
            _ => {}
        }
    }

    fallback.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> Router {
        let mounted = Router::new()
            .route("/test/{item}", [Method::GET])
            .unwrap()
            .route_any("/test")
            .unwrap();

        Router::new()
            .route_any("/200")
            .unwrap()
            .route("/200/{test_param}", [Method::GET, Method::POST, Method::OPTIONS])
            .unwrap()
            .route("/items/{id:int}", [Method::GET])
            .unwrap()
            .mount("/mounted", Router::new().mount("/", mounted).unwrap())
            .unwrap()
            .mount_app("/static")
            .unwrap()
    }

    fn get(path: &str) -> RequestScope {
        RequestScope::new(Method::GET, path)
    }

    #[test]
    fn test_resolve_plain_route() {
        assert_eq!(app().resolve(&get("/200")).as_deref(), Some("/200"));
    }

    #[test]
    fn test_resolve_groups_path_params() {
        let router = app();
        assert_eq!(router.resolve(&get("/200/111")).as_deref(), Some("/200/{test_param}"));
        assert_eq!(router.resolve(&get("/200/222")).as_deref(), Some("/200/{test_param}"));
    }

    #[test]
    fn test_resolve_converter() {
        let router = app();
        assert_eq!(router.resolve(&get("/items/42")).as_deref(), Some("/items/{id:int}"));
        assert_eq!(router.resolve(&get("/items/abc")), None);
    }

    #[test]
    fn test_resolve_unknown_path() {
        assert_eq!(app().resolve(&get("/this_path_does_not_exist")), None);
    }

    #[test]
    fn test_resolve_mounted_routes() {
        let router = app();
        assert_eq!(
            router.resolve(&get("/mounted/test/123")).as_deref(),
            Some("/mounted/test/{item}")
        );
        assert_eq!(router.resolve(&get("/mounted/test")).as_deref(), Some("/mounted/test"));
    }

    #[test]
    fn test_resolve_mounted_unknown_subpath() {
        assert_eq!(app().resolve(&get("/mounted/unhandled/123")), None);
    }

    #[test]
    fn test_resolve_mounted_app_uses_prefix() {
        assert_eq!(app().resolve(&get("/static/test.txt")).as_deref(), Some("/static"));
    }

    #[test]
    fn test_partial_match_is_fallback() {
        let scope = RequestScope::new(Method::DELETE, "/200/1");
        assert_eq!(app().resolve(&scope).as_deref(), Some("/200/{test_param}"));
    }

    #[test]
    fn test_full_match_overrides_earlier_partial() {
        let router = Router::new()
            .route("/thing", [Method::GET])
            .unwrap()
            .route_any("/{name}")
            .unwrap();
        let scope = RequestScope::new(Method::POST, "/thing");
        assert_eq!(router.resolve(&scope).as_deref(), Some("/{name}"));
    }

    #[test]
    fn test_partial_inside_mount_is_unresolved() {
        let inner = Router::new().route("/only-get", [Method::GET]).unwrap();
        let router = Router::new().mount("/sub", inner).unwrap();
        let scope = RequestScope::new(Method::POST, "/sub/only-get");
        assert_eq!(router.resolve(&scope), None);
    }

    #[test]
    fn test_get_implies_head() {
        let scope = RequestScope::new(Method::HEAD, "/mounted/test/1");
        assert_eq!(app().resolve(&scope).as_deref(), Some("/mounted/test/{item}"));
    }

    #[test]
    fn test_mount_child_scope() {
        let mount = Mount::new("/users/{user_id}", Router::new()).unwrap();
        let (result, child) = mount.matches(&get("/users/7/posts"));
        assert_eq!(result, Match::Full);
        let child = child.unwrap();
        assert_eq!(child.path, "/posts");
        assert_eq!(child.root_path, "/users/7");
        assert_eq!(child.path_params.get("user_id").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_mount_params_in_template() {
        let inner = Router::new().route_any("/posts/{post_id}").unwrap();
        let router = Router::new().mount("/users/{user_id}", inner).unwrap();
        assert_eq!(
            router.resolve(&get("/users/7/posts/9")).as_deref(),
            Some("/users/{user_id}/posts/{post_id}")
        );
    }

    #[test]
    fn test_mount_requires_separator() {
        assert_eq!(app().resolve(&get("/mountedtest")), None);
    }

    #[test]
    fn test_invalid_templates() {
        assert!(Route::any("no-slash").is_err());
        assert!(Route::any("/{a}/{a}").is_err());
        assert!(Route::any("/{a:bogus}").is_err());
    }

    #[test]
    fn test_regex_failure_is_a_route_error() {
        let err = compile_regex("/broken", "^(/broken$").unwrap_err();
        assert!(matches!(err, Error::InvalidRoutePath { ref path, .. } if path == "/broken"));
    }

    #[test]
    fn test_literal_segments_are_escaped() {
        let router = Router::new().route_any("/file.txt").unwrap();
        assert_eq!(router.resolve(&get("/fileXtxt")), None);
        assert_eq!(router.resolve(&get("/file.txt")).as_deref(), Some("/file.txt"));
    }
}
