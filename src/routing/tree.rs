//! Four-level dispatch tree: virtual host → method → path template →
//! content type.
//!
//! The tree is mutable while routes are registered and is then shared
//! behind an `Arc` and only read. Matching takes no locks.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::http::mime::MediaRange;
use crate::http::request::{Method, Request};
use crate::routing::auth::{AuthRequirement, Authenticator};
use crate::routing::handler::{BoxHandler, ErrorHandler, PathParams};
use crate::routing::template::PathTemplate;
use crate::routing::RouteError;

/// What to do when a route is registered for a tuple that already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Fail,
    Replace,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKey {
    Any,
    Exact(String),
}

impl HostKey {
    /// `*` or an empty string means any host. Ports are ignored.
    pub fn parse(host: &str) -> Self {
        let host = host.trim();
        if host.is_empty() || host == "*" {
            return HostKey::Any;
        }
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        HostKey::Exact(name.to_ascii_lowercase())
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKey::Any => f.write_str("*"),
            HostKey::Exact(h) => f.write_str(h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKey {
    Any,
    Exact(Method),
}

impl From<Method> for MethodKey {
    fn from(m: Method) -> Self {
        MethodKey::Exact(m)
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKey::Any => f.write_str("*"),
            MethodKey::Exact(m) => write!(f, "{m}"),
        }
    }
}

/// Settings attached to an interior node. `None` inherits from the parent.
#[derive(Clone, Default)]
pub struct NodeSettings {
    pub auth: Option<AuthRequirement>,
    pub error_handler: Option<ErrorHandler>,
}

impl NodeSettings {
    pub fn require_auth(&mut self, auth: AuthRequirement) -> &mut Self {
        self.auth = Some(auth);
        self
    }

    pub fn on_error(&mut self, handler: ErrorHandler) -> &mut Self {
        self.error_handler = Some(handler);
        self
    }
}

/// Per-route registration options.
#[derive(Clone, Default)]
pub struct RouteOptions {
    /// Overrides the inherited requirement when set.
    pub auth: Option<AuthRequirement>,
    pub on_conflict: ConflictPolicy,
    /// Answers an authentication failure on this route. Failures before a
    /// route is selected use the node settings instead.
    pub error_handler: Option<ErrorHandler>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn on_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

/// A successful match.
#[derive(Clone)]
pub struct RouteMatch {
    pub handler: BoxHandler,
    pub params: PathParams,
    /// The template that matched, as registered.
    pub template: String,
}

/// A failed match and the nearest default-error handler, if any.
#[derive(Clone)]
pub struct RouteMiss {
    pub error: RouteError,
    pub error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for RouteMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMiss")
            .field("error", &self.error)
            .field("has_error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Inputs to a match that do not need the full request.
#[derive(Debug, Clone, Copy)]
pub struct RouteQuery<'a> {
    pub host: Option<&'a str>,
    pub method: Method,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub authenticated: bool,
}

struct ContentNode {
    range: MediaRange,
    template: PathTemplate,
    handler: BoxHandler,
    settings: NodeSettings,
}

struct PathNode {
    template: PathTemplate,
    settings: NodeSettings,
    content: Vec<ContentNode>,
}

struct MethodNode {
    key: MethodKey,
    settings: NodeSettings,
    paths: Vec<PathNode>,
}

struct HostNode {
    key: HostKey,
    settings: NodeSettings,
    methods: Vec<MethodNode>,
}

#[derive(Default)]
pub struct RouteTree {
    root: NodeSettings,
    hosts: Vec<HostNode>,
    authenticator: Option<Arc<dyn Authenticator>>,
    route_count: usize,
}

impl RouteTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn authenticator(&self) -> Option<&Arc<dyn Authenticator>> {
        self.authenticator.as_ref()
    }

    pub fn len(&self) -> usize {
        self.route_count
    }

    pub fn is_empty(&self) -> bool {
        self.route_count == 0
    }

    /// Settings applied to every host.
    pub fn root_settings(&mut self) -> &mut NodeSettings {
        &mut self.root
    }

    pub fn host_settings(&mut self, host: &str) -> &mut NodeSettings {
        &mut self.host_node(HostKey::parse(host)).settings
    }

    pub fn method_settings(&mut self, host: &str, method: impl Into<MethodKey>) -> &mut NodeSettings {
        &mut self.method_node(HostKey::parse(host), method.into()).settings
    }

    pub fn path_settings(
        &mut self,
        host: &str,
        method: impl Into<MethodKey>,
        path: &str,
    ) -> Result<&mut NodeSettings> {
        let template = PathTemplate::parse(path)?;
        let method_node = self.method_node(HostKey::parse(host), method.into());
        Ok(&mut path_node(method_node, &template).settings)
    }

    /// Registers `handler` for the (host, method, path, content type)
    /// tuple. With [`ConflictPolicy::Fail`] an existing registration is
    /// left intact and `DuplicateRoute` is returned.
    pub fn register(
        &mut self,
        host: &str,
        method: impl Into<MethodKey>,
        path: &str,
        content_type: &str,
        handler: BoxHandler,
        options: RouteOptions,
    ) -> Result<()> {
        let host_key = HostKey::parse(host);
        let method_key = method.into();
        let template = PathTemplate::parse(path)?;
        let range = MediaRange::parse(content_type)
            .ok_or_else(|| Error::InvalidRoute(format!("bad content type {content_type:?}")))?;
        let describe = format!("{host_key} {method_key} {} {range}", template.as_str());

        let settings = NodeSettings {
            auth: options.auth,
            error_handler: options.error_handler,
        };

        let method_node = self.method_node(host_key, method_key);
        let node = path_node(method_node, &template);

        if let Some(existing) = node.content.iter_mut().find(|c| c.range == range) {
            return match options.on_conflict {
                ConflictPolicy::Fail => Err(Error::DuplicateRoute(describe)),
                ConflictPolicy::Ignore => {
                    tracing::debug!(route = %describe, "Ignoring duplicate route");
                    Ok(())
                }
                ConflictPolicy::Replace => {
                    tracing::debug!(route = %describe, "Replacing route");
                    existing.template = template;
                    existing.handler = handler;
                    existing.settings = settings;
                    Ok(())
                }
            };
        }

        node.content.push(ContentNode {
            range,
            template,
            handler,
            settings,
        });
        self.route_count += 1;
        tracing::debug!(route = %describe, "Registered route");
        Ok(())
    }

    fn host_node(&mut self, key: HostKey) -> &mut HostNode {
        let idx = match self.hosts.iter().position(|h| h.key == key) {
            Some(idx) => idx,
            None => {
                self.hosts.push(HostNode {
                    key,
                    settings: NodeSettings::default(),
                    methods: Vec::new(),
                });
                self.hosts.len() - 1
            }
        };
        &mut self.hosts[idx]
    }

    fn method_node(&mut self, host: HostKey, key: MethodKey) -> &mut MethodNode {
        let host = self.host_node(host);
        let idx = match host.methods.iter().position(|m| m.key == key) {
            Some(idx) => idx,
            None => {
                host.methods.push(MethodNode {
                    key,
                    settings: NodeSettings::default(),
                    paths: Vec::new(),
                });
                host.methods.len() - 1
            }
        };
        &mut host.methods[idx]
    }

    /// Resolves a request, consulting the tree's authenticator only when a
    /// protected route is reached.
    pub fn resolve(&self, request: &Request) -> std::result::Result<RouteMatch, RouteMiss> {
        let mut authenticated = || {
            self.authenticator
                .as_ref()
                .is_some_and(|a| a.authenticate(request))
        };
        self.match_with(
            request.host(),
            request.method,
            request.path_only(),
            request.content_type(),
            &mut authenticated,
        )
    }

    pub fn match_route(&self, query: &RouteQuery<'_>) -> std::result::Result<RouteMatch, RouteMiss> {
        let path = query.path.split_once('?').map(|(p, _)| p).unwrap_or(query.path);
        self.match_with(
            query.host,
            query.method,
            path,
            query.content_type,
            &mut || query.authenticated,
        )
    }

    fn match_with(
        &self,
        host: Option<&str>,
        method: Method,
        path: &str,
        content_type: Option<&str>,
        authenticated: &mut dyn FnMut() -> bool,
    ) -> std::result::Result<RouteMatch, RouteMiss> {
        let host_key = host.map(HostKey::parse);
        let mut miss = Miss::new(self.root.error_handler.clone());

        let hosts = candidates(&self.hosts, |h| Some(&h.key) == host_key.as_ref(), |h| h.key == HostKey::Any);

        for host_node in hosts {
            let host_auth = host_node.settings.auth.or(self.root.auth);
            let host_eh = nearest(&host_node.settings, &self.root.error_handler);

            let methods = candidates(
                &host_node.methods,
                |m| m.key == MethodKey::Exact(method),
                |m| m.key == MethodKey::Any,
            );
            if methods.is_empty() {
                miss.record(RouteError::NotFound, host_eh);
                continue;
            }

            for method_node in methods {
                let method_auth = method_node.settings.auth.or(host_auth);
                let method_eh = nearest(&method_node.settings, &host_eh);

                let mut paths: Vec<(&PathNode, PathParams)> = method_node
                    .paths
                    .iter()
                    .filter(|p| !p.content.is_empty())
                    .filter_map(|p| p.template.matches(path).map(|params| (p, params)))
                    .collect();
                if paths.is_empty() {
                    miss.record(RouteError::NotFound, method_eh);
                    continue;
                }
                // Stable: equal precedence keeps registration order.
                paths.sort_by(|(a, _), (b, _)| b.template.precedence(&a.template));
                let (path_node, params) = paths.swap_remove(0);

                let path_auth = path_node.settings.auth.or(method_auth);
                let path_eh = nearest(&path_node.settings, &method_eh);

                // The best path decides; a content type it cannot take is
                // not retried against less specific templates.
                let Some(entry) = select_content(&path_node.content, content_type) else {
                    return Err(RouteMiss {
                        error: RouteError::NoAcceptableContentType,
                        error_handler: path_eh,
                    });
                };

                let entry_eh = nearest(&entry.settings, &path_eh);
                let auth = entry.settings.auth.or(path_auth).unwrap_or_default();
                if auth == AuthRequirement::Required && !authenticated() {
                    return Err(RouteMiss {
                        error: RouteError::AuthenticationRequired,
                        error_handler: entry_eh,
                    });
                }

                // Parameter names come from the entry's own registration.
                let params = entry.template.matches(path).unwrap_or(params);
                return Ok(RouteMatch {
                    handler: Arc::clone(&entry.handler),
                    params,
                    template: entry.template.as_str().to_string(),
                });
            }
        }

        Err(miss.finish())
    }
}

fn path_node<'a>(method: &'a mut MethodNode, template: &PathTemplate) -> &'a mut PathNode {
    let canonical = template.canonical();
    let idx = match method
        .paths
        .iter()
        .position(|p| p.template.canonical() == canonical)
    {
        Some(idx) => idx,
        None => {
            method.paths.push(PathNode {
                template: template.clone(),
                settings: NodeSettings::default(),
                content: Vec::new(),
            });
            method.paths.len() - 1
        }
    };
    &mut method.paths[idx]
}

/// Exact entries first, then the wildcard entry.
fn candidates<'a, T>(
    items: &'a [T],
    exact: impl Fn(&T) -> bool,
    wildcard: impl Fn(&T) -> bool,
) -> Vec<&'a T> {
    items
        .iter()
        .filter(|i| exact(*i))
        .chain(items.iter().filter(|i| wildcard(*i)))
        .collect()
}

fn nearest(settings: &NodeSettings, inherited: &Option<ErrorHandler>) -> Option<ErrorHandler> {
    settings
        .error_handler
        .clone()
        .or_else(|| inherited.clone())
}

/// Most specific matching range wins; ties go to the earlier
/// registration. A request without a content type takes the `*/*` entry
/// if there is one, else the first registered.
fn select_content<'a>(entries: &'a [ContentNode], content_type: Option<&str>) -> Option<&'a ContentNode> {
    let Some(ct) = content_type else {
        return entries
            .iter()
            .find(|e| e.range == MediaRange::Any)
            .or_else(|| entries.first());
    };

    entries
        .iter()
        .filter(|e| e.range.matches(ct))
        .fold(None, |best: Option<&ContentNode>, e| match best {
            Some(b) if b.range.specificity().cmp(&e.range.specificity()) != Ordering::Less => Some(b),
            _ => Some(e),
        })
}

/// Tracks the most informative failure seen while walking the tree.
struct Miss {
    error: RouteError,
    error_handler: Option<ErrorHandler>,
    recorded: bool,
}

impl Miss {
    fn new(root: Option<ErrorHandler>) -> Self {
        Self {
            error: RouteError::NotFound,
            error_handler: root,
            recorded: false,
        }
    }

    /// The first (most specific) failure is kept.
    fn record(&mut self, error: RouteError, error_handler: Option<ErrorHandler>) {
        if !self.recorded {
            self.error = error;
            self.error_handler = error_handler;
            self.recorded = true;
        }
    }

    fn finish(self) -> RouteMiss {
        RouteMiss {
            error: self.error,
            error_handler: self.error_handler,
        }
    }
}
