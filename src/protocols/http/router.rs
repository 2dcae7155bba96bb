//! Path router.
//!
//! Routes are registered per method against path templates. A template
//! segment written `{name}` matches any single non-empty path segment and
//! binds it as a parameter. The first registered match wins.

use super::parser::Request;
use super::response::Response;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

pub type RouteFn = Box<dyn Fn(&Request) -> Response + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    EmptySegment(String),
    EmptyParam(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::EmptySegment(path) => {
                write!(f, "route path contains empty segment: '{}'", path)
            }
            RouteError::EmptyParam(path) => {
                write!(f, "route path contains empty path param: '{}'", path)
            }
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct Route {
    method: &'static str,
    template: String,
    segments: Vec<Segment>,
    handler: RouteFn,
}

/// Routes sharing a path prefix.
#[derive(Default)]
pub struct Router {
    prefix: String,
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            routes: Vec::new(),
        }
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register("GET", path, handler)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register("POST", path, handler)
    }

    pub fn put<F>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register("PUT", path, handler)
    }

    pub fn patch<F>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register("PATCH", path, handler)
    }

    pub fn delete<F>(&mut self, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register("DELETE", path, handler)
    }

    fn register<F>(&mut self, method: &'static str, path: &str, handler: F) -> Result<&mut Self, RouteError>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        let template = format!("{}{}", self.prefix, path);
        let segments = compile(&template)?;
        debug!(method, template = %template, "Registered route");

        self.routes.push(Route {
            method,
            template,
            segments,
            handler: Box::new(handler),
        });
        Ok(self)
    }

    /// Run the first route matching the request. Path parameters are
    /// written into `request.params`.
    pub fn handle(&self, request: &mut Request) -> Option<Response> {
        let path = split_path(&request.path);

        for route in self.routes.iter().filter(|r| r.method == request.method) {
            if let Some(params) = match_segments(&route.segments, &path) {
                debug!(method = route.method, template = %route.template, "Route matched");
                request.params = params;
                return Some((route.handler)(request));
            }
        }
        None
    }
}

/// Every router of the application, consulted in the order they were added.
#[derive(Default)]
pub struct Routes {
    routers: Vec<Router>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, router: Router) -> Self {
        self.routers.push(router);
        self
    }

    pub fn dispatch(&self, request: &mut Request) -> Response {
        self.routers
            .iter()
            .find_map(|router| router.handle(request))
            .unwrap_or_else(Response::not_found)
    }
}

fn compile(template: &str) -> Result<Vec<Segment>, RouteError> {
    let trimmed = template.strip_prefix('/').unwrap_or(template);
    let parts: Vec<&str> = trimmed.split('/').collect();
    let last = parts.len() - 1;

    let mut segments = Vec::with_capacity(parts.len());
    for (i, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            // Trailing slash
            if i == last {
                continue;
            }
            return Err(RouteError::EmptySegment(template.to_string()));
        }
        match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            Some("") => return Err(RouteError::EmptyParam(template.to_string())),
            Some(name) => segments.push(Segment::Param(name.to_string())),
            None => segments.push(Segment::Literal(part.to_string())),
        }
    }
    Ok(segments)
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

fn match_segments(segments: &[Segment], path: &[&str]) -> Option<HashMap<String, String>> {
    if segments.len() != path.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(path) {
        match segment {
            Segment::Literal(literal) if literal == part => {}
            Segment::Param(name) if !part.is_empty() => {
                params.insert(name.clone(), part.to_string());
            }
            _ => return None,
        }
    }
    Some(params)
}
