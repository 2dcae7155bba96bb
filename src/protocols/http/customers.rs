//! Demo `/customers` resource.

use super::parser::Request;
use super::response::Response;
use super::router::{RouteError, Router};

pub fn customer_router() -> Result<Router, RouteError> {
    let mut router = Router::with_prefix("/customers");

    router
        .get("/", |_: &Request| Response::text(200, "List of customers"))?
        .get("/{id}", |req: &Request| {
            Response::text(200, format!("Get customer by id: {}", id(req)))
        })?
        .post("", |_: &Request| Response::text(201, "Customer created"))?
        .patch("/{id}", |req: &Request| {
            Response::text(200, format!("Customer updated: {}", id(req)))
        })?
        .delete("/{id}", |req: &Request| {
            Response::text(200, format!("Customer deleted: {}", id(req)))
        })?;

    Ok(router)
}

fn id(req: &Request) -> &str {
    req.param("id").unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::router::Routes;

    fn dispatch(method: &str, path: &str) -> Response {
        let routes = Routes::new().include(customer_router().unwrap());
        let mut req = Request {
            method: method.to_string(),
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            ..Default::default()
        };
        routes.dispatch(&mut req)
    }

    #[test]
    fn test_customer_routes() {
        let resp = dispatch("GET", "/customers");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"List of customers");

        let resp = dispatch("GET", "/customers/42");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"Get customer by id: 42");

        let resp = dispatch("POST", "/customers");
        assert_eq!(resp.status(), 201);

        assert_eq!(dispatch("PATCH", "/customers/7").body(), b"Customer updated: 7");
        assert_eq!(dispatch("DELETE", "/customers/7").body(), b"Customer deleted: 7");
    }

    #[test]
    fn test_unknown_routes() {
        assert_eq!(dispatch("PUT", "/customers/7").status(), 404);
        assert_eq!(dispatch("GET", "/customers/7/orders").status(), 404);
        assert_eq!(dispatch("GET", "/orders").status(), 404);
    }
}
