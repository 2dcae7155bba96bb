//! HTTP service: parse, route, respond.

use super::parser::RequestParser;
use super::response::Response;
use super::router::Routes;
use crate::protocols::stream::{Flow, Service};
use tracing::{debug, warn};

pub struct HttpService {
    routes: Routes,
}

impl HttpService {
    pub fn new(routes: Routes) -> Self {
        Self { routes }
    }
}

impl Service for HttpService {
    type State = RequestParser;

    fn name(&self) -> &'static str {
        "http"
    }

    fn open(&self) -> RequestParser {
        RequestParser::new()
    }

    fn on_data(&self, parser: &mut RequestParser, data: &[u8], replies: &mut Vec<Vec<u8>>) -> Flow {
        parser.extend(data);

        loop {
            match parser.next_request() {
                Ok(Some(mut request)) => {
                    let response = self.routes.dispatch(&mut request);
                    debug!(
                        method = %request.method,
                        path = %request.path,
                        status = response.status(),
                        "Request served"
                    );
                    replies.push(response.serialize());
                }
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    warn!(error = %e, "Bad request");
                    replies.push(Response::bad_request().serialize());
                    return Flow::Close;
                }
            }
        }
    }
}
