//! Tiny HTTP fakes for the remote backends

#![allow(dead_code)]

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use tiny_http::{Header, Response, Server};

/// One request as the fake saw it
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Seen {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub struct Reply {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
}

impl Reply {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "application/json",
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
            content_type: "application/json",
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            content_type: "text/html; charset=utf-8",
        }
    }
}

/// A server on an ephemeral port answering every request through `handler`.
pub struct FakeServer {
    pub base: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl FakeServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Seen) -> Reply + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let entry = Seen {
                    method: request.method().to_string().to_uppercase(),
                    path: request.url().to_string(),
                    body,
                };
                let reply = handler(&entry);
                log.lock().unwrap().push(entry);
                let content_type = format!("Content-Type: {}", reply.content_type);
                let response = Response::from_string(reply.body)
                    .with_status_code(reply.status)
                    .with_header(content_type.parse::<Header>().unwrap());
                let _ = request.respond(response);
            }
        });

        Self {
            base: format!("http://{}", addr),
            seen,
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_path(&self, method: &str, path_suffix: &str) -> Vec<Seen> {
        self.seen()
            .into_iter()
            .filter(|s| s.method == method && s.path.ends_with(path_suffix))
            .collect()
    }
}
