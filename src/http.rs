//! Tiny, unassuming HTTP Server
//!
//! Serves health, readiness, the registry exposition and a JSON intake from
//! a single thread. Routing is a pure function of method, path and body so
//! that it can be exercised without a socket.

use crate::buffer::EnqueueError;
use crate::metric::RawRecord;
use crate::pipeline::Intake;
use crate::thread::{self, Stoppable};
use serde_json::json;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response};

/// Largest ingest body read, in bytes.
const MAX_BODY: u64 = 4 * 1024 * 1024;

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; version=0.0.4";

/// What a route produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Content-Type header value.
    pub content_type: &'static str,
    /// Response body.
    pub body: String,
}

impl Reply {
    fn json(status: u16, body: &serde_json::Value) -> Reply {
        Reply {
            status,
            content_type: JSON,
            body: body.to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IngestBody {
    One(RawRecord),
    Many(Vec<RawRecord>),
}

fn ingest(body: &[u8], intake: &Intake) -> Reply {
    let raws = match serde_json::from_slice::<IngestBody>(body) {
        Ok(IngestBody::One(raw)) => vec![raw],
        Ok(IngestBody::Many(raws)) => raws,
        Err(e) => {
            return Reply::json(400, &json!({"error": format!("undecodable body: {}", e)}));
        }
    };
    let outcome = intake.submit_batch(raws);
    let first_error = outcome.first_error.as_ref().map(|e| e.to_string());
    if let Some(refusal) = outcome.backpressure {
        let reason = match refusal {
            EnqueueError::BufferFull => "buffer full",
            EnqueueError::Closed => "shutting down",
        };
        return Reply::json(
            503,
            &json!({
                "error": reason,
                "accepted": outcome.accepted,
                "rejected": outcome.rejected,
                "unprocessed": outcome.unprocessed,
            }),
        );
    }
    if outcome.accepted == 0 && outcome.rejected > 0 {
        return Reply::json(
            400,
            &json!({
                "error": first_error,
                "accepted": 0,
                "rejected": outcome.rejected,
            }),
        );
    }
    Reply::json(
        202,
        &json!({
            "accepted": outcome.accepted,
            "rejected": outcome.rejected,
            "first_error": first_error,
        }),
    )
}

/// Answer one request.
pub fn route(method: &Method, url: &str, body: &[u8], intake: &Intake) -> Reply {
    let path = url.split('?').next().unwrap_or("");
    match (method, path) {
        (&Method::Get, "/health") => {
            let health = intake.health();
            Reply::json(200, &json!({"status": "ok", "app": health.app}))
        }
        (&Method::Get, "/ready") => {
            let health = intake.health();
            let status = if health.is_ready() { 200 } else { 503 };
            let mut body = serde_json::to_value(&health).unwrap_or_else(|_| json!({}));
            body["ready"] = json!(health.is_ready());
            Reply::json(status, &body)
        }
        (&Method::Get, "/metrics") => Reply {
            status: 200,
            content_type: TEXT,
            body: intake.registry().expose(),
        },
        (&Method::Get, "/ingest/dry-run") => {
            intake
                .registry()
                .ingest_requests
                .fetch_add(1, Ordering::Relaxed);
            Reply::json(200, &json!({"ok": true}))
        }
        (&Method::Post, "/ingest") => ingest(body, intake),
        (_, "/health") | (_, "/ready") | (_, "/metrics") | (_, "/ingest/dry-run")
        | (_, "/ingest") => Reply::json(405, &json!({"error": "method not allowed"})),
        _ => Reply::json(404, &json!({"error": "not found"})),
    }
}

/// Read a request body of at most `limit` bytes. Anything longer is a 413,
/// a failed read a 400.
fn read_body<R: Read>(reader: R, limit: u64) -> Result<Vec<u8>, Reply> {
    let mut body = Vec::new();
    if let Err(e) = reader.take(limit + 1).read_to_end(&mut body) {
        warn!("could not read request body: {}", e);
        return Err(Reply::json(
            400,
            &json!({"error": format!("could not read body: {}", e)}),
        ));
    }
    if body.len() as u64 > limit {
        return Err(Reply::json(
            413,
            &json!({"error": format!("body exceeds {} bytes", limit)}),
        ));
    }
    Ok(body)
}

fn handle(mut request: Request, intake: &Intake) {
    let reply = if *request.method() == Method::Post {
        match read_body(request.as_reader(), MAX_BODY) {
            Ok(body) => route(request.method(), request.url(), &body, intake),
            Err(reply) => reply,
        }
    } else {
        route(request.method(), request.url(), b"", intake)
    };
    trace!("{} {} -> {}", request.method(), request.url(), reply.status);
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()) {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        debug!("could not respond: {}", e);
    }
}

/// Single threaded HTTP server.
pub struct Server {
    /// Thread handle for the operating HTTP server.
    thread: thread::ThreadHandle,
    addr: SocketAddr,
}

impl Server {
    /// Bind `host_port` and start serving on a new thread.
    pub fn new(host_port: &str, intake: Intake) -> io::Result<Server> {
        let server = tiny_http::Server::http(host_port)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let addr = server.server_addr();
        info!("http listening on {}", addr);
        let thread = thread::spawn("http", move |stop| {
            while !stop.is_raised() {
                match server.recv_timeout(Duration::from_millis(100)) {
                    Ok(Some(request)) => handle(request, &intake),
                    Ok(None) => {}
                    Err(e) => {
                        error!("http server failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(Server { thread, addr })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Graceful shutdown support for Server.
impl Stoppable for Server {
    fn join(self) {
        self.thread.join();
    }

    fn shutdown(self) {
        self.thread.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Args;
    use crate::metric::RawRecord;
    use crate::pipeline::Pipeline;
    use crate::sink::{Null, NullConfig};
    use std::io::Write;
    use std::net::TcpStream;

    fn pipeline(capacity: usize) -> Pipeline {
        Pipeline::start(
            &Args {
                http: None,
                buffer_capacity: capacity,
                ..Default::default()
            },
            Box::new(Null::new(&NullConfig::new("null".into()))),
        )
        .unwrap()
    }

    fn json_of(reply: &Reply) -> serde_json::Value {
        serde_json::from_str(&reply.body).unwrap()
    }

    #[test]
    fn health_and_unknown_routes() {
        let p = pipeline(8);
        let intake = p.intake();
        let reply = route(&Method::Get, "/health", b"", &intake);
        assert_eq!(200, reply.status);
        assert_eq!(json!({"status": "ok", "app": "TelemetryHub"}), json_of(&reply));

        assert_eq!(404, route(&Method::Get, "/nope", b"", &intake).status);
        assert_eq!(405, route(&Method::Delete, "/health", b"", &intake).status);
        p.shutdown();
    }

    #[test]
    fn dry_run_counts_requests() {
        let p = pipeline(8);
        let intake = p.intake();
        for _ in 0..3 {
            let reply = route(&Method::Get, "/ingest/dry-run?x=1", b"", &intake);
            assert_eq!(json!({"ok": true}), json_of(&reply));
        }
        let metrics = route(&Method::Get, "/metrics", b"", &intake);
        assert_eq!(TEXT, metrics.content_type);
        assert!(metrics
            .body
            .contains("telemetry_ingest_requests_total{type=\"metric\"} 3"));
        p.shutdown();
    }

    #[test]
    fn ingest_accepts_one_or_many() {
        let p = pipeline(64);
        let intake = p.intake();
        let one = serde_json::to_vec(&RawRecord::counter("hits", 1.0)).unwrap();
        let reply = route(&Method::Post, "/ingest", &one, &intake);
        assert_eq!(202, reply.status);
        assert_eq!(1, json_of(&reply)["accepted"]);

        let many = serde_json::to_vec(&vec![
            RawRecord::counter("hits", 1.0),
            RawRecord::gauge("temp", 20.0),
            RawRecord::new("x", "summary", 1.0),
        ])
        .unwrap();
        let reply = route(&Method::Post, "/ingest", &many, &intake);
        assert_eq!(202, reply.status);
        let body = json_of(&reply);
        assert_eq!(2, body["accepted"]);
        assert_eq!(1, body["rejected"]);
        p.shutdown();
    }

    #[test]
    fn ingest_rejects_garbage_and_all_invalid() {
        let p = pipeline(8);
        let intake = p.intake();
        assert_eq!(400, route(&Method::Post, "/ingest", b"{not json", &intake).status);

        let bad = serde_json::to_vec(&RawRecord::gauge("", 1.0)).unwrap();
        let reply = route(&Method::Post, "/ingest", &bad, &intake);
        assert_eq!(400, reply.status);
        assert_eq!("metric name is empty", json_of(&reply)["error"]);
        p.shutdown();
    }

    #[test]
    fn ready_goes_unavailable_when_closed() {
        let p = pipeline(8);
        let intake = p.intake();
        let reply = route(&Method::Get, "/ready", b"", &intake);
        assert_eq!(200, reply.status);
        assert_eq!(true, json_of(&reply)["ready"]);
        p.shutdown();

        let reply = route(&Method::Get, "/ready", b"", &intake);
        assert_eq!(503, reply.status);
        assert_eq!(false, json_of(&reply)["accepting"]);

        let rec = serde_json::to_vec(&RawRecord::counter("hits", 1.0)).unwrap();
        let reply = route(&Method::Post, "/ingest", &rec, &intake);
        assert_eq!(503, reply.status);
        assert_eq!("shutting down", json_of(&reply)["error"]);
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn body_limits_and_read_errors() {
        assert_eq!(b"abcd".to_vec(), read_body(&b"abcd"[..], 4).unwrap());

        let reply = read_body(&b"abcde"[..], 4).unwrap_err();
        assert_eq!(413, reply.status);
        assert_eq!("body exceeds 4 bytes", json_of(&reply)["error"]);

        let reply = read_body(Broken, 4).unwrap_err();
        assert_eq!(400, reply.status);
    }

    #[test]
    fn serves_over_tcp() {
        let p = pipeline(8);
        let server = Server::new("127.0.0.1:0", p.intake()).unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("TelemetryHub"));
        server.shutdown();
        p.shutdown();
    }
}
