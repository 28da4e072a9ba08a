//! Reverse-proxies HTTP requests into a job's network namespace, dialing
//! out through its pinned dialer rather than a normal outbound socket
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper::client::conn::http1 as client_conn;
use hyper_util::rt::TokioIo;

use crate::job::Job;

/// Proxies `req` into `job`'s namespace
///
/// A fresh connection is dialed for every request rather than pooled, a
/// deliberate simplification of the reference implementation's
/// `http.Transport` idle-connection pool (see DESIGN.md, "connection
/// pooling").
pub async fn proxy(job: &Job, req: Request<Body>) -> Response<Body> {
    let dialer = job.dialer.clone();
    let target = job.proxy_target.clone();
    let std_stream = match tokio::task::spawn_blocking(move || dialer.dial(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return bad_gateway(format!("dial failed: {e}")),
        Err(e) => return bad_gateway(format!("dial task panicked: {e}")),
    };

    if let Err(e) = std_stream.set_nonblocking(true) {
        return bad_gateway(format!("could not prepare connection: {e}"));
    }
    let tokio_stream = match tokio::net::TcpStream::from_std(std_stream) {
        Ok(s) => s,
        Err(e) => return bad_gateway(format!("could not adopt connection: {e}")),
    };

    let io = TokioIo::new(tokio_stream);
    let (mut sender, conn) = match client_conn::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => return bad_gateway(format!("handshake with job failed: {e}")),
    };
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            log::debug!("proxied connection to job closed: {e}");
        }
    });

    match sender.send_request(req).await {
        Ok(resp) => resp.map(Body::new),
        Err(e) => bad_gateway(format!("upstream request failed: {e}")),
    }
}

fn bad_gateway(msg: String) -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from(msg))
        .expect("building a response from a plain string body cannot fail")
}
