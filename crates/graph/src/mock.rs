//! Minimal HTTP/1.1 server for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) struct MockServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Lowercased request heads, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serves every connection with `handler(request_index, lowercased_request_head)`.
pub(crate) async fn serve<F>(handler: F) -> MockServer
where
    F: Fn(usize, &str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{port}");
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let counter = hits.clone();
    let log = requests.clone();
    let handle = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            let index = counter.fetch_add(1, Ordering::SeqCst);
            log.lock().unwrap().push(request.clone());
            let resp = handler(index, &request);
            let _ = stream.write_all(&resp).await;
            let _ = stream.shutdown().await;
        }
    });

    MockServer {
        url,
        hits,
        requests,
        handle,
    }
}

/// Serves the same response to every request.
pub(crate) async fn serve_static(resp: Vec<u8>) -> MockServer {
    serve(move |_, _| resp.clone()).await
}

pub(crate) fn response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

pub(crate) fn json(status: &str, body: &str) -> Vec<u8> {
    response(
        status,
        &[("Content-Type", "application/json".to_string())],
        body.as_bytes(),
    )
}

/// Extracts `(first, last)` from a `range: bytes=first-last` request header.
pub(crate) fn requested_range(request: &str) -> Option<(u64, u64)> {
    let line = request.lines().find(|l| l.starts_with("range:"))?;
    let spec = line.split_once("bytes=")?.1.trim();
    let (first, last) = spec.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

/// First line of the request, e.g. `get /sites/x http/1.1`.
pub(crate) fn request_line(request: &str) -> &str {
    request.lines().next().unwrap_or_default()
}

/// Serves `data` honoring single byte ranges, like the content endpoint.
pub(crate) fn ranged(data: &[u8], request: &str) -> Vec<u8> {
    let total = data.len() as u64;
    match requested_range(request) {
        Some((first, _)) if first >= total => response(
            "416 Range Not Satisfiable",
            &[("Content-Range", format!("bytes */{total}"))],
            b"",
        ),
        Some((first, last)) => {
            let last = last.min(total - 1);
            response(
                "206 Partial Content",
                &[("Content-Range", format!("bytes {first}-{last}/{total}"))],
                &data[first as usize..=last as usize],
            )
        }
        None => response("200 OK", &[], data),
    }
}
