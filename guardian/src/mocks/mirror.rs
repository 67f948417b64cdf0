//! A local HTTP mirror serving a release artifact.

use axum::{body::Body, http::StatusCode, routing::get, serve, Router};
use futures::stream;
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::net::TcpListener;

/// A running mirror.
pub struct Mirror {
    /// URL of the artifact.
    pub url: String,

    requests: Arc<AtomicUsize>,
}

impl Mirror {
    /// Serve `body` at `/<name>`, failing the first `failures` requests with a 500.
    pub async fn start(name: &str, body: &'static [u8], failures: usize) -> Self {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let app = Router::new().route(
            &format!("/{name}"),
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
                    }
                    (StatusCode::OK, body.to_vec())
                }
            }),
        );
        Self::listen(name, app, requests).await
    }

    /// A mirror that always fails.
    pub async fn broken(name: &str) -> Self {
        Self::start(name, b"", usize::MAX).await
    }

    /// A mirror that sends the first half of `body` and then drops the connection.
    pub async fn interrupted(name: &str, body: &'static [u8]) -> Self {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let app = Router::new().route(
            &format!("/{name}"),
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let chunks: [Result<&'static [u8], io::Error>; 2] = [
                        Ok(&body[..body.len() / 2]),
                        Err(io::Error::other("connection reset")),
                    ];
                    Body::from_stream(stream::iter(chunks))
                }
            }),
        );
        Self::listen(name, app, requests).await
    }

    async fn listen(name: &str, app: Router, requests: Arc<AtomicUsize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { serve(listener, app.into_make_service()).await.unwrap() });
        Self {
            url: format!("http://{addr}/{name}"),
            requests,
        }
    }

    /// Number of requests received.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}
