use crate::{HttpFetch, HttpRequest, HttpResponse, PersonaError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Records every request and answers from a queue of canned responses.
#[derive(Default)]
pub struct RecordingFetch {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.push(Ok(HttpResponse {
            status,
            content_type: Some(content_type.to_string()),
            body: body.into(),
            truncated: false,
        }));
        self
    }

    pub fn fail(self, error: PersonaError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, response: Result<HttpResponse>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(response);
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpFetch for RecordingFetch {
    async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(req.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| {
                Err(PersonaError::Network {
                    operation: "fetch".to_string(),
                    message: format!("no canned response for {}", req.url),
                })
            })
    }
}
