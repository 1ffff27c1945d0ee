use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::strategy::RequestId;
use crate::web::{HttpTransport, WebCall, WebRequest};
use crate::{Error, Result};

pub type HttpCompletion = (RequestId, Result<Vec<u8>>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebEndpoints {
    pub upload_url: String,
    pub verify_url: String,
}

impl WebEndpoints {
    pub fn from_base(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            upload_url: format!("{base}/upload"),
            verify_url: format!("{base}/verify"),
        }
    }

    fn url(&self, call: WebCall) -> &str {
        match call {
            WebCall::UploadPart => &self.upload_url,
            WebCall::Verify => &self.verify_url,
        }
    }
}

/// Posts each request on its own task and reports the body on `completions`.
/// Must be used from inside a tokio runtime.
pub struct ReqwestTransport {
    client: reqwest::Client,
    endpoints: WebEndpoints,
    next_id: RequestId,
    tasks: HashMap<RequestId, JoinHandle<()>>,
    completions: mpsc::UnboundedSender<HttpCompletion>,
}

impl ReqwestTransport {
    pub fn new(endpoints: WebEndpoints) -> (Self, mpsc::UnboundedReceiver<HttpCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            client: reqwest::Client::new(),
            endpoints,
            next_id: 0,
            tasks: HashMap::new(),
            completions: tx,
        };
        (transport, rx)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.values().filter(|t| !t.is_finished()).count()
    }
}

impl HttpTransport for ReqwestTransport {
    fn post(&mut self, request: WebRequest) -> RequestId {
        self.tasks.retain(|_, task| !task.is_finished());
        self.next_id += 1;
        let id = self.next_id;

        let client = self.client.clone();
        let url = self.endpoints.url(request.call).to_string();
        let completions = self.completions.clone();
        let task = tokio::spawn(async move {
            let result = post_multipart(&client, &url, request).await;
            let _ = completions.send((id, result));
        });
        self.tasks.insert(id, task);
        id
    }

    fn cancel(&mut self, request: RequestId) {
        if let Some(task) = self.tasks.remove(&request) {
            debug!(event = "http.cancel", request, "http.cancel");
            task.abort();
        }
    }
}

async fn post_multipart(
    client: &reqwest::Client,
    url: &str,
    request: WebRequest,
) -> Result<Vec<u8>> {
    let mut form = reqwest::multipart::Form::new();
    for (name, value) in request.fields {
        form = form.text(name, value);
    }
    if let Some(file) = request.file {
        let part = reqwest::multipart::Part::bytes(file.bytes).file_name(file.name);
        form = form.part("file", part);
    }

    let res = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| Error::Http {
            message: format!("request failed: {e}"),
        })?;

    let status = res.status();
    let body = res.bytes().await.map_err(|e| Error::Http {
        message: format!("read response failed: {e}"),
    })?;

    if !status.is_success() {
        return Err(Error::Http {
            message: format!("http {status}: {}", String::from_utf8_lossy(&body)),
        });
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_strip_trailing_slash() {
        let endpoints = WebEndpoints::from_base("https://upload.example.org/api/");
        assert_eq!(endpoints.upload_url, "https://upload.example.org/api/upload");
        assert_eq!(
            endpoints.url(WebCall::Verify),
            "https://upload.example.org/api/verify"
        );
    }

    #[tokio::test]
    async fn unreachable_host_reports_http_error() {
        let (mut transport, mut rx) =
            ReqwestTransport::new(WebEndpoints::from_base("http://127.0.0.1:9"));
        let id = transport.post(WebRequest {
            call: WebCall::Verify,
            fields: vec![("uid", "1".to_string())],
            file: None,
        });
        let (got, result) = rx.recv().await.unwrap();
        assert_eq!(got, id);
        assert!(matches!(result, Err(Error::Http { .. })));
    }

    #[tokio::test]
    async fn cancelled_request_never_completes() {
        let (mut transport, mut rx) =
            ReqwestTransport::new(WebEndpoints::from_base("http://10.255.255.1"));
        let id = transport.post(WebRequest {
            call: WebCall::UploadPart,
            fields: Vec::new(),
            file: None,
        });
        transport.cancel(id);
        drop(transport);
        assert!(rx.recv().await.is_none());
    }
}
