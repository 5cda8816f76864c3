//! Plain HTTP path of the agent proxy (§4.7): read method/URL/headers/body,
//! wrap into `http_request`, wait up to 30s for the matching `http_response`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tracing::warn;
use tunnel_protocol::{Frame, HttpRequestPayload, HttpResponsePayload, StreamId};

use crate::proxy::{full_body, ResponseBody};
use crate::state::AgentState;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one non-CONNECT, non-upgrade HTTP request.
pub async fn handle(req: Request<Incoming>, state: Arc<AgentState>) -> Response<ResponseBody> {
    let Some(tunnel) = state.current() else {
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    };

    let method = req.method().to_string();
    let url = req.uri().to_string();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "request body exceeds the 10 MiB cap");
            return status_response(StatusCode::BAD_REQUEST, "request body exceeds 10 MiB");
        }
    };

    let id = StreamId::new();
    let mut stream_rx = tunnel.table.register(id);
    let frame = Frame::HttpRequest(HttpRequestPayload {
        id,
        method,
        url,
        headers,
        body: body.to_vec(),
    });
    if tunnel.frame_tx.send(frame).await.is_err() {
        tunnel.table.deregister(&id);
        return status_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel not connected");
    }

    let outcome = tokio::time::timeout(RESPONSE_TIMEOUT, stream_rx.recv()).await;
    tunnel.table.deregister(&id);

    match outcome {
        Ok(Some(Frame::HttpResponse(payload))) => build_response(payload),
        Ok(Some(other)) => {
            warn!(frame_type = other.type_name(), "unexpected frame on an http stream");
            status_response(StatusCode::BAD_GATEWAY, "unexpected tunnel frame")
        }
        Ok(None) => status_response(StatusCode::BAD_GATEWAY, "tunnel closed before responding"),
        Err(_) => status_response(StatusCode::GATEWAY_TIMEOUT, "tunnel response timed out"),
    }
}

fn build_response(payload: HttpResponsePayload) -> Response<ResponseBody> {
    let mut builder = Response::builder().status(payload.status_code);
    for (name, values) in &payload.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    match builder.body(full_body(Bytes::from(payload.body))) {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "failed to build response from tunnel headers");
            status_response(StatusCode::BAD_GATEWAY, "malformed tunnel response")
        }
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(Bytes::from(message.to_string())))
        .expect("static status responses are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    async fn collect_with_cap(size: usize) -> Result<Bytes, http_body_util::LengthLimitError> {
        let body = Full::new(Bytes::from(vec![0u8; size]));
        Limited::new(body, MAX_BODY_BYTES)
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| *e.downcast::<http_body_util::LengthLimitError>().unwrap())
    }

    #[tokio::test]
    async fn a_body_of_exactly_the_cap_is_accepted() {
        let result = collect_with_cap(MAX_BODY_BYTES).await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().len(), MAX_BODY_BYTES);
    }

    #[tokio::test]
    async fn a_body_one_byte_over_the_cap_is_rejected() {
        let result = collect_with_cap(MAX_BODY_BYTES + 1).await;
        assert!(result.is_err());
    }
}
