//! Upstream WebSocket connections.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use tutor_relay_core::error::{Service, UpstreamError};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `url`, authenticating with an `xi-api-key` header.
pub async fn connect(
    service: Service,
    url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<WsStream, UpstreamError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| UpstreamError::protocol(service, format!("Invalid URL {url}: {e}")))?;

    if let Some(key) = api_key {
        let value = HeaderValue::from_str(key)
            .map_err(|_| UpstreamError::protocol(service, "API key is not a valid header value"))?;
        request.headers_mut().insert("xi-api-key", value);
    }

    debug!(%service, url = %redact_query(url), "Connecting upstream");

    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(classify_connect_error(service, &e)),
        Err(_) => Err(UpstreamError::Timeout {
            service,
            secs: timeout.as_secs(),
        }),
    }
}

/// Map a handshake failure onto the upstream taxonomy. Auth failures are
/// permanent; 429 is a rate limit; everything else is transport.
pub fn classify_connect_error(service: Service, err: &tungstenite::Error) -> UpstreamError {
    match err {
        tungstenite::Error::Http(resp) => {
            let code = resp.status().as_u16();
            let message = format!("handshake rejected with HTTP {code}");
            match code {
                429 => UpstreamError::rate_limited(service, message),
                401 | 403 => UpstreamError::protocol(service, message),
                _ if resp.status().is_server_error() => UpstreamError::transport(service, message),
                _ => UpstreamError::protocol(service, message),
            }
        }
        _ => UpstreamError::transport(service, err.to_string()),
    }
}

fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
