use std::error::Error as StdError;

use crate::types::FeedError;

/// Flattened message of an error and everything in its source chain.
/// reqwest wraps hyper/rustls/io errors several levels deep and only the
/// innermost message says what actually went wrong.
fn full_message(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];

    let mut source = error.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }

    parts.join(": ").to_lowercase()
}

/// Maps a transport failure to the closed `FeedError` taxonomy. The primary
/// signals are reqwest's error kind predicates; message inspection breaks
/// ties the same way operators would when reading the raw error.
pub fn classify_fetch_error(error: &reqwest::Error) -> FeedError {
    let message = full_message(error);

    if error.is_timeout() {
        if error.is_connect() {
            return FeedError::NetworkConnectionTimeout;
        }
        return FeedError::NetworkReadTimeout;
    }

    if error.is_redirect() {
        return FeedError::NetworkTooManyRedirects;
    }

    if message.contains("proxy") {
        if message.contains("could not resolve host") {
            return FeedError::ProxyCouldNotResolveHost;
        }
        if message.contains("connection refused") {
            return FeedError::ProxyConnectionRefused;
        }
        if message.contains("no route to host") {
            return FeedError::ProxyNoRouteToHost;
        }
    }

    if error.is_connect() {
        if message.contains("certificate") {
            return FeedError::NetworkCertificateVerifyFailed;
        }
        if message.contains("ssl") || message.contains("tls") || message.contains("handshake") {
            return FeedError::NetworkSslConnectionError;
        }
        if message.contains("dns")
            || message.contains("name or service not known")
            || message.contains("failed to lookup address")
        {
            return FeedError::NetworkNameResolutionFailed;
        }
        return FeedError::NetworkConnectError;
    }

    if error.is_decode() {
        return FeedError::NetworkDecodingError;
    }

    if message.contains("invalid http version") || message.contains("unsupported protocol") {
        return FeedError::NetworkUnsupportedProtocol;
    }

    if message.contains("connection closed before message completed")
        || message.contains("connection reset")
    {
        return FeedError::NetworkDisconnectionWithoutResponse;
    }

    if message.contains("incomplete message") || message.contains("incomplete body") {
        return FeedError::NetworkReceivedIncompleteBody;
    }

    if message.contains("invalid status line") || message.contains("invalid message") {
        return FeedError::NetworkIllegalRequestLine;
    }

    FeedError::NetworkUnknown
}

/// Decodes a response body with the charset announced by the response,
/// falling back to utf-8. A body that does not decode cleanly is a
/// `parsing_unicode_decode_error`, not a transport failure.
pub fn decode_body(bytes: &[u8], charset: Option<&str>) -> Result<String, FeedError> {
    let label = charset.unwrap_or("utf-8");

    let encoding = encoding_rs::Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::UTF_8);

    let (decoded, _, had_errors) = encoding.decode(bytes);

    if had_errors {
        return Err(FeedError::ParsingUnicodeDecodeError);
    }

    Ok(decoded.into_owned())
}

/// Pulls the `charset` parameter out of a Content-Type header value.
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .map(str::trim)
        .find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("charset") {
                Some(value.trim().trim_matches('"').to_string())
            } else {
                None
            }
        })
}
