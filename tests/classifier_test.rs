use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tagmill::classifier::{charset_from_content_type, classify_fetch_error, decode_body};
use tagmill::fetcher::protocol_variants;
use tagmill::types::FeedError;

#[test]
fn charset_extracted_from_content_type() {
    assert_eq!(
        charset_from_content_type("application/rss+xml; charset=windows-1251"),
        Some("windows-1251".to_string())
    );

    assert_eq!(
        charset_from_content_type("text/xml; charset=\"UTF-8\""),
        Some("UTF-8".to_string())
    );

    assert_eq!(charset_from_content_type("application/rss+xml"), None);
}

#[test]
fn utf8_body_decodes_as_is() {
    let body = decode_body("привет".as_bytes(), None).unwrap();

    assert_eq!(body, "привет");
}

#[test]
fn declared_charset_is_honored() {
    // "да" in windows-1251
    let bytes = [0xE4, 0xE0];

    let body = decode_body(&bytes, Some("windows-1251")).unwrap();

    assert_eq!(body, "да");
}

#[test]
fn broken_utf8_is_a_unicode_decode_error() {
    let bytes = [0xC3, 0x28, 0xA0];

    let error = decode_body(&bytes, Some("utf-8")).unwrap_err();

    assert_eq!(error, FeedError::ParsingUnicodeDecodeError);
}

#[test]
fn https_is_tried_before_http() {
    let variants = protocol_variants("http://example.com/feed.xml").unwrap();

    assert_eq!(
        variants,
        vec![
            "https://example.com/feed.xml".to_string(),
            "http://example.com/feed.xml".to_string()
        ]
    );
}

#[test]
fn https_urls_keep_their_order_too() {
    let variants = protocol_variants("https://example.com/feed.xml").unwrap();

    assert_eq!(variants[0], "https://example.com/feed.xml");
    assert_eq!(variants.len(), 2);
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()
        .unwrap()
}

#[tokio::test]
async fn connection_refused_maps_to_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let error = client()
        .get(format!("http://127.0.0.1:{}/feed.xml", port))
        .send()
        .await
        .unwrap_err();

    assert_eq!(classify_fetch_error(&error), FeedError::NetworkConnectError);
}

#[tokio::test]
async fn silent_server_maps_to_a_timeout() {
    // The kernel completes the handshake for backlogged connections, so the
    // request is sent and the client then waits for a response that never
    // comes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let impatient = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let error = impatient
        .get(format!("http://127.0.0.1:{}/feed.xml", port))
        .send()
        .await
        .unwrap_err();

    let code = classify_fetch_error(&error);

    assert!(
        matches!(code, FeedError::NetworkReadTimeout | FeedError::NetworkConnectionTimeout),
        "expected a timeout code, got {:?}",
        code
    );

    drop(listener);
}

#[tokio::test]
async fn redirect_loop_maps_to_too_many_redirects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let response = format!(
        "HTTP/1.1 302 Found\r\n\
         Location: http://127.0.0.1:{}/loop\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        port
    );

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };

            let response = response.clone();

            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    let error = client()
        .get(format!("http://127.0.0.1:{}/feed.xml", port))
        .send()
        .await
        .unwrap_err();

    assert_eq!(classify_fetch_error(&error), FeedError::NetworkTooManyRedirects);
}

#[tokio::test]
async fn unclassified_errors_fall_back_to_unknown() {
    // A malformed request URL fails before anything reaches the network and
    // matches nothing in the taxonomy.
    let error = reqwest::Client::new()
        .get("not a feed url")
        .send()
        .await
        .unwrap_err();

    assert_eq!(classify_fetch_error(&error), FeedError::NetworkUnknown);
}
