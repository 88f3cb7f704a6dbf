use tokio::net::TcpListener;
use tokio::sync::watch;

use xapi_bridge::server::serve_status;

#[tokio::test]
async fn answers_ok_until_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(serve_status(listener, rx));

    for path in ["/", "/health"] {
        let response = reqwest::get(format!("http://{}{}", addr, path)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    let missing = reqwest::get(format!("http://{}/nope", addr)).await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    shutdown.send_replace(true);
    handle.await.unwrap().unwrap();
}
