//! End-to-end routing through a running router.

use std::time::Duration;

use droplet_router::mbus::{subjects, MessageBus};

mod common;

#[tokio::test]
async fn test_routes_to_registered_backend() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = common::start_mock_backend("200 OK", "", "hello from droplet").await;
    common::register(&router, &bus, backend, "foo.vcap.me", "app-1", "").await;

    let res = common::client()
        .get(format!("http://{}/some/path?x=1", router.proxy_addr()))
        .header("Host", "foo.vcap.me")
        .send()
        .await
        .expect("Proxy unreachable");

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "hello from droplet");

    let varz = router.varz().snapshot();
    assert_eq!(varz.all.requests, 1);
    assert_eq!(varz.all.responses_2xx, 1);
    assert_eq!(varz.urls, 1);
    assert_eq!(varz.droplets, 1);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_host_port_is_ignored_and_case_folded() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = common::start_mock_backend("200 OK", "", "ok").await;
    common::register(&router, &bus, backend, "Foo.Vcap.Me", "", "").await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "FOO.vcap.me:8080")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let (router, _bus) = common::start_router(common::test_config()).await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "nobody.vcap.me")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 404);
    assert_eq!(router.varz().snapshot().bad_requests, 1);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_health_check_user_agent() {
    let (router, _bus) = common::start_router(common::test_config()).await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "nobody.vcap.me")
        .header("User-Agent", "HTTP-Monitor/1.1")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "ok\n");

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_dead_backend_is_502() {
    let (router, bus) = common::start_router(common::test_config()).await;

    // Bind then drop to get a port nothing listens on.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    common::register(&router, &bus, dead_addr, "dead.vcap.me", "app-dead", "").await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "dead.vcap.me")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 502);
    assert_eq!(router.varz().snapshot().all.responses_xxx, 1);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_forwarded_request_rewrites() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = common::start_echo_backend().await;
    common::register(&router, &bus, backend, "echo.vcap.me", "", "").await;

    let head = common::client()
        .get(format!("http://{}/echo?q=1", router.proxy_addr()))
        .header("Host", "echo.vcap.me")
        .header("X-Forwarded-For", "1.2.3.4")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
        .to_lowercase();

    assert!(head.starts_with("get /echo?q=1 http/1.1\r\n"), "{}", head);
    assert!(head.contains("x-forwarded-for: 1.2.3.4, 127.0.0.1\r\n"), "{}", head);
    assert!(head.contains("connection: close\r\n"), "{}", head);
    assert!(head.contains("host: echo.vcap.me\r\n"), "{}", head);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_trace_headers_with_matching_key() {
    let mut config = common::test_config();
    config.proxy.trace_key = "s3cret".to_string();
    let (router, bus) = common::start_router(config).await;
    let backend = common::start_mock_backend("200 OK", "", "traced").await;
    common::register(&router, &bus, backend, "trace.vcap.me", "", "").await;

    let client = common::client();
    let url = format!("http://{}/", router.proxy_addr());

    let res = client
        .get(&url)
        .header("Host", "trace.vcap.me")
        .header("X-Vcap-Trace", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-vcap-router"], "127.0.0.1");
    assert_eq!(res.headers()["x-vcap-backend"], backend.to_string().as_str());

    let res = client
        .get(&url)
        .header("Host", "trace.vcap.me")
        .header("X-Vcap-Trace", "wrong")
        .send()
        .await
        .unwrap();
    assert!(res.headers().get("x-vcap-router").is_none());
    assert!(res.headers().get("x-vcap-backend").is_none());

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_sticky_session_affinity() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let first = common::start_mock_backend("200 OK", "Set-Cookie: JSESSIONID=abc\r\n", "first").await;
    let second = common::start_mock_backend("200 OK", "Set-Cookie: JSESSIONID=abc\r\n", "second").await;
    common::register(&router, &bus, first, "sticky.vcap.me", "app", "instance-1").await;
    common::register(&router, &bus, second, "sticky.vcap.me", "app", "instance-2").await;

    let client = common::client();
    let url = format!("http://{}/", router.proxy_addr());

    let res = client.get(&url).header("Host", "sticky.vcap.me").send().await.unwrap();
    let cookies: Vec<_> = res
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    let body = res.text().await.unwrap();
    let instance = if body == "first" { "instance-1" } else { "instance-2" };
    assert!(cookies.contains(&format!("__VCAP_ID__={}; Path=/", instance)), "{:?}", cookies);

    for _ in 0..10 {
        let again = client
            .get(&url)
            .header("Host", "sticky.vcap.me")
            .header("Cookie", format!("JSESSIONID=abc; __VCAP_ID__={}", instance))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(again, body);
    }

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unregister_removes_route() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let backend = common::start_mock_backend("200 OK", "", "ok").await;
    common::register(&router, &bus, backend, "gone.vcap.me", "", "").await;

    let payload = serde_json::json!({
        "host": backend.ip().to_string(),
        "port": backend.port(),
        "uris": ["gone.vcap.me"],
    });
    bus.publish(subjects::UNREGISTER, payload.to_string().as_bytes()).unwrap();
    common::wait_for(|| router.registry().num_backends() == 0).await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "gone.vcap.me")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    router.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_streamed_body_is_delivered_whole() {
    let (router, bus) = common::start_router(common::test_config()).await;
    let body: &'static str = Box::leak("x".repeat(256 * 1024).into_boxed_str());
    let backend = common::start_mock_backend("200 OK", "Content-Type: text/plain\r\n", body).await;
    common::register(&router, &bus, backend, "big.vcap.me", "", "").await;

    let res = common::client()
        .get(format!("http://{}/", router.proxy_addr()))
        .header("Host", "big.vcap.me")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["content-type"], "text/plain");
    assert_eq!(res.text().await.unwrap().len(), body.len());

    router.shutdown(Duration::from_secs(1)).await;
}
