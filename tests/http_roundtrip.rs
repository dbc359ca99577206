//! End-to-end tests over real sockets: an `EventServer` on an ephemeral port
//! and nodes talking to it through `HttpPeerClient`.

#[cfg(test)]
mod tests {
    use dsync::{
        EmitOptions, EventRecord, EventServer, HandlerOptions, HttpPeerClient, NodeOptions,
        PeerTransport, SyncNode,
    };
    use serde_json::{json, Map, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Running {
        url: String,
        node: Arc<SyncNode>,
        shutdown: CancellationToken,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start_node(name: &str) -> Running {
        let options = NodeOptions {
            name: name.to_string(),
            fixed_delay: Some(Duration::ZERO),
            ..NodeOptions::default()
        };
        let node =
            Arc::new(SyncNode::with_http("dsync", options, Some(Duration::from_secs(5))).unwrap());
        let server = EventServer::bind("127.0.0.1:0", node.clone()).await.unwrap();
        let url = format!("http://{}", server.local_addr().unwrap());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            server.run(token).await.unwrap();
        });

        Running {
            url,
            node,
            shutdown,
        }
    }

    fn sender() -> SyncNode {
        let options = NodeOptions {
            fixed_delay: Some(Duration::ZERO),
            ..NodeOptions::default()
        };
        SyncNode::with_http("dsync", options, Some(Duration::from_secs(5))).unwrap()
    }

    #[tokio::test]
    async fn test_emit_over_http_returns_handler_value() {
        let remote = start_node("remote").await;
        remote.node.on_sync("ping", HandlerOptions::new(), |input| {
            json!({ "pong": true, "from": input.source })
        });

        let local = sender();
        local.add_peer(&remote.url);
        let mut payload = Map::new();
        payload.insert("n".to_string(), json!(1));
        let outcomes = local.emit("ping", payload, EmitOptions::new()).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].peer, remote.url);
        assert_eq!(outcomes[0].data(), Some(&json!({ "pong": true, "from": "self" })));
        assert_eq!(remote.node.ledger().len(), 1);
    }

    #[tokio::test]
    async fn test_caller_ip_is_rate_limited_over_http() {
        let remote = start_node("remote").await;
        remote
            .node
            .on_sync("ping", HandlerOptions::new().ip_request_limit(1), |_| json!("pong"));

        let local = sender();
        local.add_peer(&remote.url);
        let first = local.emit("ping", Map::new(), EmitOptions::new()).await;
        let second = local.emit("ping", Map::new(), EmitOptions::new()).await;

        assert_eq!(first[0].data(), Some(&json!("pong")));
        let limited = second[0].data().unwrap();
        assert_eq!(limited["error"], json!("Rate limit exceeded"));
        assert_eq!(limited["ipRateLimited"], json!(true));
        assert_eq!(limited["rateLimitedIP"], json!("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_no_handler_gives_empty_body() {
        let remote = start_node("remote").await;
        let client = HttpPeerClient::new("dsync", Duration::from_secs(5)).unwrap();

        let record = EventRecord {
            event: "nobody-listens".to_string(),
            payload: Map::new(),
            event_id: "e-1".to_string(),
            source: "self".to_string(),
        };
        let response = client.send(&remote.url, &record).await.unwrap();

        assert_eq!(response, None);
        assert!(remote.node.ledger().has_seen_from("e-1", "self"));
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_protocol_errors() {
        let remote = start_node("remote").await;
        let endpoint = format!("{}/dsync", remote.url);
        let http = reqwest::Client::new();

        let garbage: Value = http
            .post(&endpoint)
            .body("not json at all")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(garbage, json!({ "error": "Missing eventId" }));

        let no_id: Value = http
            .post(&endpoint)
            .json(&json!({ "event": "ping", "payload": {} }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(no_id, json!({ "error": "Missing eventId" }));

        assert!(remote.node.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_mistyped_fields_do_not_hide_event_id() {
        let remote = start_node("remote").await;
        remote.node.on_sync("ping", HandlerOptions::new(), |input| {
            json!({ "eventId": input.event_id, "source": input.source })
        });
        let http = reqwest::Client::new();

        let response: Value = http
            .post(format!("{}/dsync", remote.url))
            .json(&json!({ "event": "ping", "payload": {}, "eventId": "e1", "source": 123 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response, json!({ "eventId": "e1", "source": "123" }));
        assert!(remote.node.ledger().has_seen_from("e1", "123"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        // Bind and immediately drop to get a port nobody listens on
        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let local = sender();
        local.add_peer(&format!("http://{}", closed));
        local.add_peer("ftp://example.invalid");
        let outcomes = local.emit("ping", Map::new(), EmitOptions::new()).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.is_delivered()));
        assert!(outcomes[1].error().unwrap().contains("ftp://example.invalid"));
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let remote = start_node("status-node").await;
        remote.node.add_peer("http://10.0.0.9:24180/");
        remote.node.on_sync("ping", HandlerOptions::new(), |_| json!("pong"));

        let status: Value = reqwest::get(format!("{}/dsync/status", remote.url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(status["node"], json!("status-node"));
        assert_eq!(status["prefix"], json!("dsync"));
        assert_eq!(status["peers"], json!(["http://10.0.0.9:24180"]));
        assert_eq!(status["handlers"], json!(1));
        assert_eq!(status["events"], json!(["ping"]));
    }
}
